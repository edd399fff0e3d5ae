use ybd_lib::store::Store;

use super::common::{GitRepo, TestEnv, doc_chunk};

fn stratum(repo: &GitRepo) -> String {
  format!(
    "name: core\nkind: stratum\nchunks:\n- name: doc\n  morph: chunks/doc.def\n  repo: {}\n  ref: master\n",
    repo.url()
  )
}

const SYSTEM: &str = "name: sys\nkind: system\narch: x86_64\nstrata:\n- morph: strata/core.def\n";

#[tokio::test]
async fn leaf_chunk_from_git() {
  let env = TestEnv::new();
  let repo = GitRepo::init(&env.temp.path().join("src/doc"), &[("README", "hello\n")]);
  env.define("chunks/doc.def", &doc_chunk("doc"));
  env.define("strata/core.def", &stratum(&repo));
  let config = env.config("");

  let summary = env.build(&config, "chunks/doc.def").await;

  assert!(summary.key.starts_with("doc."));
  assert_eq!(summary.built, 1);
  let unpacked = Store::new(config.artifacts()).get(&summary.key).unwrap().unwrap();
  let readme = std::fs::read_to_string(unpacked.join("usr/share/doc/doc/README")).unwrap();
  assert_eq!(readme, "hello\n");
  assert!(unpacked.join("baserock/doc.meta").is_file());
}

#[tokio::test]
async fn second_run_reuses_artifacts() {
  let env = TestEnv::new();
  let repo = GitRepo::init(&env.temp.path().join("src/doc"), &[("README", "hello\n")]);
  env.define("chunks/doc.def", &doc_chunk("doc"));
  env.define("strata/core.def", &stratum(&repo));
  let config = env.config("");

  let first = env.build(&config, "strata/core.def").await;
  assert_eq!(first.built, 2);

  let second = env.build(&config, "strata/core.def").await;
  assert_eq!(second.key, first.key);
  assert_eq!(second.built, 0);
}

#[tokio::test]
async fn source_change_rebuilds_the_stratum() {
  let env = TestEnv::new();
  let repo = GitRepo::init(&env.temp.path().join("src/doc"), &[("README", "hello\n")]);
  env.define("chunks/doc.def", &doc_chunk("doc"));
  env.define("strata/core.def", &stratum(&repo));
  let config = env.config("");

  let first = env.build(&config, "strata/core.def").await;
  repo.commit(&[("README", "goodbye\n")]);
  let second = env.build(&config, "strata/core.def").await;

  assert_ne!(second.key, first.key);
  assert_eq!(second.built, 2);
}

#[tokio::test]
async fn dependency_edit_changes_dependents_only() {
  let env = TestEnv::new();
  let install = |file: &str| format!("install-commands:\n- mkdir -p \"$DESTDIR/etc\"\n- echo {file} > \"$DESTDIR/etc/{file}\"\n");
  env.define("chunks/a.def", &format!("name: a\n{}", install("a")));
  env.define("chunks/b.def", &format!("name: b\nbuild-depends: [chunks/a.def]\n{}", install("b")));
  env.define("chunks/c.def", &format!("name: c\n{}", install("c")));

  let b_before = env.key_of("chunks/b.def", "chunks/b.def").await;
  let c_before = env.key_of("chunks/c.def", "chunks/c.def").await;

  env.define("chunks/a.def", &format!("name: a\n{}", install("a2")));

  assert_ne!(env.key_of("chunks/b.def", "chunks/b.def").await, b_before);
  assert_eq!(env.key_of("chunks/c.def", "chunks/c.def").await, c_before);
}

#[tokio::test]
async fn system_contains_its_strata() {
  let env = TestEnv::new();
  let repo = GitRepo::init(&env.temp.path().join("src/doc"), &[("README", "hello\n")]);
  env.define("chunks/doc.def", &doc_chunk("doc"));
  env.define("strata/core.def", &stratum(&repo));
  env.define("systems/sys.def", SYSTEM);
  let config = env.config("");

  let summary = env.build(&config, "systems/sys.def").await;

  assert!(summary.key.starts_with("sys."));
  assert_eq!(summary.built, 3);
  let store = Store::new(config.artifacts());
  assert!(store.archive_path(&summary.key).is_file());
  let unpacked = store.get(&summary.key).unwrap().unwrap();
  assert!(unpacked.join("usr/share/doc/doc/README").is_file());
  assert!(unpacked.join("baserock/doc.meta").is_file());
  assert!(!unpacked.join("sys.build").exists());
}

#[tokio::test]
async fn failed_command_preserves_the_sandbox() {
  let env = TestEnv::new();
  env.define("chunks/bad.def", "name: bad\ninstall-commands:\n- exit 3\n");
  let config = env.config("");

  let err = ybd_lib::run::run(&config, &env.target("chunks/bad.def")).await.unwrap_err();

  assert!(err.to_string().contains("bad"), "{err}");
  let leftovers: Vec<_> = std::fs::read_dir(config.tmp())
    .unwrap()
    .filter_map(Result::ok)
    .filter(|e| e.path().join("bad.build").is_dir())
    .collect();
  assert_eq!(leftovers.len(), 1);
}

#[tokio::test]
async fn parse_only_orders_dependencies_first() {
  let env = TestEnv::new();
  let repo = GitRepo::init(&env.temp.path().join("src/doc"), &[("README", "hello\n")]);
  env.define("chunks/doc.def", &doc_chunk("doc"));
  env.define("strata/core.def", &stratum(&repo));
  env.define("systems/sys.def", SYSTEM);

  let outcome = ybd_lib::run::run(&env.config("mode: parse-only\n"), &env.target("systems/sys.def"))
    .await
    .unwrap();
  let ybd_lib::run::Outcome::Order(order) = outcome else {
    panic!("expected an order");
  };
  assert_eq!(order, vec!["chunks/doc.def", "strata/core.def", "systems/sys.def"]);
}
