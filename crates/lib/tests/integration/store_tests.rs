use ybd_lib::run::{RunError, run};
use ybd_lib::store::{ArchiveFormat, Store, StoreError};

use super::common::{TestEnv, write_file};

const CHUNK: &str = "name: a\ninstall-commands:\n- mkdir -p \"$DESTDIR/etc\"\n- echo a > \"$DESTDIR/etc/a\"\n";

#[tokio::test]
async fn startup_cull_spares_live_artifacts() {
  let env = TestEnv::new();
  env.define("chunks/a.def", CHUNK);
  let config = env.config("");
  let live = env.build(&config, "chunks/a.def").await.key;

  let store = Store::new(config.artifacts());
  let tree = env.temp.path().join("stale-tree");
  write_file(&tree, "etc/old", "old\n");
  store.put("old.0123", &tree, ArchiveFormat::Gzip).unwrap();

  // No disk has this much room, so every unneeded entry goes.
  let greedy = env.config("min-gigabytes: 1000000000\n");
  let err = run(&greedy, &env.target("chunks/a.def")).await.unwrap_err();

  assert!(matches!(err, RunError::Store(StoreError::InsufficientSpace { .. })), "{err}");
  assert!(!store.contains("old.0123"));
  assert!(store.contains(&live));
}

#[tokio::test]
async fn trees_are_recorded_for_the_next_run() {
  let env = TestEnv::new();
  env.define("chunks/a.def", CHUNK);
  let config = env.config("");

  env.build(&config, "chunks/a.def").await;

  let trees = config.artifacts().join(ybd_lib::consts::TREES_FILE);
  assert!(trees.is_file());
}
