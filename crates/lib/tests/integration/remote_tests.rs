use ybd_lib::store::{ArchiveFormat, Store, write_archive};

use super::common::{TestEnv, write_file};

const CHUNK: &str = "name: a\ninstall-commands:\n- mkdir -p \"$DESTDIR/etc\"\n- echo local > \"$DESTDIR/etc/a\"\n";

#[tokio::test]
async fn remote_hit_skips_the_build() {
  let env = TestEnv::new();
  env.define("chunks/a.def", CHUNK);
  let key = env.key_of("chunks/a.def", "chunks/a.def").await;

  let tree = env.temp.path().join("remote-tree");
  write_file(&tree, "etc/a", "remote\n");
  let archive = env.temp.path().join("remote.tar.gz");
  write_archive(&tree, &archive, ArchiveFormat::Gzip).unwrap();

  let mut server = mockito::Server::new_async().await;
  let mock = server
    .mock("GET", format!("/get/{key}").as_str())
    .with_status(200)
    .with_body(std::fs::read(&archive).unwrap())
    .create_async()
    .await;

  let config = env.config(&format!("kbas-url: {}/\n", server.url()));
  let summary = env.build(&config, "chunks/a.def").await;

  mock.assert_async().await;
  assert_eq!(summary.key, key);
  assert_eq!(summary.fetched, 1);
  assert_eq!(summary.built, 0);
  let unpacked = Store::new(config.artifacts()).get(&key).unwrap().unwrap();
  assert_eq!(std::fs::read_to_string(unpacked.join("etc/a")).unwrap(), "remote\n");
}

#[tokio::test]
async fn built_chunks_are_uploaded_with_a_password() {
  let env = TestEnv::new();
  env.define("chunks/a.def", CHUNK);

  let mut server = mockito::Server::new_async().await;
  let upload = server
    .mock("POST", "/upload")
    .with_status(201)
    .expect(1)
    .create_async()
    .await;

  let config = env.config(&format!("kbas-url: {}/\nkbas-password: secret\n", server.url()));
  let summary = env.build(&config, "chunks/a.def").await;

  upload.assert_async().await;
  assert_eq!(summary.built, 1);
  assert_eq!(summary.fetched, 0);
}

#[tokio::test]
async fn unreachable_remote_falls_back_to_building() {
  let env = TestEnv::new();
  env.define("chunks/a.def", CHUNK);

  let config = env.config("kbas-url: http://127.0.0.1:9/\n");
  let summary = env.build(&config, "chunks/a.def").await;

  assert_eq!(summary.built, 1);
  let unpacked = Store::new(config.artifacts()).get(&summary.key).unwrap().unwrap();
  assert_eq!(std::fs::read_to_string(unpacked.join("etc/a")).unwrap(), "local\n");
}
