//! Local transfer agent integration tests
//!
//! Each test drives a full control-protocol session against a store in a
//! temp directory.

use lfsagent_core::config::keys;
use lfsagent_core::{Agent, Exit, GitConfig, LocalConnector, Oid, Scope, StaticConfig, storage_path};
use serde_json::Value;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Setup {
    tmp: TempDir,
    store_repo: PathBuf,
}

impl Setup {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let store_repo = tmp.path().join("store.git");
        fs::create_dir_all(store_repo.join("lfs/objects")).unwrap();
        fs::create_dir_all(tmp.path().join("work/.git")).unwrap();
        Self { tmp, store_repo }
    }

    fn config(&self) -> StaticConfig {
        StaticConfig::new(self.tmp.path().join("work/.git"))
            .with("remote.origin.url", self.store_repo.to_str().unwrap())
    }

    fn write_source(&self, name: &str, data: &[u8]) -> (PathBuf, Oid) {
        let path = self.tmp.path().join("work").join(name);
        fs::write(&path, data).unwrap();
        (path, Oid::from_data(data))
    }

    fn stored(&self, oid: &Oid) -> PathBuf {
        storage_path(&self.store_repo.join("lfs/objects"), oid)
    }
}

fn init_line() -> String {
    r#"{"event":"init","operation":"upload","remote":"origin","concurrent":true,"concurrenttransfers":8}"#.to_string()
}

fn upload_line(oid: &Oid, size: usize, path: &Path) -> String {
    serde_json::json!({
        "event": "upload",
        "oid": oid.to_hex(),
        "size": size,
        "path": path,
        "action": null,
    })
    .to_string()
}

fn download_line(oid: &Oid, size: usize) -> String {
    serde_json::json!({"event": "download", "oid": oid.to_hex(), "size": size}).to_string()
}

async fn run_session(config: StaticConfig, lines: &[String]) -> (Exit, Vec<Value>) {
    let mut input = lines.join("\n");
    input.push('\n');
    let mut agent = Agent::new(LocalConnector::new(Arc::new(config)));
    let mut out = Vec::new();
    let exit = agent.run(input.as_bytes(), &mut out).await.unwrap();
    let responses = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    (exit, responses)
}

#[tokio::test]
async fn test_upload_then_download() {
    let setup = Setup::new();
    let data = b"a large binary asset";
    let (src, oid) = setup.write_source("asset.bin", data);

    let (exit, responses) = run_session(
        setup.config(),
        &[
            init_line(),
            upload_line(&oid, data.len(), &src),
            download_line(&oid, data.len()),
            r#"{"event":"terminate"}"#.to_string(),
        ],
    )
    .await;

    assert_eq!(exit, Exit::Terminated);
    assert_eq!(responses.len(), 5);
    assert_eq!(responses[0], serde_json::json!({}));
    assert_eq!(responses[1]["event"], "progress");
    assert_eq!(responses[1]["bytesSoFar"], data.len());
    assert_eq!(responses[1]["bytesSinceLast"], data.len());
    assert_eq!(responses[2]["event"], "complete");
    assert!(responses[2].get("error").is_none());

    let stored = setup.stored(&oid);
    assert_eq!(fs::read(&stored).unwrap(), data);
    // same owner, same device: linked rather than copied
    assert_eq!(fs::metadata(&stored).unwrap().ino(), fs::metadata(&src).unwrap().ino());

    let fetched = PathBuf::from(responses[4]["path"].as_str().unwrap());
    assert!(fetched.starts_with(setup.tmp.path().join("work/.git/lfs/tmp")));
    assert_eq!(fs::read(fetched).unwrap(), data);
}

#[tokio::test]
async fn test_duplicate_upload_is_a_no_op() {
    let setup = Setup::new();
    let data = b"uploaded twice";
    let (src, oid) = setup.write_source("twice.bin", data);

    let (exit, responses) = run_session(
        setup.config(),
        &[
            init_line(),
            upload_line(&oid, data.len(), &src),
            upload_line(&oid, data.len(), &src),
        ],
    )
    .await;

    assert_eq!(exit, Exit::EndOfInput);
    assert_eq!(responses.len(), 5);
    assert!(responses.iter().all(|r| r.get("error").is_none()));

    let stored = setup.stored(&oid);
    let shard = stored.parent().unwrap();
    let names: Vec<_> = fs::read_dir(shard).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(names, vec![std::ffi::OsString::from(oid.to_hex())]);
}

#[tokio::test]
async fn test_failures_are_per_object() {
    let setup = Setup::new();
    let data = b"good object";
    let (src, oid) = setup.write_source("good.bin", data);
    let missing = Oid::from_data(b"never uploaded");

    let (exit, responses) = run_session(
        setup.config(),
        &[
            init_line(),
            upload_line(&oid, data.len() + 1, &src),
            download_line(&missing, 14),
            upload_line(&oid, data.len(), &src),
        ],
    )
    .await;

    assert_eq!(exit, Exit::EndOfInput);
    assert_eq!(responses.len(), 5);
    assert_eq!(responses[1]["event"], "complete");
    assert_eq!(responses[1]["error"]["code"], 3);
    assert_eq!(responses[2]["oid"], missing.to_hex());
    assert_eq!(responses[2]["error"]["code"], 3);
    assert_eq!(responses[3]["event"], "progress");
    assert!(responses[4].get("error").is_none());
    assert!(setup.stored(&oid).exists());
}

#[tokio::test]
async fn test_init_with_missing_store_fails() {
    let setup = Setup::new();
    let config = StaticConfig::new(setup.tmp.path().join("work/.git"))
        .with("remote.origin.url", setup.tmp.path().join("nowhere").to_str().unwrap());
    let mut agent = Agent::new(LocalConnector::new(Arc::new(config)));
    let mut out = Vec::new();
    let input = format!("{}\n", init_line());

    let err = agent.run(input.as_bytes(), &mut out).await.unwrap_err();
    assert_eq!(err.code().as_i32(), 3);

    let reply: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(reply["error"]["code"], 3);
    assert!(!agent.is_configured());
}

#[tokio::test]
async fn test_init_with_missing_repository_reports_path_error() {
    let setup = Setup::new();
    let missing = setup.tmp.path().join("no-such-repo");
    let mut agent = Agent::new(LocalConnector::new(Arc::new(GitConfig::new())));
    let mut out = Vec::new();
    let input = format!(
        "{}\n",
        serde_json::json!({"event": "init", "operation": "upload", "remote": missing})
    );

    let err = agent.run(input.as_bytes(), &mut out).await.unwrap_err();
    assert_eq!(err.code().as_i32(), 3, "{}", err);
    let reply: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(reply["error"]["code"], 3);
}

#[tokio::test]
async fn test_shared_repository_creates_group_dirs() {
    let setup = Setup::new();
    let config = setup
        .config()
        .with_scoped(Scope::At(setup.store_repo.clone()), keys::SHARED_REPOSITORY, "group");
    let data = b"team asset";
    let (src, oid) = setup.write_source("team.bin", data);

    let (_, responses) = run_session(config, &[init_line(), upload_line(&oid, data.len(), &src)]).await;
    assert!(responses[2].get("error").is_none());

    let inner = setup.stored(&oid).parent().unwrap().to_path_buf();
    for dir in [inner.parent().unwrap(), inner.as_path()] {
        assert_eq!(fs::metadata(dir).unwrap().mode() & 0o7777, 0o2770);
    }
}
