use assert_cmd::Command;
use cluster_reindexer::{
    DocumentType, FileReindexingStore, ProgressToken, Reindexing, ReindexingStore, Status,
};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

fn reindexer() -> Command {
    Command::cargo_bin("reindexer").unwrap()
}

fn seed(path: &Path) -> FileReindexingStore {
    let store = FileReindexingStore::new("music", path);
    let reindexing = Reindexing::empty().with(
        DocumentType::new("music"),
        Status::ready(UNIX_EPOCH + Duration::from_millis(1_000))
            .running()
            .progressed(ProgressToken::with_buckets(2, 8))
            .halted(),
    );
    store.write(&reindexing).unwrap();
    store
}

#[test]
fn status_lists_stored_types() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("music.json");
    seed(&path);

    let output = reindexer()
        .args(["status", "--store"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.trim(), "music: halted (ready at 1000, 25.0% done)");
}

#[test]
fn status_json_is_the_stored_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("music.json");
    seed(&path);

    let output = reindexer()
        .args(["status", "--json", "--store"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let printed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let stored: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(printed, stored);
    assert_eq!(printed["status"]["music"]["state"], "halted");
}

#[test]
fn status_from_config_shows_pending_types() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("reindexer.toml");
    std::fs::write(
        &config,
        r#"
store_path = "music.json"

[cluster]
name = "music"
config_id = "id"

[cluster.bucket_spaces]
music = "default"
books = "global"

[ready_at]
books = 5000
"#,
    )
    .unwrap();
    seed(&dir.path().join("music.json"));

    let output = reindexer().arg("status").arg("--config").arg(&config).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "music: halted (ready at 1000, 25.0% done)",
            "books: not started, due at 5000",
        ]
    );
}

#[test]
fn unlock_releases_held_lock() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("music.json");
    let store = seed(&path);
    let _held = store.lock(Duration::ZERO).unwrap();

    let output = reindexer()
        .args(["lock-info", "--json", "--store"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(info["owner"].is_string());

    reindexer()
        .args(["unlock", "--store"])
        .arg(&path)
        .assert()
        .success();
    assert_eq!(store.lock_info().unwrap(), None);

    let output = reindexer()
        .args(["unlock", "--store"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(String::from_utf8(output.stdout).unwrap().starts_with("Not locked"));
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().unwrap();
    reindexer()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .failure();
}
