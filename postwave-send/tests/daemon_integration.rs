//! Integration tests for the postwave-send daemon binary

use libpostwave::{Database, Post, PostStatus, PublishStore};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const KEY_ENV: &str = "POSTWAVE_DAEMON_TEST_KEY";

fn binary() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_postwave-send"));
    cmd.env_remove("POSTWAVE_CONFIG")
        .env_remove("POSTWAVE_LOG_FORMAT")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path) -> (PathBuf, PathBuf) {
    let db_path = dir.join("postwave.db");
    let config_path = dir.join("config.toml");
    let config = format!(
        r#"
[database]
path = "{}"

[security]
encryption_key_env = "{}"

[publishing]
poll_interval = "1s"
"#,
        db_path.display().to_string().replace('\\', "/"),
        KEY_ENV
    );
    std::fs::write(&config_path, config).unwrap();
    (config_path, db_path)
}

fn run_once(config_path: &Path) -> Output {
    binary()
        .arg("--config")
        .arg(config_path)
        .arg("--once")
        .env(KEY_ENV, "42".repeat(32))
        .output()
        .unwrap()
}

#[test]
fn test_help_describes_daemon() {
    let output = binary().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("postwave-send"));
    assert!(stdout.contains("--once"));
    assert!(stdout.contains("--no-sweep"));
    assert!(stdout.contains("EXIT CODES"));
}

#[test]
fn test_missing_config_exits_with_config_code() {
    let temp_dir = TempDir::new().unwrap();
    let output = binary()
        .arg("--config")
        .arg(temp_dir.path().join("absent.toml"))
        .arg("--once")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_encryption_key_exits_with_config_code() {
    let temp_dir = TempDir::new().unwrap();
    let (config_path, _) = write_config(temp_dir.path());

    let output = binary()
        .arg("--config")
        .arg(&config_path)
        .arg("--once")
        .env_remove(KEY_ENV)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains(KEY_ENV));
}

#[test]
fn test_once_with_empty_queue_succeeds() {
    let temp_dir = TempDir::new().unwrap();
    let (config_path, db_path) = write_config(temp_dir.path());

    let output = run_once(&config_path);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(db_path.exists());
}

#[tokio::test]
async fn test_once_fails_post_for_unconfigured_platform() {
    let temp_dir = TempDir::new().unwrap();
    let (config_path, db_path) = write_config(temp_dir.path());

    let mut post = Post::new("user-1", "hello from the daemon");
    post.platforms = vec!["twitter".to_string()];
    {
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        db.create_post(&post).await.unwrap();
        db.pool().close().await;
    }

    let output = run_once(&config_path);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
    let stored = db.get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert!(stored.fail_reason.unwrap().contains("twitter"));
    assert_eq!(stored.attempt_count, 1);
}
