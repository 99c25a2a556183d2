//! Command runner and secret accessor tests against real child processes.

#![cfg(unix)]

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chain_of_trust::{
    CommandInvocation, CommandRunner, ExecutionError, Platform, SecretAccessor, SecretError,
    TokioCommandRunner,
};
use tempfile::TempDir;

#[tokio::test]
async fn timed_out_child_is_killed_and_reaped() {
    let inv = CommandInvocation::new("/bin/sleep", vec!["30".to_string()]);
    let started = Instant::now();

    let err = TokioCommandRunner
        .run(&inv, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::Timeout { .. }));
    // The call returned promptly rather than waiting out the child.
    assert!(started.elapsed() < Duration::from_secs(5));

    // No surviving child: every `sleep 30` visible to this process's
    // process table would have to be ours. Give the kernel a beat, then
    // assert the runner reaped it (a zombie would still show up under our
    // pid as a defunct child; `wait` in the runner prevents that).
    tokio::time::sleep(Duration::from_millis(100)).await;
    let ps = std::process::Command::new("ps")
        .args(["--ppid", &std::process::id().to_string(), "-o", "comm="])
        .output()
        .expect("ps must run");
    let children = String::from_utf8_lossy(&ps.stdout);
    assert!(
        !children.contains("sleep"),
        "timed-out child still alive: {children}"
    );
}

#[tokio::test]
async fn reads_signing_key_through_native_reader() {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("cot.key");
    let mut file = std::fs::File::create(&key_path).unwrap();
    file.write_all(hex::encode([0x5Au8; 32]).as_bytes()).unwrap();
    drop(file);

    let accessor = SecretAccessor::new(
        Arc::new(TokioCommandRunner),
        Platform::host(),
        Duration::from_secs(10),
    );

    let key = accessor.read_signing_key(&key_path).await.unwrap();
    assert_eq!(key.seed(), &[0x5Au8; 32]);
}

#[tokio::test]
async fn missing_key_file_is_unreadable() {
    let dir = TempDir::new().unwrap();
    let accessor = SecretAccessor::new(
        Arc::new(TokioCommandRunner),
        Platform::host(),
        Duration::from_secs(10),
    );

    let err = accessor
        .read_signing_key(&dir.path().join("missing.key"))
        .await
        .unwrap_err();
    assert!(matches!(err, SecretError::Unreadable(_)));
}

#[tokio::test]
async fn empty_key_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("empty.key");
    std::fs::File::create(&key_path).unwrap();

    let accessor = SecretAccessor::new(
        Arc::new(TokioCommandRunner),
        Platform::host(),
        Duration::from_secs(10),
    );

    let err = accessor.read_signing_key(&key_path).await.unwrap_err();
    assert!(matches!(err, SecretError::Empty));
}
