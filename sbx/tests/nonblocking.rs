//! Async adapters against the fake service.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{FakeServer, SILENT_CMD};
use sbx::nonblocking::{AsyncCommands, AsyncFilesystem};
use sbx::{Code, Error, Output, ProcessConfig, StartOptions, WatchEvent};

#[tokio::test]
async fn run_command() {
    let server = FakeServer::start();
    let commands = AsyncCommands::new(&server.client());
    let result = commands
        .run("printf async", StartOptions::new())
        .await
        .unwrap();
    assert_eq!(result.stdout, "async");
}

#[tokio::test]
async fn stream_output_then_wait() {
    let server = FakeServer::start();
    let commands = AsyncCommands::new(&server.client());
    let mut handle = commands
        .start(ProcessConfig::new("printf").args(["one"]), StartOptions::new())
        .await
        .unwrap();
    assert_eq!(
        handle.next_output().await,
        Some(Output::Stdout(b"one".to_vec()))
    );
    assert_eq!(handle.next_output().await, None);
    let result = handle.wait().await.unwrap();
    assert_eq!(result.stdout, "one");
    assert_eq!(handle.get_ref().unwrap().stdout(), "one");
}

#[tokio::test]
async fn abandoned_output_read_is_canceled() {
    let server = FakeServer::start();
    let commands = AsyncCommands::new(&server.client());
    let mut handle = commands
        .start(ProcessConfig::new(SILENT_CMD), StartOptions::new())
        .await
        .unwrap();
    let pending = tokio::time::timeout(Duration::from_millis(100), handle.next_output()).await;
    assert!(pending.is_err());

    assert_eq!(handle.next_output().await, None);
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.code(), Some(Code::Canceled));
    // Unblocks the abandoned read so the runtime can shut down.
    handle.control().disconnect();
}

#[tokio::test]
async fn kill_while_waiting() {
    let server = FakeServer::start();
    let commands = AsyncCommands::new(&server.client());
    let mut handle = commands
        .start(ProcessConfig::new("sleep").args(["30"]), StartOptions::new())
        .await
        .unwrap();
    assert!(handle.kill().await.unwrap());
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, Error::CommandExit(ref e) if e.exit_code != 0));
    assert!(!commands.kill(handle.control().selector()).await.unwrap());
}

#[tokio::test]
async fn list_is_empty_without_processes() {
    let server = FakeServer::start();
    let commands = AsyncCommands::new(&server.client());
    assert!(commands.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn watch_into_tokio_channel() {
    let server = FakeServer::start();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<sbx::Result<WatchEvent>>();
    let _handle = AsyncFilesystem::new(&server.client())
        .watch_dir("/data", false, tx)
        .await
        .unwrap();
    let first = rx.recv().await.unwrap().unwrap();
    assert_eq!(
        first,
        WatchEvent::Create {
            path: "/data/a.txt".into()
        }
    );
    let mut last = None;
    while let Some(item) = rx.recv().await {
        last = Some(item);
    }
    assert_eq!(last.unwrap().unwrap_err().code(), Some(Code::NotFound));
}
