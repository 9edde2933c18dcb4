//! Directory watches against the fake service.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::mpsc;
use std::time::Duration;

use common::{FakeServer, SILENT_DIR};
use sbx::{Client, Code, WatchEvent};

const WAIT: Duration = Duration::from_secs(5);

const WATCH_PATH: &str = "/filesystem.Filesystem/WatchDir";

fn quiet_client(server: &FakeServer) -> Client {
    Client::builder(server.url())
        .keepalive_interval(None)
        .build()
        .unwrap()
}

#[test]
fn events_then_stream_end_reported_once() {
    let server = FakeServer::start();
    let (tx, rx) = mpsc::channel::<sbx::Result<WatchEvent>>();
    let handle = server
        .client()
        .filesystem()
        .watch_dir("/work", true, tx)
        .unwrap();
    assert_eq!(handle.path(), "/work");

    let path = "/work/a.txt".to_owned();
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().unwrap(),
        WatchEvent::Create { path: path.clone() }
    );
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().unwrap(),
        WatchEvent::Write { path: path.clone() }
    );
    // The unspecified event is skipped.
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().unwrap(),
        WatchEvent::Remove { path }
    );
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), Some(Code::NotFound));
    // The pump thread exits and drops the sender.
    assert!(rx.recv_timeout(WAIT).is_err());

    let request = server.last_request("/filesystem.Filesystem/WatchDir").unwrap();
    assert_eq!(request.headers["content-type"], "application/connect+json");
}

#[test]
fn closure_handler() {
    let server = FakeServer::start();
    let (tx, rx) = mpsc::channel();
    let _handle = server
        .client()
        .filesystem()
        .watch_dir("/w", false, move |ev: WatchEvent| {
            let _ = tx.send(ev.path().to_owned());
        })
        .unwrap();
    let first = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(first, "/w/a.txt");
}

#[test]
fn stop_closes_a_silent_stream() {
    let server = FakeServer::start();
    let (tx, rx) = mpsc::channel::<sbx::Result<WatchEvent>>();
    let handle = quiet_client(&server)
        .filesystem()
        .watch_dir(SILENT_DIR, false, tx)
        .unwrap();
    assert!(!server.wait_closed(WATCH_PATH, Duration::from_millis(200)));

    handle.stop();
    assert!(server.wait_closed(WATCH_PATH, WAIT));
    // The pump exits without reporting anything.
    assert!(matches!(
        rx.recv_timeout(WAIT),
        Err(mpsc::RecvTimeoutError::Disconnected)
    ));
}

#[test]
fn dropping_the_handle_closes_the_stream() {
    let server = FakeServer::start();
    let handle = quiet_client(&server)
        .filesystem()
        .watch_dir(SILENT_DIR, true, |_: WatchEvent| {})
        .unwrap();
    drop(handle);
    assert!(server.wait_closed(WATCH_PATH, WAIT));
}
