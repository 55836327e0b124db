//! Shared helpers for the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use repmgr_core::frame::InputState;
use repmgr_core::protocol::Message;
use repmgr_core::{
    ElectionTrigger, Eid, Error, MessageHandler, NoopHandler, RepMgr, RepMgrConfig, Result,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Forwards every REP_MESSAGE to a channel
pub struct Collect {
    tx: mpsc::UnboundedSender<(Eid, Bytes, Bytes)>,
}

impl Collect {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Eid, Bytes, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl MessageHandler for Collect {
    fn handle(&self, from: Eid, control: Bytes, record: Bytes) -> Result<()> {
        self.tx
            .send((from, control, record))
            .map_err(|_| Error::Shutdown)
    }
}

/// Counts election requests
#[derive(Default)]
pub struct Elections {
    pub calls: AtomicUsize,
}

impl Elections {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ElectionTrigger for Elections {
    fn start_election(&self, _lost_master: Eid, _retry_after: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Route manager logs to the test harness; `RUST_LOG=repmgr_core=debug`
/// shows them
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn start_quiet(config: RepMgrConfig) -> Arc<RepMgr> {
    init_logging();
    RepMgr::start(config, Arc::new(NoopHandler), Arc::new(NoopHandler))
        .await
        .unwrap()
}

/// Poll `check` until it holds, failing the test after ten seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read one complete message from a raw peer socket
pub async fn read_message(stream: &mut TcpStream, input: &mut InputState) -> Message {
    loop {
        let n = stream.read(input.read_buf()).await.unwrap();
        assert!(n > 0, "connection closed while waiting for a message");
        if let Some(message) = input.advance(n).unwrap() {
            return message;
        }
    }
}

/// Whether the other end closes the socket within a few seconds
pub async fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 256];
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

/// A local port nothing listens on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
