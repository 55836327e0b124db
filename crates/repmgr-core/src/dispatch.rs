//! Message-processing threads and the collaborators they call into
//!
//! Reader tasks only parse frames. Complete REP_MESSAGE and ACK messages are
//! handed over a channel to a small pool of OS threads, so a slow
//! [`MessageHandler`] never stalls socket I/O.

use crate::protocol::Message;
use crate::site::Eid;
use crate::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// Consumer of replication traffic, usually the log engine
pub trait MessageHandler: Send + Sync {
    /// Process one REP_MESSAGE from site `from`. Errors are logged and the
    /// message is dropped; the connection stays up.
    fn handle(&self, from: Eid, control: Bytes, record: Bytes) -> Result<()>;
}

/// Hook into the election algorithm
pub trait ElectionTrigger: Send + Sync {
    /// The connection to `lost_master` failed. `retry_after` is the
    /// configured delay between election attempts.
    fn start_election(&self, lost_master: Eid, retry_after: Duration);
}

/// Handler that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {
    fn handle(&self, _from: Eid, _control: Bytes, _record: Bytes) -> Result<()> {
        Ok(())
    }
}

impl ElectionTrigger for NoopHandler {
    fn start_election(&self, _lost_master: Eid, _retry_after: Duration) {}
}

/// A complete message waiting for a processing thread
#[derive(Debug)]
pub struct Inbound {
    /// Site the message came from
    pub from: Eid,
    /// The message
    pub message: Message,
}

/// Pool of message-processing threads fed by an unbounded channel
pub struct MessagePool {
    tx: Mutex<Option<Sender<Inbound>>>,
    rx: Mutex<Option<Receiver<Inbound>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePool {
    /// Create the channel; no threads run until [`MessagePool::spawn_workers`]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start `count` threads, each running `process` on every message it
    /// receives
    pub fn spawn_workers<F>(&self, count: usize, process: F) -> Result<()>
    where
        F: Fn(Inbound) + Clone + Send + 'static,
    {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::internal("message threads already started"))?;

        let mut threads = self.threads.lock();
        for i in 0..count.max(1) {
            let rx = rx.clone();
            let process = process.clone();
            let handle = std::thread::Builder::new()
                .name(format!("repmgr-msg-{}", i))
                .spawn(move || {
                    while let Ok(inbound) = rx.recv() {
                        process(inbound);
                    }
                    tracing::trace!("message thread exiting");
                })?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Hand a message to the pool
    pub fn submit(&self, inbound: Inbound) -> Result<()> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(Error::Shutdown)?;
        tx.send(inbound).map_err(|_| Error::Shutdown)
    }

    /// Messages not yet picked up by a thread
    pub fn backlog(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, |tx| tx.len())
    }

    /// Stop accepting messages. Threads finish the backlog and exit; the
    /// returned handles can be joined.
    pub fn close(&self) -> Vec<JoinHandle<()>> {
        self.tx.lock().take();
        self.rx.lock().take();
        std::mem::take(&mut *self.threads.lock())
    }
}
