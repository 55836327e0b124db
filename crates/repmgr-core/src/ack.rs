//! Ack waiters
//!
//! Callers that need a log position acknowledged register a waiter with a
//! policy and block (bounded by the ack timeout) until enough sites have
//! acked. Waiters are re-evaluated whenever a site's acked position moves
//! and whenever a connection is lost.

use crate::protocol::LogPosition;
use crate::site::{AckProgress, SiteTable};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

/// How many sites must ack before a waiter is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Every currently connected site
    AllPeers,
    /// Enough peer-subset sites that, with the local site, a majority of
    /// all sites has the position
    Quorum,
    /// Any one peer-subset site
    OnePeer,
}

impl AckPolicy {
    /// Whether `progress` satisfies this policy
    pub fn satisfied(self, progress: &AckProgress) -> bool {
        match self {
            Self::AllPeers => {
                progress.connected > 0 && progress.connected_acked == progress.connected
            }
            Self::Quorum => progress.peers_acked >= (progress.total_sites / 2).max(1),
            Self::OnePeer => progress.peers_acked >= 1,
        }
    }
}

struct Waiter {
    id: u64,
    target: LogPosition,
    policy: AckPolicy,
    tx: oneshot::Sender<()>,
}

/// Callers blocked on acks
#[derive(Default)]
pub struct AckWaiterTable {
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl AckWaiterTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; the receiver fires when it is released
    pub fn register(
        &mut self,
        target: LogPosition,
        policy: AckPolicy,
    ) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter {
            id,
            target,
            policy,
            tx,
        });
        (id, rx)
    }

    /// Drop a waiter that gave up
    pub fn cancel(&mut self, id: u64) {
        self.waiters.retain(|w| w.id != id);
    }

    /// Release every waiter whose policy `progress_for` now satisfies;
    /// returns how many were released
    pub fn release<F>(&mut self, mut progress_for: F) -> usize
    where
        F: FnMut(LogPosition) -> AckProgress,
    {
        let mut released = 0;
        let mut kept = Vec::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if waiter.policy.satisfied(&progress_for(waiter.target)) {
                // Receiver may already have timed out.
                let _ = waiter.tx.send(());
                released += 1;
            } else {
                kept.push(waiter);
            }
        }
        self.waiters = kept;
        released
    }

    /// Number of blocked callers
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether nobody is waiting
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Drop every waiter; their callers see a shutdown error
    pub fn clear(&mut self) {
        self.waiters.clear();
    }
}

/// Re-evaluate all waiters against the current site table. The caller
/// holds the site table lock, which keeps the lock order.
pub fn release_satisfied(sites: &SiteTable, waiters: &Mutex<AckWaiterTable>) -> usize {
    waiters.lock().release(|target| sites.ack_progress(target))
}

/// Block until `policy` is satisfied for `target` or `timeout` expires
pub async fn wait_for_ack(
    sites: &Mutex<SiteTable>,
    waiters: &Mutex<AckWaiterTable>,
    target: LogPosition,
    policy: AckPolicy,
    timeout: Duration,
) -> Result<()> {
    let (id, rx) = {
        // Checking and registering under the site lock means no ack can
        // slip in between.
        let sites = sites.lock();
        if policy.satisfied(&sites.ack_progress(target)) {
            return Ok(());
        }
        waiters.lock().register(target, policy)
    };

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(Error::Shutdown),
        Err(_) => {
            waiters.lock().cancel(id);
            tracing::debug!("ack wait for {} ({:?}) timed out", target, policy);
            Err(Error::AckTimeout)
        }
    }
}
