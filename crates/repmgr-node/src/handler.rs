//! Stand-ins for the log engine and the election algorithm
//!
//! A node without a storage engine still acknowledges what it receives, so
//! a peer's ack waiters can be exercised end to end: a REP_MESSAGE whose
//! control blob is exactly a log position is acked back to its sender.

use bytes::Bytes;
use repmgr_core::{ElectionTrigger, Eid, Error, LogPosition, MessageHandler, RepMgr, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Logs replication traffic and queues acks for positions it sees
pub struct AckingHandler {
    acks: mpsc::UnboundedSender<(Eid, LogPosition)>,
}

impl AckingHandler {
    /// Create the handler and the receiving end of its ack queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Eid, LogPosition)>) {
        let (acks, rx) = mpsc::unbounded_channel();
        (Self { acks }, rx)
    }
}

impl MessageHandler for AckingHandler {
    fn handle(&self, from: Eid, control: Bytes, record: Bytes) -> Result<()> {
        tracing::debug!(
            "Message from site {}: {} control bytes, {} record bytes",
            from,
            control.len(),
            record.len()
        );
        if control.len() == LogPosition::ENCODED_LEN {
            let position = LogPosition::decode(&control)?;
            self.acks
                .send((from, position))
                .map_err(|_| Error::Shutdown)?;
        }
        Ok(())
    }
}

/// Logs election requests
#[derive(Debug, Default)]
pub struct LoggingElection;

impl ElectionTrigger for LoggingElection {
    fn start_election(&self, lost_master: Eid, retry_after: Duration) {
        tracing::warn!(
            "Lost master site {}; an election is needed (retry every {:?})",
            lost_master,
            retry_after
        );
    }
}

/// Send queued acks until the queue closes
pub async fn forward_acks(
    mgr: Arc<RepMgr>,
    mut acks: mpsc::UnboundedReceiver<(Eid, LogPosition)>,
) {
    while let Some((eid, position)) = acks.recv().await {
        if let Err(e) = mgr.send_ack(eid, position).await {
            if matches!(e, Error::Shutdown) {
                break;
            }
            tracing::debug!("Ack {} to site {} not sent: {}", position, eid, e);
        }
    }
}
