//! Per-socket connection state
//!
//! A [`Connection`] carries the negotiation state machine and the bounded
//! outbound queue. The socket itself never lives here: the connection
//! manager owns it and hands the halves to the connection's reader and
//! writer tasks, so nothing reachable through a `Connection` can close it.
//!
//! ```text
//! outgoing:  Connecting ─► Connected ─────────────────► Ready ⇄ Congested
//! incoming:  Negotiate ──► Parameters ────────────────► Ready ⇄ Congested
//!            any state ──► Defunct (terminal)
//! ```

use crate::frame::Frame;
use crate::site::Eid;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// Identifier of one connection, unique for the manager's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the remote site
    Outgoing,
    /// The remote site dialed us
    Incoming,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outgoing connect in flight
    Connecting,
    /// Outgoing socket up, version proposal sent
    Connected,
    /// Incoming socket, awaiting the version proposal
    Negotiate,
    /// Incoming socket, version agreed, awaiting site parameters
    Parameters,
    /// Negotiated; accepts application traffic
    Ready,
    /// Ready, but senders no longer wait for queue space
    Congested,
    /// Failed; waiting for the manager to close it
    Defunct,
}

impl ConnState {
    /// Whether application traffic may be queued
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Congested)
    }
}

/// What happened to a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Appended to the outbound queue
    Queued,
    /// Queue full; broadcast traffic is dropped
    Dropped,
}

/// Left behind by the transition to Defunct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefunctInfo {
    /// Site the connection belonged to, now cleared
    pub eid: Option<Eid>,
    /// State before the failure
    pub prior: ConnState,
}

#[derive(Debug)]
struct Inner {
    state: ConnState,
    eid: Option<Eid>,
    version: u32,
    peer_addr: Option<SocketAddr>,
}

/// One live or negotiating site connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    direction: Direction,
    inner: Mutex<Inner>,
    tx: mpsc::Sender<Arc<Frame>>,
    blockers: AtomicUsize,
}

impl Connection {
    fn new(
        id: ConnectionId,
        direction: Direction,
        state: ConnState,
        eid: Option<Eid>,
        peer_addr: Option<SocketAddr>,
        queue_limit: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Frame>>) {
        let (tx, rx) = mpsc::channel(queue_limit);
        let conn = Arc::new(Self {
            id,
            direction,
            inner: Mutex::new(Inner {
                state,
                eid,
                version: 0,
                peer_addr,
            }),
            tx,
            blockers: AtomicUsize::new(0),
        });
        (conn, rx)
    }

    /// Connection we are about to dial for `eid`; the receiver feeds its
    /// writer task
    pub fn outgoing(
        id: ConnectionId,
        eid: Eid,
        queue_limit: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Frame>>) {
        Self::new(
            id,
            Direction::Outgoing,
            ConnState::Connecting,
            Some(eid),
            None,
            queue_limit,
        )
    }

    /// Connection just accepted from `peer_addr`; its site is unknown until
    /// the handshake arrives
    pub fn incoming(
        id: ConnectionId,
        peer_addr: SocketAddr,
        queue_limit: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Frame>>) {
        Self::new(
            id,
            Direction::Incoming,
            ConnState::Negotiate,
            None,
            Some(peer_addr),
            queue_limit,
        )
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Who opened the socket
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state
    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Owning site, if known and not defunct
    pub fn eid(&self) -> Option<Eid> {
        self.inner.lock().eid
    }

    /// Negotiated version, 0 until agreed
    pub fn version(&self) -> u32 {
        self.inner.lock().version
    }

    /// Remote socket address
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().peer_addr
    }

    /// Whether application traffic may be queued
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Whether the connection has failed
    pub fn is_defunct(&self) -> bool {
        self.state() == ConnState::Defunct
    }

    /// Messages waiting in the outbound queue
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue capacity
    pub fn queue_limit(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Senders currently waiting for queue space
    pub fn blockers(&self) -> usize {
        self.blockers.load(Ordering::SeqCst)
    }

    fn transition(&self, from: &[ConnState], to: ConnState) -> Result<()> {
        let mut inner = self.inner.lock();
        if !from.contains(&inner.state) {
            return Err(Error::malformed(format!(
                "{}: unexpected transition {:?} -> {:?}",
                self.id, inner.state, to
            )));
        }
        inner.state = to;
        Ok(())
    }

    /// Outgoing connect completed
    pub fn mark_connected(&self, peer_addr: SocketAddr) -> Result<()> {
        self.transition(&[ConnState::Connecting], ConnState::Connected)?;
        self.inner.lock().peer_addr = Some(peer_addr);
        Ok(())
    }

    /// Incoming side agreed on `version`; parameters come next
    pub fn mark_negotiated(&self, version: u32) -> Result<()> {
        self.transition(&[ConnState::Negotiate], ConnState::Parameters)?;
        self.inner.lock().version = version;
        Ok(())
    }

    /// Outgoing side received the agreement, or incoming side identified
    /// its site. `params` is queued in the same step, so any application
    /// traffic that sees the connection ready is written after it.
    pub fn mark_ready(&self, version: u32, params: Arc<Frame>) -> Result<()> {
        let mut inner = self.inner.lock();
        match (inner.state, self.direction) {
            (ConnState::Connected, Direction::Outgoing) => {}
            (ConnState::Parameters, Direction::Incoming) if inner.version == version => {}
            (state, _) => {
                return Err(Error::malformed(format!(
                    "{}: cannot become ready from {:?} at version {}",
                    self.id, state, version
                )));
            }
        }
        match self.tx.try_send(params) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(Error::QueueFull),
            Err(TrySendError::Closed(_)) => return Err(Error::NotReady),
        }
        inner.version = version;
        inner.state = ConnState::Ready;
        Ok(())
    }

    /// Record the site an incoming connection turned out to belong to
    pub fn set_eid(&self, eid: Eid) {
        let mut inner = self.inner.lock();
        if inner.state != ConnState::Defunct {
            inner.eid = Some(eid);
        }
    }

    /// Stop blocking senders
    pub fn mark_congested(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Ready {
            inner.state = ConnState::Congested;
            tracing::debug!("{} congested", self.id);
        }
    }

    /// Writer drained the queue; senders may block again
    pub fn relieve(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Congested {
            inner.state = ConnState::Ready;
            tracing::debug!("{} no longer congested", self.id);
        }
    }

    /// Enter the terminal state and forget the site. Returns `None` if the
    /// connection was already defunct, so each failure is handled once.
    pub fn mark_defunct(&self) -> Option<DefunctInfo> {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Defunct {
            return None;
        }
        let prior = inner.state;
        inner.state = ConnState::Defunct;
        Some(DefunctInfo {
            eid: inner.eid.take(),
            prior,
        })
    }

    /// Queue a negotiation frame regardless of readiness
    pub fn send_control(&self, frame: Arc<Frame>) -> Result<()> {
        if self.is_defunct() {
            return Err(Error::NotReady);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Closed(_)) => Err(Error::NotReady),
        }
    }

    /// Queue broadcast traffic; a full queue drops the message
    pub fn send_nowait(&self, frame: Arc<Frame>) -> Result<SendOutcome> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(TrySendError::Full(_)) => {
                tracing::trace!("{} queue full, dropping broadcast", self.id);
                Ok(SendOutcome::Dropped)
            }
            Err(TrySendError::Closed(_)) => Err(Error::NotReady),
        }
    }

    /// Queue point-to-point traffic. A full queue makes a Ready connection's
    /// caller wait up to `wait` for space; if that expires the connection
    /// turns Congested. A Congested connection fails at once.
    pub async fn send(&self, frame: Arc<Frame>, wait: Duration) -> Result<SendOutcome> {
        let state = self.state();
        if !state.is_ready() {
            return Err(Error::NotReady);
        }
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return Ok(SendOutcome::Queued),
            Err(TrySendError::Closed(_)) => return Err(Error::NotReady),
            Err(TrySendError::Full(frame)) => frame,
        };
        if state == ConnState::Congested {
            return Err(Error::QueueFull);
        }

        self.blockers.fetch_add(1, Ordering::SeqCst);
        let result = self.tx.send_timeout(frame, wait).await;
        self.blockers.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(SendTimeoutError::Timeout(_)) => {
                self.mark_congested();
                Err(Error::QueueFull)
            }
            Err(SendTimeoutError::Closed(_)) => Err(Error::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandshakeParams, LogPosition, MessageType};
    use bytes::Bytes;

    fn params(version: u32) -> Arc<Frame> {
        Arc::new(Frame::handshake_params(&HandshakeParams {
            version,
            port: 5000,
            priority: 10,
            host: "db1.example.com".to_string(),
        }))
    }

    fn ready_outgoing(limit: usize) -> (Arc<Connection>, mpsc::Receiver<Arc<Frame>>) {
        let (conn, mut rx) = Connection::outgoing(ConnectionId::new(1), Eid::new(0), limit);
        conn.mark_connected("127.0.0.1:5000".parse().unwrap()).unwrap();
        conn.mark_ready(2, params(2)).unwrap();
        // Tests start from an empty queue.
        assert_eq!(rx.try_recv().unwrap().message_type(), MessageType::Handshake);
        (conn, rx)
    }

    fn msg(n: u32) -> Arc<Frame> {
        Arc::new(Frame::rep_message(
            Bytes::copy_from_slice(&n.to_be_bytes()),
            Bytes::new(),
        ))
    }

    #[test]
    fn test_outgoing_state_machine() {
        let (conn, _rx) = Connection::outgoing(ConnectionId::new(1), Eid::new(3), 10);
        assert_eq!(conn.state(), ConnState::Connecting);
        assert_eq!(conn.eid(), Some(Eid::new(3)));
        assert!(conn.mark_ready(2, params(2)).is_err());
        conn.mark_connected("127.0.0.1:1".parse().unwrap()).unwrap();
        assert_eq!(conn.state(), ConnState::Connected);
        assert!(!conn.is_ready());
        conn.mark_ready(2, params(2)).unwrap();
        assert!(conn.is_ready());
        assert_eq!(conn.version(), 2);
    }

    #[test]
    fn test_incoming_state_machine() {
        let (conn, _rx) =
            Connection::incoming(ConnectionId::new(2), "127.0.0.1:9".parse().unwrap(), 10);
        assert_eq!(conn.state(), ConnState::Negotiate);
        assert_eq!(conn.eid(), None);
        conn.mark_negotiated(1).unwrap();
        assert_eq!(conn.state(), ConnState::Parameters);
        assert!(conn.mark_ready(2, params(2)).is_err());
        conn.mark_ready(1, params(1)).unwrap();
        assert_eq!(conn.state(), ConnState::Ready);
    }

    #[tokio::test]
    async fn test_params_precede_application_traffic() {
        let (conn, mut rx) = Connection::outgoing(ConnectionId::new(1), Eid::new(0), 10);
        conn.mark_connected("127.0.0.1:5000".parse().unwrap()).unwrap();
        conn.mark_ready(2, params(2)).unwrap();
        conn.send(msg(7), Duration::from_secs(1)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().message_type(), MessageType::Handshake);
        assert_eq!(rx.recv().await.unwrap().message_type(), MessageType::RepMessage);
    }

    #[test]
    fn test_refused_ready_queues_nothing() {
        let (conn, mut rx) = Connection::outgoing(ConnectionId::new(1), Eid::new(0), 10);
        conn.mark_connected("127.0.0.1:5000".parse().unwrap()).unwrap();
        conn.mark_defunct();
        assert!(conn.mark_ready(2, params(2)).is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.state(), ConnState::Defunct);
    }

    #[test]
    fn test_defunct_clears_eid_once() {
        let (conn, _rx) = ready_outgoing(10);
        let info = conn.mark_defunct().unwrap();
        assert_eq!(info.eid, Some(Eid::new(0)));
        assert_eq!(info.prior, ConnState::Ready);
        assert_eq!(conn.eid(), None);
        assert!(conn.mark_defunct().is_none());
        conn.set_eid(Eid::new(5));
        assert_eq!(conn.eid(), None);
    }

    #[tokio::test]
    async fn test_not_ready_rejects_application_traffic() {
        let (conn, _rx) = Connection::outgoing(ConnectionId::new(1), Eid::new(0), 10);
        let err = conn.send(msg(0), Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotReady));
        assert!(matches!(conn.send_nowait(msg(0)), Err(Error::NotReady)));
        assert!(conn.send_control(msg(0)).is_ok());
    }

    #[tokio::test]
    async fn test_fifo_within_connection() {
        let (conn, mut rx) = ready_outgoing(10);
        for n in 0..5 {
            conn.send(msg(n), Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(conn.queue_len(), 5);
        for n in 0..5u32 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(&frame.segments()[1][..], &n.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_full_queue_times_out_and_congests() {
        let (conn, _rx) = ready_outgoing(10);
        for n in 0..10 {
            assert_eq!(
                conn.send(msg(n), Duration::from_secs(1)).await.unwrap(),
                SendOutcome::Queued
            );
        }
        let start = tokio::time::Instant::now();
        let err = conn.send(msg(10), Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(conn.state(), ConnState::Congested);

        // Congested: fail without waiting.
        let start = tokio::time::Instant::now();
        let err = conn.send(msg(11), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        assert!(start.elapsed() < Duration::from_secs(1));

        conn.relieve();
        assert_eq!(conn.state(), ConnState::Ready);
    }

    #[tokio::test]
    async fn test_blocked_sender_resumes_when_queue_drains() {
        let (conn, mut rx) = ready_outgoing(10);
        for n in 0..10 {
            conn.send(msg(n), Duration::from_secs(1)).await.unwrap();
        }

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(msg(10), Duration::from_secs(5)).await })
        };
        while conn.blockers() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.blockers(), 1);

        rx.recv().await.unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), SendOutcome::Queued);
        assert_eq!(conn.blockers(), 0);
        assert_eq!(conn.queue_len(), 10);

        let mut last = 0;
        while let Ok(frame) = rx.try_recv() {
            last = u32::from_be_bytes(frame.segments()[1][..].try_into().unwrap());
        }
        assert_eq!(last, 10);
    }

    #[tokio::test]
    async fn test_broadcast_dropped_when_full() {
        let (conn, _rx) = ready_outgoing(10);
        for _ in 0..10 {
            assert_eq!(
                conn.send_nowait(Arc::new(Frame::ack(LogPosition::new(1, 1))))
                    .unwrap(),
                SendOutcome::Queued
            );
        }
        assert_eq!(conn.send_nowait(msg(0)).unwrap(), SendOutcome::Dropped);
        assert_eq!(conn.state(), ConnState::Ready);
        assert_eq!(conn.blockers(), 0);
    }

    #[tokio::test]
    async fn test_closed_writer_is_not_ready() {
        let (conn, rx) = ready_outgoing(2);
        drop(rx);
        let err = conn.send(msg(0), Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::NotReady));
    }
}
