//! Replication manager
//!
//! [`RepMgr`] is the context shared by the application, the select loop,
//! the per-connection tasks and the message threads. The select loop
//! ([`ConnectionManager`]) is the only task that opens outgoing connections
//! or closes sockets:
//!
//! - accepts incoming connections
//! - starts outgoing connections when their retry comes due
//! - completes connect attempts reported by connect tasks
//! - reaps defunct connections once per iteration
//! - sends heartbeats and watches the master's
//!
//! Locks are always taken in the order site table, connection (registry,
//! then the connection itself), retry queue, ack waiters. None is held
//! across an await.

use crate::ack::{self, AckPolicy, AckWaiterTable, release_satisfied};
use crate::config::RepMgrConfig;
use crate::connection::{ConnState, Connection, ConnectionId, Direction, SendOutcome};
use crate::dispatch::{ElectionTrigger, Inbound, MessageHandler, MessagePool};
use crate::frame::{Frame, check_payload_size};
use crate::protocol::{
    HEARTBEAT_MIN_VERSION, HandshakeParams, LogPosition, Message, VersionProposal,
};
use crate::retry::RetryQueue;
use crate::site::{Eid, SiteState, SiteTable};
use crate::transport;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How often the select loop checks heartbeat timers
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

/// Manager statistics
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Incoming connections accepted
    pub connections_accepted: u64,
    /// Outgoing connections established
    pub connections_initiated: u64,
    /// Outgoing connect attempts that failed
    pub connect_failures: u64,
    /// Connections lost and scheduled for retry
    pub connections_busted: u64,
    /// Point-to-point messages queued
    pub messages_sent: u64,
    /// Broadcast messages queued, counted per connection
    pub broadcasts_sent: u64,
    /// Broadcast messages dropped on full queues
    pub messages_dropped: u64,
    /// REP_MESSAGE and ACK messages received
    pub messages_received: u64,
    /// Acks processed
    pub acks_received: u64,
    /// Heartbeats queued
    pub heartbeats_sent: u64,
    /// Times the election trigger was called
    pub elections_triggered: u64,
    /// Senders blocked on full queues right now, across all connections
    pub blocked_senders: usize,
    /// Inbound messages waiting for a message thread right now
    pub message_backlog: usize,
}

/// Point-in-time view of one site
#[derive(Debug, Clone)]
pub struct SiteInfo {
    /// Site id
    pub eid: Eid,
    /// Host name
    pub host: String,
    /// Listening port
    pub port: u16,
    /// Idle or connected
    pub state: SiteState,
    /// State of the linked connection
    pub connection_state: Option<ConnState>,
    /// Protocol version of the linked connection
    pub version: Option<u32>,
    /// Election priority, once known
    pub priority: Option<u32>,
    /// Highest acknowledged position
    pub max_ack: LogPosition,
    /// Member of the peer subset
    pub peer: bool,
    /// A reconnect is scheduled
    pub retry_pending: bool,
}

/// Notifications for the select loop
#[derive(Debug)]
pub(crate) enum ManagerEvent {
    /// A connect task reached the remote site
    Connected {
        conn: ConnectionId,
        stream: TcpStream,
        addr: SocketAddr,
    },
    /// A connect task gave up on the current address
    ConnectFailed { conn: ConnectionId, error: Error },
    /// A connection went defunct and needs reaping
    Defunct(ConnectionId),
    /// Retry queue changed
    Wake,
}

/// Replication manager context
pub struct RepMgr {
    config: RepMgrConfig,
    local_addr: SocketAddr,
    advertised_port: u16,
    identity: String,
    connection_retry_ms: AtomicU64,
    pub(crate) sites: Mutex<SiteTable>,
    pub(crate) connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    pub(crate) retries: Mutex<RetryQueue>,
    pub(crate) waiters: Mutex<AckWaiterTable>,
    master: RwLock<Option<Eid>>,
    stats: Mutex<ManagerStats>,
    handler: Arc<dyn MessageHandler>,
    election: Arc<dyn ElectionTrigger>,
    pub(crate) pool: MessagePool,
    events: mpsc::UnboundedSender<ManagerEvent>,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RepMgr {
    /// Bind the listener, seed the site table from the configuration and
    /// start the select loop and message threads
    pub async fn start(
        config: RepMgrConfig,
        handler: Arc<dyn MessageHandler>,
        election: Arc<dyn ElectionTrigger>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let listener = TcpListener::bind((config.local_host.as_str(), config.local_port)).await?;
        let local_addr = listener.local_addr()?;
        let advertised_port = if config.local_port == 0 {
            local_addr.port()
        } else {
            config.local_port
        };
        let identity = format!("{}:{}", config.local_host, advertised_port).to_ascii_lowercase();

        let now = Instant::now();
        let mut sites = SiteTable::new();
        let mut retries = RetryQueue::new();
        for remote in &config.remote_sites {
            let remote_identity = format!("{}:{}", remote.host, remote.port);
            if remote_identity.eq_ignore_ascii_case(&identity) {
                tracing::warn!("Ignoring remote site {}: it is the local site", remote_identity);
                continue;
            }
            sites.add(&remote.host, remote.port, remote.peer, Some((&mut retries, now)));
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let connection_retry_ms = AtomicU64::new(config.connection_retry().as_millis() as u64);
        let message_threads = config.message_threads;

        let ctx = Arc::new(Self {
            config,
            local_addr,
            advertised_port,
            identity,
            connection_retry_ms,
            sites: Mutex::new(sites),
            connections: Mutex::new(HashMap::new()),
            retries: Mutex::new(retries),
            waiters: Mutex::new(AckWaiterTable::new()),
            master: RwLock::new(None),
            stats: Mutex::new(ManagerStats::default()),
            handler,
            election,
            pool: MessagePool::new(),
            events,
            next_conn_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&ctx);
        ctx.pool.spawn_workers(message_threads, move |inbound| {
            if let Some(ctx) = weak.upgrade() {
                ctx.process_inbound(inbound);
            }
        })?;

        tracing::info!(
            "Replication manager {} listening on {}",
            ctx.identity,
            local_addr
        );

        let manager = ConnectionManager::new(ctx.clone(), listener, events_rx);
        *ctx.task.lock() = Some(tokio::spawn(manager.run()));
        Ok(ctx)
    }

    /// Configuration the manager was started with
    pub fn config(&self) -> &RepMgrConfig {
        &self.config
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` this site advertises in handshakes
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Add a site at runtime; it connects on the next select loop pass
    pub fn add_site(&self, host: &str, port: u16, peer: bool) -> Eid {
        let (eid, added) = {
            let mut sites = self.sites.lock();
            let mut retries = self.retries.lock();
            sites.add(host, port, peer, Some((&mut retries, Instant::now())))
        };
        if added {
            tracing::info!("Added site {} ({}:{})", eid, host, port);
            self.notify(ManagerEvent::Wake);
        }
        eid
    }

    /// Eid of `host:port`, if known
    pub fn find_site(&self, host: &str, port: u16) -> Option<Eid> {
        self.sites.lock().find(host, port)
    }

    /// Snapshot of one site
    pub fn site(&self, eid: Eid) -> Result<SiteInfo> {
        let sites = self.sites.lock();
        let registry = self.connections.lock();
        let conn = sites
            .get(eid)?
            .connection()
            .and_then(|id| registry.get(&id).cloned());
        drop(registry);
        let retry_pending = self.retries.lock().contains(eid);
        let site = sites.get(eid)?;
        Ok(SiteInfo {
            eid,
            host: site.host().to_string(),
            port: site.port(),
            state: site.state(),
            connection_state: conn.as_ref().map(|c| c.state()),
            version: conn.as_ref().map(|c| c.version()),
            priority: site.priority(),
            max_ack: site.max_ack(),
            peer: site.is_peer(),
            retry_pending,
        })
    }

    /// Snapshot of every site
    pub fn sites(&self) -> Vec<SiteInfo> {
        let count = self.sites.lock().len();
        (0..count as u32)
            .filter_map(|i| self.site(Eid::new(i)).ok())
            .collect()
    }

    /// Live connection of `eid`
    pub fn connection(&self, eid: Eid) -> Result<Arc<Connection>> {
        let sites = self.sites.lock();
        let id = sites.get(eid)?.connection().ok_or(Error::NotReady)?;
        self.connections
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::NotReady)
    }

    /// Send a replication message to one site, waiting up to the ack
    /// timeout for queue space
    pub async fn send_to(&self, eid: Eid, control: Bytes, record: Bytes) -> Result<SendOutcome> {
        let frame = self.rep_frame(control, record)?;
        self.send_frame(eid, frame).await
    }

    /// Acknowledge `position` to one site
    pub async fn send_ack(&self, eid: Eid, position: LogPosition) -> Result<SendOutcome> {
        self.send_frame(eid, Frame::ack(position)).await
    }

    async fn send_frame(&self, eid: Eid, frame: Frame) -> Result<SendOutcome> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let conn = self.connection(eid)?;
        let outcome = conn.send(Arc::new(frame), self.config.ack_timeout()).await?;
        self.stats.lock().messages_sent += 1;
        Ok(outcome)
    }

    /// Queue a replication message on every ready connection without
    /// blocking; returns how many connections took it
    pub fn broadcast(&self, control: Bytes, record: Bytes) -> Result<usize> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let frame = self.rep_frame(control, record)?;
        Ok(self.broadcast_frame(Arc::new(frame), 0))
    }

    /// Frame application traffic, refusing payloads the peer would reject
    fn rep_frame(&self, control: Bytes, record: Bytes) -> Result<Frame> {
        check_payload_size(control.len(), record.len(), self.config.max_message_size)?;
        Ok(Frame::rep_message(control, record))
    }

    fn broadcast_frame(&self, frame: Arc<Frame>, min_version: u32) -> usize {
        let (mut queued, mut dropped) = (0, 0);
        for conn in self.ready_connections() {
            if conn.version() < min_version {
                continue;
            }
            match conn.send_nowait(frame.clone()) {
                Ok(SendOutcome::Queued) => queued += 1,
                Ok(SendOutcome::Dropped) => dropped += 1,
                Err(_) => {}
            }
        }
        let mut stats = self.stats.lock();
        stats.broadcasts_sent += queued as u64;
        stats.messages_dropped += dropped;
        queued
    }

    fn ready_connections(&self) -> Vec<Arc<Connection>> {
        let sites = self.sites.lock();
        let registry = self.connections.lock();
        sites
            .iter()
            .filter_map(|(_, site)| site.connection())
            .filter_map(|id| registry.get(&id).cloned())
            .filter(|conn| conn.is_ready())
            .collect()
    }

    /// Block until `policy` is satisfied for `target`, bounded by the ack
    /// timeout
    pub async fn wait_for_ack(&self, target: LogPosition, policy: AckPolicy) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        ack::wait_for_ack(
            &self.sites,
            &self.waiters,
            target,
            policy,
            self.config.ack_timeout(),
        )
        .await
    }

    /// Record the current master; losing its connection triggers an
    /// election
    pub fn set_master(&self, master: Option<Eid>) {
        *self.master.write() = master;
        if let Some(eid) = master {
            // Start the heartbeat monitor window now.
            let _ = self.sites.lock().touch(eid, Instant::now());
            tracing::info!("Master is site {}", eid);
        }
    }

    /// Current master, if any
    pub fn master(&self) -> Option<Eid> {
        *self.master.read()
    }

    /// Change the reconnect delay for retries scheduled from now on
    pub fn set_connection_retry(&self, delay: Duration) {
        self.connection_retry_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Current reconnect delay
    pub fn connection_retry(&self) -> Duration {
        Duration::from_millis(self.connection_retry_ms.load(Ordering::SeqCst))
    }

    /// Get statistics
    pub fn stats(&self) -> ManagerStats {
        let blocked_senders = self
            .connections
            .lock()
            .values()
            .map(|conn| conn.blockers())
            .sum();
        let mut stats = self.stats.lock().clone();
        stats.blocked_senders = blocked_senders;
        stats.message_backlog = self.pool.backlog();
        stats
    }

    /// Whether every site has exactly one of a linked connection or a
    /// scheduled retry
    pub fn links_consistent(&self) -> bool {
        let sites = self.sites.lock();
        let retries = self.retries.lock();
        sites.links_consistent(&retries)
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the select loop, close every connection and the message
    /// threads. Blocked ack waiters return [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Connection manager task failed: {}", e);
            }
        }
    }

    /// Fail a connection: mark it defunct and, if a site is linked to it,
    /// schedule that site's reconnect after the connection retry delay and
    /// trigger an election if the site was the master
    pub fn bust_connection(&self, conn: &Connection) {
        self.bust_with_delay(conn, self.connection_retry());
    }

    pub(crate) fn bust_with_delay(&self, conn: &Connection, delay: Duration) {
        let lost = {
            let mut sites = self.sites.lock();
            let Some(info) = conn.mark_defunct() else {
                return;
            };
            let mut lost = None;
            if let Some(eid) = info.eid {
                let mut retries = self.retries.lock();
                match sites.detach(eid, conn.id(), &mut retries, delay, Instant::now()) {
                    Ok(true) => lost = Some(eid),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("{}: {}", conn.id(), e),
                }
                drop(retries);
                if lost.is_some() {
                    // A lost straggler no longer holds up ALL_PEERS.
                    release_satisfied(&sites, &self.waiters);
                }
            }
            lost
        };

        self.notify(ManagerEvent::Defunct(conn.id()));

        let Some(eid) = lost else {
            tracing::debug!("Closed unlinked connection {}", conn.id());
            return;
        };
        self.stats.lock().connections_busted += 1;
        tracing::warn!(
            "Connection {} to site {} lost, reconnecting in {:?}",
            conn.id(),
            eid,
            delay
        );
        if self.master() == Some(eid) && !self.is_shutting_down() {
            self.stats.lock().elections_triggered += 1;
            tracing::info!("Lost connection to master site {}, calling election", eid);
            self.election
                .start_election(eid, self.config.election_retry());
        }
    }

    /// Mark a connection defunct without touching its site. For
    /// connections that were never linked to a site, duplicates that lost
    /// the tie-break, and shutdown.
    pub fn disable_connection(&self, conn: &Connection) {
        if conn.mark_defunct().is_some() {
            tracing::debug!("Disabled connection {}", conn.id());
            self.notify(ManagerEvent::Defunct(conn.id()));
        }
    }

    /// Fail a connection after an I/O or protocol error. Whether the site
    /// is busted is decided under the site table lock, so a connection
    /// identified concurrently is never left linked while defunct.
    pub(crate) fn fail_connection(&self, conn: &Connection, error: &Error) {
        if conn.is_defunct() {
            return;
        }
        match conn.eid() {
            Some(eid) => {
                tracing::warn!("Connection {} to site {} failed: {}", conn.id(), eid, error)
            }
            None => tracing::debug!(
                "Connection {} from {:?} failed: {}",
                conn.id(),
                conn.peer_addr(),
                error
            ),
        }
        self.bust_connection(conn);
    }

    pub(crate) fn notify(&self, event: ManagerEvent) {
        // The loop may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_conn_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Parameters this site sends in the handshake
    pub(crate) fn local_params(&self, version: u32) -> HandshakeParams {
        HandshakeParams {
            version,
            port: self.advertised_port,
            priority: self.config.priority,
            host: self.config.local_host.clone(),
        }
    }

    pub(crate) fn touch(&self, eid: Eid) {
        let _ = self.sites.lock().touch(eid, Instant::now());
    }

    pub(crate) fn record_received(&self) {
        self.stats.lock().messages_received += 1;
    }

    /// Link an incoming connection to the site its parameters name,
    /// discovering the site if it is new. When the site already has a live
    /// connection, both ends keep the one initiated by the site with the
    /// smaller `host:port` identity.
    ///
    /// Everything happens under the site table lock and the connection
    /// becomes ready before the table changes, so a failure leaves the
    /// site either linked to a live connection or idle with a retry.
    pub(crate) fn identify_incoming(
        &self,
        conn: &Connection,
        params: &HandshakeParams,
    ) -> Result<()> {
        let remote_identity = format!("{}:{}", params.host, params.port).to_ascii_lowercase();
        if remote_identity == self.identity {
            return Err(Error::refused("connection from the local site"));
        }
        let reply = Arc::new(Frame::handshake_params(&self.local_params(conn.version())));

        let (eid, added, displaced) = {
            let mut sites = self.sites.lock();
            let known = sites.find(&params.host, params.port);
            let existing = known
                .and_then(|eid| sites.get(eid).ok()?.connection())
                .and_then(|id| self.connections.lock().get(&id).cloned())
                .filter(|existing| !existing.is_defunct());

            if let Some(existing) = &existing {
                let keep_new = existing.direction() == Direction::Incoming
                    || remote_identity < self.identity;
                if !keep_new {
                    drop(sites);
                    tracing::info!(
                        "Site {:?} already connected by {}, closing duplicate {}",
                        known,
                        existing.id(),
                        conn.id()
                    );
                    self.disable_connection(conn);
                    return Ok(());
                }
            }

            let now = Instant::now();
            let mut retries = self.retries.lock();
            // A discovered site starts idle with a retry like a configured
            // one; attaching consumes it.
            let (eid, added) =
                sites.add(&params.host, params.port, true, Some((&mut retries, now)));
            conn.set_eid(eid);
            if let Err(e) = conn.mark_ready(conn.version(), reply) {
                drop(retries);
                drop(sites);
                if added {
                    self.notify(ManagerEvent::Wake);
                }
                return Err(e);
            }

            if let Some(existing) = &existing {
                existing.mark_defunct();
            }
            sites.set_priority(eid, params.priority)?;
            sites.touch(eid, now)?;
            sites.attach(eid, conn.id(), &mut retries)?;
            (eid, added, existing)
        };

        if let Some(old) = displaced {
            tracing::info!("Replacing connection {} to site {} with {}", old.id(), eid, conn.id());
            self.notify(ManagerEvent::Defunct(old.id()));
        }
        if added {
            tracing::info!("Discovered site {} at {}:{}", eid, params.host, params.port);
        }
        tracing::info!(
            "Site {} ({}:{}) connected, protocol version {}, priority {}",
            eid,
            params.host,
            params.port,
            conn.version(),
            params.priority
        );
        Ok(())
    }

    fn process_inbound(&self, inbound: Inbound) {
        let from = inbound.from;
        match inbound.message {
            Message::Ack(position) => self.process_ack(from, position),
            Message::RepMessage { control, record } => {
                if let Err(e) = self.handler.handle(from, control, record) {
                    tracing::warn!("Message from site {} failed: {}", from, e);
                }
            }
            other => {
                tracing::debug!("Ignoring {:?} on message thread", other.message_type());
            }
        }
    }

    /// Raise `from`'s acked position and release satisfied waiters
    pub(crate) fn process_ack(&self, from: Eid, position: LogPosition) {
        let released = {
            let mut sites = self.sites.lock();
            match sites.record_ack(from, position) {
                Ok(true) => release_satisfied(&sites, &self.waiters),
                Ok(false) => 0,
                Err(e) => {
                    tracing::warn!("Ack from unknown site {}: {}", from, e);
                    return;
                }
            }
        };
        self.stats.lock().acks_received += 1;
        tracing::trace!(
            "Site {} acked {}, released {} waiters",
            from,
            position,
            released
        );
    }

    fn send_heartbeats(&self) -> usize {
        let sent = self.broadcast_frame(Arc::new(Frame::heartbeat()), HEARTBEAT_MIN_VERSION);
        self.stats.lock().heartbeats_sent += sent as u64;
        sent
    }

    /// Bust the master's connection if it has been silent longer than
    /// `monitor`
    fn check_master_heartbeat(&self, now: Instant, monitor: Duration) {
        let Some(master) = self.master() else {
            return;
        };
        let conn = {
            let sites = self.sites.lock();
            let Ok(site) = sites.get(master) else {
                return;
            };
            let silent = site
                .last_heard()
                .is_some_and(|heard| now.duration_since(heard) > monitor);
            if !silent {
                return;
            }
            site.connection()
                .and_then(|id| self.connections.lock().get(&id).cloned())
        };
        if let Some(conn) = conn {
            if conn.is_ready() && conn.version() >= HEARTBEAT_MIN_VERSION {
                tracing::warn!("No heartbeat from master site {} in {:?}", master, monitor);
                self.bust_connection(&conn);
            }
        }
    }
}

/// Reader and writer tasks of one connection
struct IoTasks {
    cancel: CancellationToken,
    reader: JoinHandle<OwnedReadHalf>,
    writer: JoinHandle<OwnedWriteHalf>,
}

impl IoTasks {
    /// Stop both tasks, take the socket back and close it
    async fn close(self, id: ConnectionId) {
        self.cancel.cancel();
        let (reader, writer) = tokio::join!(self.reader, self.writer);
        match (reader, writer) {
            (Ok(read), Ok(write)) => {
                if let Err(e) = read.reunite(write) {
                    tracing::error!("{}: socket halves do not match: {}", id, e);
                }
            }
            (reader, writer) => {
                for e in [reader.err(), writer.err()].into_iter().flatten() {
                    tracing::error!("{}: I/O task failed: {}", id, e);
                }
            }
        }
        tracing::debug!("Closed connection {}", id);
    }
}

/// The select loop
pub(crate) struct ConnectionManager {
    ctx: Arc<RepMgr>,
    listener: TcpListener,
    events: mpsc::UnboundedReceiver<ManagerEvent>,
    io: HashMap<ConnectionId, IoTasks>,
    pending: HashMap<ConnectionId, mpsc::Receiver<Arc<Frame>>>,
    last_heartbeat: Instant,
}

impl ConnectionManager {
    fn new(
        ctx: Arc<RepMgr>,
        listener: TcpListener,
        events: mpsc::UnboundedReceiver<ManagerEvent>,
    ) -> Self {
        Self {
            ctx,
            listener,
            events,
            io: HashMap::new(),
            pending: HashMap::new(),
            last_heartbeat: Instant::now(),
        }
    }

    async fn run(mut self) {
        let config = self.ctx.config();
        let mut housekeeping = (config.heartbeat_send().is_some()
            || config.heartbeat_monitor().is_some())
        .then(|| {
            let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let next_retry = self.ctx.retries.lock().next_due();
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                _ = sleep_until_due(next_retry) => self.start_due_connections(),
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = tick(&mut housekeeping) => self.housekeeping(),
            }
            self.reap().await;
        }

        self.teardown().await;
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", addr, e);
        }
        let id = self.ctx.next_connection_id();
        let (conn, rx) = Connection::incoming(id, addr, self.ctx.config.out_queue_limit);
        self.ctx.connections.lock().insert(id, conn.clone());
        self.ctx.stats.lock().connections_accepted += 1;
        tracing::debug!("Accepted connection {} from {}", id, addr);
        self.spawn_io(conn, stream, rx);
    }

    /// Turn every due retry entry into a connection attempt
    fn start_due_connections(&mut self) {
        let now = Instant::now();
        let mut launches = Vec::new();
        {
            let mut sites = self.ctx.sites.lock();
            let mut registry = self.ctx.connections.lock();
            let mut retries = self.ctx.retries.lock();
            for entry in retries.pop_due(now) {
                let Ok(site) = sites.get(entry.eid) else {
                    continue;
                };
                let (host, port) = (site.host().to_string(), site.port());
                let id = self.ctx.next_connection_id();
                let (conn, rx) =
                    Connection::outgoing(id, entry.eid, self.ctx.config.out_queue_limit);
                if let Err(e) = sites.attach(entry.eid, id, &mut retries) {
                    tracing::warn!("Cannot connect to site {}: {}", entry.eid, e);
                    continue;
                }
                registry.insert(id, conn.clone());
                self.pending.insert(id, rx);
                launches.push((conn, entry.eid, host, port));
            }
        }

        for (conn, eid, host, port) in launches {
            tracing::debug!("Connecting to site {} ({}:{}) as {}", eid, host, port, conn.id());
            tokio::spawn(transport::connect(self.ctx.clone(), conn, eid, host, port));
        }
    }

    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Connected { conn, stream, addr } => self.on_connected(conn, stream, addr),
            ManagerEvent::ConnectFailed { conn, error } => self.on_connect_failed(conn, error),
            // Reaping and the retry timer are handled every iteration.
            ManagerEvent::Defunct(_) | ManagerEvent::Wake => {}
        }
    }

    fn on_connected(&mut self, id: ConnectionId, stream: TcpStream, addr: SocketAddr) {
        let conn = self.ctx.connections.lock().get(&id).cloned();
        let rx = self.pending.remove(&id);
        let (Some(conn), Some(rx)) = (conn, rx) else {
            tracing::debug!("Dropping socket to {} for retired connection {}", addr, id);
            return;
        };
        if let Err(e) = conn.mark_connected(addr) {
            tracing::debug!("Connection {} no longer wanted: {}", id, e);
            return;
        }

        let proposal = Arc::new(Frame::version_proposal(VersionProposal::local()));
        if let Err(e) = conn.send_control(proposal) {
            self.ctx.fail_connection(&conn, &e);
            return;
        }
        self.ctx.stats.lock().connections_initiated += 1;
        if let Some(eid) = conn.eid() {
            tracing::info!("Connected to site {} at {}", eid, addr);
        }
        self.spawn_io(conn, stream, rx);
    }

    /// Try the next address right away, or wait the retry delay once every
    /// address has failed
    fn on_connect_failed(&mut self, id: ConnectionId, error: Error) {
        self.pending.remove(&id);
        let Some(conn) = self.ctx.connections.lock().get(&id).cloned() else {
            return;
        };
        if conn.is_defunct() {
            return;
        }

        let retry = self.ctx.connection_retry();
        let (eid, delay) = match conn.eid() {
            Some(eid) => {
                let mut sites = self.ctx.sites.lock();
                let delay = match sites.get_mut(eid) {
                    Ok(site) => {
                        if site.addresses.fail_over() {
                            Duration::ZERO
                        } else {
                            retry
                        }
                    }
                    Err(_) => retry,
                };
                (Some(eid), delay)
            }
            None => (None, retry),
        };

        self.ctx.stats.lock().connect_failures += 1;
        tracing::warn!(
            "Connect to site {} failed: {}",
            eid.map_or_else(|| "?".to_string(), |e| e.to_string()),
            error
        );
        self.ctx.bust_with_delay(&conn, delay);
    }

    fn spawn_io(
        &mut self,
        conn: Arc<Connection>,
        stream: TcpStream,
        rx: mpsc::Receiver<Arc<Frame>>,
    ) {
        let (read, write) = stream.into_split();
        let cancel = self.ctx.shutdown.child_token();
        let reader = tokio::spawn(transport::read_loop(
            self.ctx.clone(),
            conn.clone(),
            read,
            cancel.clone(),
        ));
        let writer = tokio::spawn(transport::write_loop(
            self.ctx.clone(),
            conn.clone(),
            write,
            rx,
            cancel.clone(),
        ));
        self.io.insert(
            conn.id(),
            IoTasks {
                cancel,
                reader,
                writer,
            },
        );
    }

    /// Close every defunct connection and forget it
    async fn reap(&mut self) {
        let defunct: Vec<ConnectionId> = self
            .ctx
            .connections
            .lock()
            .values()
            .filter(|conn| conn.is_defunct())
            .map(|conn| conn.id())
            .collect();

        for id in defunct {
            self.ctx.connections.lock().remove(&id);
            self.pending.remove(&id);
            if let Some(tasks) = self.io.remove(&id) {
                tasks.close(id).await;
            }
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();
        if let Some(send) = self.ctx.config.heartbeat_send() {
            if now.duration_since(self.last_heartbeat) >= send {
                self.last_heartbeat = now;
                let sent = self.ctx.send_heartbeats();
                tracing::trace!("Sent {} heartbeats", sent);
            }
        }
        if let Some(monitor) = self.ctx.config.heartbeat_monitor() {
            self.ctx.check_master_heartbeat(now, monitor);
        }
    }

    async fn teardown(&mut self) {
        tracing::info!("Replication manager {} shutting down", self.ctx.identity);

        let conns: Vec<Arc<Connection>> = self.ctx.connections.lock().values().cloned().collect();
        for conn in &conns {
            self.ctx.disable_connection(conn);
        }
        self.reap().await;
        self.pending.clear();

        // Dropping the senders wakes blocked waiters with a shutdown error.
        self.ctx.waiters.lock().clear();

        let threads = self.ctx.pool.close();
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                if thread.join().is_err() {
                    tracing::error!("Message thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            tracing::error!("Failed to join message threads: {}", e);
        }
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
