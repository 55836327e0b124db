//! Site table
//!
//! Known remote sites live in a dense arena indexed by [`Eid`]. A site is
//! either linked to its live connection or idle with exactly one pending
//! entry in the [`RetryQueue`]. The link is switched only through
//! [`SiteTable::attach`] and [`SiteTable::detach`], which update the retry
//! queue in the same step, so the two can never disagree.

use crate::address::AddressList;
use crate::connection::ConnectionId;
use crate::protocol::LogPosition;
use crate::retry::RetryQueue;
use crate::{Error, Result};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Site identifier: index into the site table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Eid(u32);

impl Eid {
    /// The local site; never indexes the table
    pub const SELF: Eid = Eid(u32::MAX);

    /// Eid for table slot `index`
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw value
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the local site
    pub const fn is_self(self) -> bool {
        self.0 == u32::MAX
    }

    fn index(self) -> Option<usize> {
        if self.is_self() {
            None
        } else {
            Some(self.0 as usize)
        }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_self() {
            write!(f, "SELF")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Connection status of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    /// Waiting for a scheduled reconnect
    Idle,
    /// Has a connection (negotiating or ready)
    Connected,
}

/// What a site currently owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteLink {
    /// A retry entry in the scheduler
    Idle,
    /// The site's connection
    Connected(ConnectionId),
}

/// One known remote site
#[derive(Debug)]
pub struct Site {
    host: String,
    port: u16,
    /// Resolved addresses, tried in order
    pub addresses: AddressList,
    max_ack: LogPosition,
    priority: Option<u32>,
    peer: bool,
    link: SiteLink,
    last_heard: Option<Instant>,
}

impl Site {
    fn new(host: String, port: u16, peer: bool) -> Self {
        Self {
            host,
            port,
            addresses: AddressList::default(),
            max_ack: LogPosition::default(),
            priority: None,
            peer,
            link: SiteLink::Idle,
            last_heard: None,
        }
    }

    /// Configured host name
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` identity used for duplicate resolution
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Highest acknowledged log position
    pub fn max_ack(&self) -> LogPosition {
        self.max_ack
    }

    /// Election priority, once known
    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    /// Member of the peer subset
    pub fn is_peer(&self) -> bool {
        self.peer
    }

    /// Current link
    pub fn link(&self) -> SiteLink {
        self.link
    }

    /// State derived from the link
    pub fn state(&self) -> SiteState {
        match self.link {
            SiteLink::Idle => SiteState::Idle,
            SiteLink::Connected(_) => SiteState::Connected,
        }
    }

    /// Linked connection, if connected
    pub fn connection(&self) -> Option<ConnectionId> {
        match self.link {
            SiteLink::Connected(id) => Some(id),
            SiteLink::Idle => None,
        }
    }

    /// Time of the last message received from this site
    pub fn last_heard(&self) -> Option<Instant> {
        self.last_heard
    }
}

/// Ack progress of the table relative to one log position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckProgress {
    /// Sites currently connected
    pub connected: usize,
    /// Connected sites that acked the position
    pub connected_acked: usize,
    /// Peer-subset sites that acked the position
    pub peers_acked: usize,
    /// All sites, including the local one
    pub total_sites: usize,
}

/// Arena of known sites
#[derive(Debug, Default)]
pub struct SiteTable {
    sites: Vec<Site>,
}

impl SiteTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a site by `host:port`
    pub fn find(&self, host: &str, port: u16) -> Option<Eid> {
        self.sites
            .iter()
            .position(|s| s.port == port && s.host.eq_ignore_ascii_case(host))
            .map(|i| Eid::new(i as u32))
    }

    /// Add a site, or return the existing one for the same `host:port`.
    /// A new site starts idle with an immediate retry when `retries` is
    /// given.
    pub fn add(
        &mut self,
        host: &str,
        port: u16,
        peer: bool,
        retries: Option<(&mut RetryQueue, Instant)>,
    ) -> (Eid, bool) {
        if let Some(eid) = self.find(host, port) {
            return (eid, false);
        }
        let eid = Eid::new(self.sites.len() as u32);
        self.sites.push(Site::new(host.to_string(), port, peer));
        if let Some((queue, now)) = retries {
            queue.schedule(eid, Duration::ZERO, now);
        }
        (eid, true)
    }

    /// Site for `eid`
    pub fn get(&self, eid: Eid) -> Result<&Site> {
        eid.index()
            .and_then(|i| self.sites.get(i))
            .ok_or_else(|| Error::UnknownSite(eid.to_string()))
    }

    /// Mutable site for `eid`
    pub fn get_mut(&mut self, eid: Eid) -> Result<&mut Site> {
        eid.index()
            .and_then(|i| self.sites.get_mut(i))
            .ok_or_else(|| Error::UnknownSite(eid.to_string()))
    }

    /// Number of remote sites
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether no remote site is known
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// All sites with their eids
    pub fn iter(&self) -> impl Iterator<Item = (Eid, &Site)> {
        self.sites
            .iter()
            .enumerate()
            .map(|(i, s)| (Eid::new(i as u32), s))
    }

    /// Link `eid` to `conn`, consuming its retry entry
    pub fn attach(
        &mut self,
        eid: Eid,
        conn: ConnectionId,
        retries: &mut RetryQueue,
    ) -> Result<()> {
        let site = self.get_mut(eid)?;
        site.link = SiteLink::Connected(conn);
        retries.remove(eid);
        Ok(())
    }

    /// Unlink `eid` from `conn` and queue its reconnect after `delay`.
    /// Returns false, changing nothing, if the site is linked elsewhere.
    pub fn detach(
        &mut self,
        eid: Eid,
        conn: ConnectionId,
        retries: &mut RetryQueue,
        delay: Duration,
        now: Instant,
    ) -> Result<bool> {
        let site = self.get_mut(eid)?;
        if site.link != SiteLink::Connected(conn) {
            return Ok(false);
        }
        site.link = SiteLink::Idle;
        retries.schedule(eid, delay, now);
        Ok(true)
    }

    /// Record priority learned from a handshake
    pub fn set_priority(&mut self, eid: Eid, priority: u32) -> Result<()> {
        self.get_mut(eid)?.priority = Some(priority);
        Ok(())
    }

    /// Raise `eid`'s acknowledged position; returns whether it moved
    pub fn record_ack(&mut self, eid: Eid, position: LogPosition) -> Result<bool> {
        let site = self.get_mut(eid)?;
        if position > site.max_ack {
            site.max_ack = position;
            return Ok(true);
        }
        Ok(false)
    }

    /// Note that a message arrived from `eid`
    pub fn touch(&mut self, eid: Eid, now: Instant) -> Result<()> {
        self.get_mut(eid)?.last_heard = Some(now);
        Ok(())
    }

    /// Count acks of `target` across the table
    pub fn ack_progress(&self, target: LogPosition) -> AckProgress {
        let mut progress = AckProgress {
            total_sites: self.sites.len() + 1,
            ..Default::default()
        };
        for site in &self.sites {
            let acked = site.max_ack >= target;
            if site.state() == SiteState::Connected {
                progress.connected += 1;
                if acked {
                    progress.connected_acked += 1;
                }
            }
            if site.peer && acked {
                progress.peers_acked += 1;
            }
        }
        progress
    }

    /// Every idle site has exactly one retry entry and no connected site
    /// has any
    pub fn links_consistent(&self, retries: &RetryQueue) -> bool {
        let queued = retries.len();
        let idle = self
            .sites
            .iter()
            .filter(|s| s.state() == SiteState::Idle)
            .count();
        queued == idle
            && self.iter().all(|(eid, s)| match s.state() {
                SiteState::Idle => retries.contains(eid),
                SiteState::Connected => !retries.contains(eid),
            })
    }
}
