//! Replication manager configuration
//!
//! All timeouts are whole seconds, matching how operators express them in
//! the node's TOML file.

use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-connection outbound queue limit
pub const DEFAULT_OUT_QUEUE_LIMIT: usize = 10;

/// Default ack wait, in seconds
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 1;

/// Default delay before reconnecting to a site, in seconds
pub const DEFAULT_CONNECTION_RETRY_SECS: u64 = 30;

/// Default delay between election attempts, in seconds
pub const DEFAULT_ELECTION_RETRY_SECS: u64 = 10;

/// A remote site known from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSiteConfig {
    /// Host name or address literal
    pub host: String,
    /// Replication port
    pub port: u16,
    /// Counted by the ONE_PEER and QUORUM ack policies
    #[serde(default = "default_peer")]
    pub peer: bool,
}

fn default_peer() -> bool {
    true
}

impl RemoteSiteConfig {
    /// Create a peer site entry
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            peer: true,
        }
    }

    /// Exclude this site from the peer subset
    pub fn non_peer(mut self) -> Self {
        self.peer = false;
        self
    }
}

/// Replication manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepMgrConfig {
    /// Host name advertised to remote sites in the handshake
    pub local_host: String,

    /// Port to listen on for incoming site connections (0 picks one)
    pub local_port: u16,

    /// Election priority advertised in the handshake
    pub priority: u32,

    /// Sites to connect to at startup
    pub remote_sites: Vec<RemoteSiteConfig>,

    /// Per-connection outbound queue limit
    pub out_queue_limit: usize,

    /// Bounded wait for acks and for queue space on point-to-point sends
    pub ack_timeout_secs: u64,

    /// Delay before retrying a failed or lost connection
    pub connection_retry_secs: u64,

    /// Delay between election attempts, handed to the election trigger
    pub election_retry_secs: u64,

    /// Interval for sending heartbeats on v2 connections (unset disables)
    pub heartbeat_send_secs: Option<u64>,

    /// Silence from the master tolerated before busting its connection
    pub heartbeat_monitor_secs: Option<u64>,

    /// Outgoing connect() timeout per address
    pub connect_timeout_secs: u64,

    /// Number of message-processing threads
    pub message_threads: usize,

    /// Largest control + record size accepted from the wire and from
    /// local senders
    pub max_message_size: usize,
}

impl Default for RepMgrConfig {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            priority: 100,
            remote_sites: Vec::new(),
            out_queue_limit: DEFAULT_OUT_QUEUE_LIMIT,
            ack_timeout_secs: DEFAULT_ACK_TIMEOUT_SECS,
            connection_retry_secs: DEFAULT_CONNECTION_RETRY_SECS,
            election_retry_secs: DEFAULT_ELECTION_RETRY_SECS,
            heartbeat_send_secs: None,
            heartbeat_monitor_secs: None,
            connect_timeout_secs: 10,
            message_threads: 2,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl RepMgrConfig {
    /// Create a configuration for a site listening on host:port
    pub fn new(local_host: impl Into<String>, local_port: u16) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            ..Default::default()
        }
    }

    /// Add a remote site
    pub fn with_remote_site(mut self, site: RemoteSiteConfig) -> Self {
        self.remote_sites.push(site);
        self
    }

    /// Set the advertised election priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the outbound queue limit
    pub fn with_out_queue_limit(mut self, limit: usize) -> Self {
        self.out_queue_limit = limit;
        self
    }

    /// Set the ack timeout
    pub fn with_ack_timeout_secs(mut self, secs: u64) -> Self {
        self.ack_timeout_secs = secs;
        self
    }

    /// Set the connection retry delay
    pub fn with_connection_retry_secs(mut self, secs: u64) -> Self {
        self.connection_retry_secs = secs;
        self
    }

    /// Enable heartbeat sending and monitoring
    pub fn with_heartbeats(mut self, send_secs: u64, monitor_secs: u64) -> Self {
        self.heartbeat_send_secs = Some(send_secs);
        self.heartbeat_monitor_secs = Some(monitor_secs);
        self
    }

    /// Send heartbeats at this interval
    pub fn with_heartbeat_send_secs(mut self, secs: u64) -> Self {
        self.heartbeat_send_secs = Some(secs);
        self
    }

    /// Bust the master's connection after this much silence
    pub fn with_heartbeat_monitor_secs(mut self, secs: u64) -> Self {
        self.heartbeat_monitor_secs = Some(secs);
        self
    }

    /// Cap control + record size, for both directions
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Ack timeout as a Duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// Connection retry delay as a Duration
    pub fn connection_retry(&self) -> Duration {
        Duration::from_secs(self.connection_retry_secs)
    }

    /// Election retry delay as a Duration
    pub fn election_retry(&self) -> Duration {
        Duration::from_secs(self.election_retry_secs)
    }

    /// Connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Heartbeat send interval, if enabled
    pub fn heartbeat_send(&self) -> Option<Duration> {
        self.heartbeat_send_secs.map(Duration::from_secs)
    }

    /// Heartbeat monitor interval, if enabled
    pub fn heartbeat_monitor(&self) -> Option<Duration> {
        self.heartbeat_monitor_secs.map(Duration::from_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.local_host.is_empty() {
            return Err(Error::config("local_host must not be empty"));
        }
        if self.local_host.as_bytes().contains(&0) {
            return Err(Error::config("local_host must not contain NUL"));
        }
        if self.out_queue_limit == 0 {
            return Err(Error::config("out_queue_limit must be at least 1"));
        }
        if self.ack_timeout_secs == 0 {
            return Err(Error::config("ack_timeout_secs must be at least 1"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::config("connect_timeout_secs must be at least 1"));
        }
        if self.message_threads == 0 {
            return Err(Error::config("message_threads must be at least 1"));
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(Error::config(
                "max_message_size must be between 1 and u32::MAX",
            ));
        }
        if matches!(self.heartbeat_send_secs, Some(0)) {
            return Err(Error::config("heartbeat_send_secs must be at least 1"));
        }
        if matches!(self.heartbeat_monitor_secs, Some(0)) {
            return Err(Error::config("heartbeat_monitor_secs must be at least 1"));
        }
        for site in &self.remote_sites {
            if site.host.is_empty() {
                return Err(Error::config("remote site host must not be empty"));
            }
            if site.port == 0 {
                return Err(Error::config(format!(
                    "remote site {} needs a non-zero port",
                    site.host
                )));
            }
        }
        Ok(())
    }
}
