//! repmgr core - replication group-communication layer
//!
//! This crate keeps replica sites of an embedded database connected and
//! moves replication traffic between them:
//! - One TCP connection per site pair, with protocol version negotiation
//! - 5-segment framing (header, control, control tail, record, checksum)
//! - Bounded per-connection outbound queues with backpressure
//! - Reconnect scheduling across a site's alternate addresses
//! - Ack waiters released by ALL_PEERS, QUORUM or ONE_PEER policies
//! - Heartbeats, site discovery and election triggering on master loss
//!
//! The log engine and the election algorithm stay outside; they plug in
//! through [`MessageHandler`] and [`ElectionTrigger`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   Application: send_to / broadcast / acks    │
//! └──────────────┬───────────────────────────────┘
//!                │
//! ┌──────────────┴───────────────────────────────┐
//! │  RepMgr: site table, retry queue, waiters    │
//! │  select loop (accept, connect, reap)         │
//! └──────┬───────────────────────────┬───────────┘
//!        │                           │
//! ┌──────┴──────────────┐   ┌────────┴───────────┐
//! │ reader/writer tasks │──►│  message threads   │
//! │   (per connection)  │   │ (MessageHandler)   │
//! └─────────────────────┘   └────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod address;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod manager;
pub mod protocol;
pub mod retry;
pub mod site;
pub mod transport;

pub use ack::AckPolicy;
pub use config::{RemoteSiteConfig, RepMgrConfig};
pub use connection::{ConnState, Connection, ConnectionId, Direction, SendOutcome};
pub use dispatch::{ElectionTrigger, MessageHandler, NoopHandler};
pub use error::{Error, Result};
pub use manager::{ManagerStats, RepMgr, SiteInfo};
pub use protocol::{LogPosition, MessageType};
pub use site::{Eid, SiteState};
