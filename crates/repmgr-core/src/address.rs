//! Ordered address list per site, with a cursor over alternates

use crate::{Error, Result};
use std::net::SocketAddr;
use tokio::net::lookup_host;

/// Resolved addresses of one site, tried in order
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    addrs: Vec<SocketAddr>,
    cursor: usize,
}

impl AddressList {
    /// Wrap an already resolved list
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs, cursor: 0 }
    }

    /// Resolve `host:port`, keeping the resolver's order and dropping
    /// duplicates
    pub async fn resolve(host: &str, port: u16) -> Result<Self> {
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for addr in lookup_host((host, port)).await? {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        if addrs.is_empty() {
            return Err(Error::refused(format!(
                "{}:{} resolved to no addresses",
                host, port
            )));
        }
        Ok(Self::new(addrs))
    }

    /// Whether resolution has produced anything yet
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Number of addresses
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Address the next connect attempt should use
    pub fn current(&self) -> Option<SocketAddr> {
        self.addrs.get(self.cursor).copied()
    }

    /// Move to the next alternate; returns false once every address has
    /// been tried, leaving the cursor past the end
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.addrs.len() {
            self.cursor += 1;
        }
        self.cursor < self.addrs.len()
    }

    /// Step past an address that failed to connect. Returns true while an
    /// untried alternate remains; once all have failed, rewinds to the
    /// first address and returns false.
    pub fn fail_over(&mut self) -> bool {
        if self.advance() {
            return true;
        }
        self.reset();
        false
    }

    /// Start over from the first address
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Replace the list, e.g. after re-resolving
    pub fn replace(&mut self, other: AddressList) {
        self.addrs = other.addrs;
        self.cursor = 0;
    }

    /// Whether `addr` is one of this site's addresses
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.addrs.contains(addr)
    }
}
