//! The fixed list of UDP server addresses a fleet exposes.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("a fleet needs at least one server instance")]
    Empty,

    #[error("{count} instances starting at port {starting_port} overflow the port range")]
    PortOverflow { starting_port: u16, count: usize },
}

/// Ordered server addresses; index `i` is instance `i`.
///
/// Built once at startup and never mutated, so every connect token and every
/// running instance agree on the same sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTopology {
    addrs: Vec<SocketAddr>,
}

impl ServerTopology {
    /// Instance `i` listens on `host:starting_port + i`.
    pub fn contiguous(
        host: IpAddr,
        starting_port: u16,
        count: usize,
    ) -> Result<Self, TopologyError> {
        if count == 0 {
            return Err(TopologyError::Empty);
        }

        if count - 1 > (u16::MAX - starting_port) as usize {
            return Err(TopologyError::PortOverflow {
                starting_port,
                count,
            });
        }

        let addrs = (0..count)
            .map(|i| SocketAddr::new(host, starting_port + i as u16))
            .collect();

        Ok(Self { addrs })
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn get(&self, index: usize) -> Option<SocketAddr> {
        self.addrs.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl fmt::Display for ServerTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs: Vec<String> = self.addrs.iter().map(|addr| addr.to_string()).collect();
        write!(f, "[{}]", addrs.join(", "))
    }
}
