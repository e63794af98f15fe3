//! One UDP server instance and its fixed-rate tick loop.

use log::{debug, error, info};
use shared::{Transport, TransportError, MAX_PAYLOAD_BYTES};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of an instance. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstanceState {
    Uninitialized,
    Bound,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Uninitialized => "uninitialized",
            InstanceState::Bound => "bound",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance {index} ({addr}) failed to initialize: {source}")]
    Init {
        index: usize,
        addr: SocketAddr,
        #[source]
        source: TransportError,
    },

    #[error("instance {index} ({addr}) failed to listen: {source}")]
    Listen {
        index: usize,
        addr: SocketAddr,
        #[source]
        source: TransportError,
    },

    #[error("instance {index} ({addr}) worker panicked")]
    Panicked { index: usize, addr: SocketAddr },

    #[error("instance {index} ({addr}) did not stop in time")]
    StopTimeout { index: usize, addr: SocketAddr },
}

/// Summary returned by an instance that stopped cleanly
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceReport {
    pub index: usize,
    pub addr: SocketAddr,
    pub ticks: u64,
    /// Logical clock at exit: `ticks * tick_duration`, independent of jitter
    pub server_time: f64,
}

/// Payload broadcast every tick: byte `i` holds `i mod 256`
pub fn default_payload() -> Vec<u8> {
    (0..MAX_PAYLOAD_BYTES).map(|i| i as u8).collect()
}

/// Owns one transport server and drives it at a fixed tick rate.
pub struct ServerInstance<T: Transport> {
    index: usize,
    addr: SocketAddr,
    transport: T,
    tick_duration: Duration,
    payload: Vec<u8>,
    state: watch::Sender<InstanceState>,
}

impl<T: Transport> ServerInstance<T> {
    pub fn new(index: usize, addr: SocketAddr, transport: T, tick_duration: Duration) -> Self {
        let (state, _) = watch::channel(InstanceState::Uninitialized);
        Self {
            index,
            addr,
            transport,
            tick_duration,
            payload: default_payload(),
            state,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Observes state transitions from outside the worker
    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: InstanceState) {
        debug!("Instance {} ({}) is {}", self.index, self.addr, state);
        self.state.send_replace(state);
    }

    /// Initializes the transport and binds its socket.
    pub fn bind(&mut self) -> Result<(), InstanceError> {
        self.transport.init().map_err(|source| InstanceError::Init {
            index: self.index,
            addr: self.addr,
            source,
        })?;

        self.transport.listen().map_err(|source| InstanceError::Listen {
            index: self.index,
            addr: self.addr,
            source,
        })?;

        self.set_state(InstanceState::Bound);
        Ok(())
    }

    /// Binds, then ticks until `stop` is cancelled.
    ///
    /// The stop signal is polled at the start of every tick, so a cancelled
    /// instance runs at most the tick already in progress. Overrunning ticks
    /// are not caught up; the next one simply starts late.
    pub async fn run(mut self, stop: CancellationToken) -> Result<InstanceReport, InstanceError> {
        if let Err(e) = self.bind() {
            error!("{}", e);
            return Err(e);
        }

        self.set_state(InstanceState::Running);
        info!("Instance {} ticking on {}", self.index, self.addr);

        let delta = self.tick_duration.as_secs_f64();
        let mut server_time = 0.0;
        let mut ticks = 0u64;

        loop {
            if stop.is_cancelled() {
                break;
            }

            let tick_start = Instant::now();
            self.tick(server_time);

            // Sleep the remainder of the interval, waking early on shutdown
            let remaining = self.tick_duration.saturating_sub(tick_start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = stop.cancelled() => {}
            }

            server_time += delta;
            ticks += 1;
        }

        self.set_state(InstanceState::Stopping);
        self.transport.stop();
        self.set_state(InstanceState::Stopped);
        info!(
            "Instance {} on {} stopped after {} ticks",
            self.index, self.addr, ticks
        );

        Ok(InstanceReport {
            index: self.index,
            addr: self.addr,
            ticks,
            server_time,
        })
    }

    fn tick(&mut self, server_time: f64) {
        self.transport.update(server_time);

        // Payload contents are not interpreted here; draining keeps queues bounded
        for client_index in 0..self.transport.max_clients() {
            while self.transport.recv_payload(client_index).is_some() {}
        }

        self.transport.send_payloads(&self.payload);
    }
}
