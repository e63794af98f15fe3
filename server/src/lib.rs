//! # Fleet Server Library
//!
//! Runs several authenticated UDP game servers inside one process and hands
//! out connect tokens for them over HTTP.
//!
//! ## Layout
//!
//! - [`topology`] computes the ordered list of server addresses
//! - [`pool`] owns one tick-loop task per address ([`instance`])
//! - [`control_plane`] serves `/token` and `/shutdown`
//! - [`allocator`] and [`issuer`] produce client ids and sealed tokens
//! - [`shutdown`] turns Ctrl+C, HTTP and startup failures into one stop signal
//! - [`config`] parses the command line
//!
//! The token endpoint and the servers share no mutable state. Both read the
//! same immutable [`topology::ServerTopology`], so every issued token names
//! exactly the servers that were launched.

pub mod allocator;
pub mod config;
pub mod control_plane;
pub mod instance;
pub mod issuer;
pub mod pool;
pub mod shutdown;
pub mod topology;

pub use allocator::ClientIdAllocator;
pub use config::{Args, ConfigError, FleetConfig};
pub use control_plane::{ControlPlane, TokenSettings};
pub use instance::{InstanceError, InstanceReport, InstanceState, ServerInstance};
pub use issuer::{TokenGenerationError, TokenIssuer};
pub use pool::{InstanceHandle, PoolConfig, ServerPool};
pub use shutdown::{ShutdownCoordinator, ShutdownSource};
pub use topology::{ServerTopology, TopologyError};
