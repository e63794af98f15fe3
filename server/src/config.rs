//! Command line configuration for the fleet binary.

use crate::control_plane::TokenSettings;
use crate::pool::PoolConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use log::warn;
use shared::{PrivateKey, KEY_BYTES, MAX_CLIENTS, MAX_SERVERS_PER_CONNECT};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

pub const PROTOCOL_ID: u64 = 0x1122334455667788;
pub const CONNECT_TOKEN_EXPIRY: u64 = 30;
pub const TIMEOUT_SECONDS: i32 = 1;
/// Environment variable holding the base64 encoded shared key
pub const KEY_ENV_VAR: &str = "NETCODE_SERVER_KEY";

// Development key only. Production deployments provision the shared key from
// a secret store through NETCODE_SERVER_KEY.
const DEV_SERVER_KEY: [u8; KEY_BYTES] = [
    0x60, 0x6a, 0xbe, 0x6e, 0xc9, 0x19, 0x10, 0xea, 0x9a, 0x65, 0x62, 0xf6, 0x6f, 0x2b, 0x30, 0xe4,
    0x43, 0x71, 0xd6, 0x2c, 0xd1, 0x99, 0x27, 0x26, 0x6b, 0x3c, 0x60, 0xf4, 0xb7, 0x15, 0xab, 0xa1,
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--num-servers must be at least 1")]
    NoServers,

    #[error("{count} servers starting at port {port} overflow the port range")]
    PortRange { port: u16, count: usize },

    #[error("--max-clients must be between 1 and {MAX_CLIENTS}, got {0}")]
    MaxClients(usize),

    #[error("--tick-rate must be between 1 and 1000, got {0}")]
    TickRate(u32),

    #[error("invalid protocol id {0:?}")]
    ProtocolId(String),

    #[error("{KEY_ENV_VAR} is not valid base64")]
    KeyEncoding,

    #[error("{KEY_ENV_VAR} must decode to {KEY_BYTES} bytes, got {0}")]
    KeyLength(usize),
}

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Runs a fleet of UDP game servers and a connect token web service"
)]
pub struct Args {
    /// Address the token web server binds to
    #[arg(short = 'w', long, default_value = "0.0.0.0:8880")]
    pub web_addr: SocketAddr,

    /// Number of UDP servers to start on successive ports
    #[arg(short = 'n', long, default_value = "3")]
    pub num_servers: usize,

    /// Starting UDP port, incremented by one per server
    #[arg(short, long, default_value = "40000")]
    pub port: u16,

    /// Maximum clients per server
    #[arg(short, long, default_value = "256")]
    pub max_clients: usize,

    /// Host the UDP servers bind to and advertise in tokens
    #[arg(short = 'H', long, default_value = "::1")]
    pub bind_host: IpAddr,

    /// Server ticks per second
    #[arg(short, long, default_value = "60")]
    pub tick_rate: u32,

    /// Seconds a connect token stays redeemable
    #[arg(long, default_value_t = CONNECT_TOKEN_EXPIRY)]
    pub token_expiry: u64,

    /// Seconds of silence before a connected client is dropped
    #[arg(long, default_value_t = TIMEOUT_SECONDS)]
    pub timeout_seconds: i32,

    /// Protocol id shared by tokens and servers, decimal or 0x-prefixed hex
    #[arg(long, default_value = "0x1122334455667788")]
    pub protocol_id: String,
}

/// Validated startup configuration
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub web_addr: SocketAddr,
    pub pool: PoolConfig,
    pub max_clients: usize,
    pub tokens: TokenSettings,
    pub key: PrivateKey,
}

impl Args {
    /// Validates flags and resolves the shared key from `key_source`
    /// (normally the value of `NETCODE_SERVER_KEY`).
    pub fn into_config(self, key_source: Option<String>) -> Result<FleetConfig, ConfigError> {
        if self.num_servers == 0 {
            return Err(ConfigError::NoServers);
        }
        if self.num_servers - 1 > (u16::MAX - self.port) as usize {
            return Err(ConfigError::PortRange {
                port: self.port,
                count: self.num_servers,
            });
        }
        if self.num_servers > MAX_SERVERS_PER_CONNECT {
            warn!(
                "{} servers exceed the {} a connect token can name; token requests will fail",
                self.num_servers, MAX_SERVERS_PER_CONNECT
            );
        }
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(ConfigError::MaxClients(self.max_clients));
        }
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::TickRate(self.tick_rate));
        }

        let protocol_id = parse_protocol_id(&self.protocol_id)?;
        let key = resolve_key(key_source)?;

        Ok(FleetConfig {
            web_addr: self.web_addr,
            pool: PoolConfig {
                bind_host: self.bind_host,
                starting_port: self.port,
                instance_count: self.num_servers,
                tick_duration: Duration::from_secs_f64(1.0 / self.tick_rate as f64),
            },
            max_clients: self.max_clients,
            tokens: TokenSettings {
                protocol_id,
                expiry_seconds: self.token_expiry,
                timeout_seconds: self.timeout_seconds,
                sequence: 0,
            },
            key,
        })
    }
}

fn parse_protocol_id(value: &str) -> Result<u64, ConfigError> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::ProtocolId(value.to_string()))
}

fn resolve_key(key_source: Option<String>) -> Result<PrivateKey, ConfigError> {
    match key_source {
        Some(encoded) => {
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|_| ConfigError::KeyEncoding)?;
            PrivateKey::from_slice(&bytes).map_err(|_| ConfigError::KeyLength(bytes.len()))
        }
        None => {
            warn!(
                "{} not set, using the built-in development key",
                KEY_ENV_VAR
            );
            Ok(PrivateKey::from_bytes(DEV_SERVER_KEY))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["server"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_flags() {
        let config = parse(&[]).into_config(None).unwrap();

        assert_eq!(config.web_addr, "0.0.0.0:8880".parse().unwrap());
        assert_eq!(config.pool.instance_count, 3);
        assert_eq!(config.pool.starting_port, 40000);
        assert_eq!(config.pool.bind_host, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(config.max_clients, 256);
        assert_eq!(config.tokens.protocol_id, PROTOCOL_ID);
        assert_eq!(config.tokens.expiry_seconds, 30);
        assert_eq!(config.tokens.timeout_seconds, 1);
        assert_eq!(config.key, PrivateKey::from_bytes(DEV_SERVER_KEY));

        let tick = config.pool.tick_duration.as_secs_f64();
        assert!((tick - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--web-addr",
            "127.0.0.1:9000",
            "--num-servers",
            "5",
            "--port",
            "41000",
            "--max-clients",
            "16",
            "--bind-host",
            "127.0.0.1",
            "--tick-rate",
            "30",
            "--protocol-id",
            "42",
        ])
        .into_config(None)
        .unwrap();

        assert_eq!(config.web_addr.port(), 9000);
        assert_eq!(config.pool.instance_count, 5);
        assert_eq!(config.pool.starting_port, 41000);
        assert_eq!(config.max_clients, 16);
        assert_eq!(config.tokens.protocol_id, 42);
        assert_eq!(config.pool.tick_duration, Duration::from_secs_f64(1.0 / 30.0));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            parse(&["--num-servers", "0"]).into_config(None),
            Err(ConfigError::NoServers)
        ));
        assert!(matches!(
            parse(&["--port", "65535", "--num-servers", "2"]).into_config(None),
            Err(ConfigError::PortRange { .. })
        ));
        let huge = usize::MAX.to_string();
        assert!(matches!(
            parse(&["--num-servers", huge.as_str()]).into_config(None),
            Err(ConfigError::PortRange { .. })
        ));
        assert!(matches!(
            parse(&["--max-clients", "0"]).into_config(None),
            Err(ConfigError::MaxClients(0))
        ));
        assert!(matches!(
            parse(&["--tick-rate", "0"]).into_config(None),
            Err(ConfigError::TickRate(0))
        ));
        assert!(matches!(
            parse(&["--protocol-id", "0xZZ"]).into_config(None),
            Err(ConfigError::ProtocolId(_))
        ));
    }

    #[test]
    fn test_key_from_environment_value() {
        let encoded = STANDARD.encode([3u8; KEY_BYTES]);
        let config = parse(&[]).into_config(Some(encoded)).unwrap();
        assert_eq!(config.key, PrivateKey::from_bytes([3u8; KEY_BYTES]));

        assert!(matches!(
            parse(&[]).into_config(Some("not base64!".to_string())),
            Err(ConfigError::KeyEncoding)
        ));

        let short = STANDARD.encode([3u8; 8]);
        assert!(matches!(
            parse(&[]).into_config(Some(short)),
            Err(ConfigError::KeyLength(8))
        ));
    }

    #[test]
    fn test_protocol_id_formats() {
        assert_eq!(parse_protocol_id("0x10").unwrap(), 16);
        assert_eq!(parse_protocol_id("0X10").unwrap(), 16);
        assert_eq!(parse_protocol_id("10").unwrap(), 10);
        assert!(parse_protocol_id("").is_err());
    }
}
