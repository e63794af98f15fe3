//! Secure UDP transport shared by the fleet server and its clients.
//!
//! Connect tokens are minted by a web service holding the shared private key
//! and redeemed by presenting them to one of the UDP servers they name. The
//! server side is exposed through the [`Transport`] trait so the orchestration
//! layer can tick any implementation at a fixed rate.

pub mod error;
pub mod server;
pub mod token;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use error::{TokenError, TransportError};
pub use server::Server;
pub use token::{ConnectToken, PrivateConnectToken};

pub const VERSION_INFO: [u8; VERSION_INFO_BYTES] = *b"NETCODE 1.02\0";
pub const VERSION_INFO_BYTES: usize = 13;
pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 24;
pub const MAC_BYTES: usize = 16;
pub const USER_DATA_BYTES: usize = 256;
pub const CONNECT_TOKEN_BYTES: usize = 2048;
pub const CONNECT_TOKEN_PRIVATE_BYTES: usize = 1024;
pub const MAX_SERVERS_PER_CONNECT: usize = 32;
pub const MAX_PAYLOAD_BYTES: usize = 1200;
pub const MAX_PACKET_BYTES: usize = 1220;
pub const MAX_CLIENTS: usize = 256;

/// Shared secret used to seal and open connect tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; KEY_BYTES]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TokenError> {
        let key: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| TokenError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Lifecycle operations a fixed-rate tick loop drives on one UDP server.
pub trait Transport: Send + 'static {
    /// Validates configuration and allocates client slots.
    fn init(&mut self) -> Result<(), TransportError>;

    /// Binds the UDP socket.
    fn listen(&mut self) -> Result<(), TransportError>;

    /// Advances the transport clock, processing all pending datagrams.
    fn update(&mut self, time: f64);

    fn max_clients(&self) -> usize;

    /// Pops the oldest queued payload for a client slot.
    fn recv_payload(&mut self, client_index: usize) -> Option<Vec<u8>>;

    /// Sends the same payload to every connected client.
    fn send_payloads(&mut self, payload: &[u8]);

    /// Disconnects every client and releases the socket.
    fn stop(&mut self);
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionRequest {
        version_info: [u8; VERSION_INFO_BYTES],
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: [u8; NONCE_BYTES],
        private_data: Vec<u8>,
    },
    ConnectionAccepted {
        client_index: u32,
        max_clients: u32,
    },
    ConnectionDenied,
    KeepAlive,
    Payload {
        sequence: u64,
        data: Vec<u8>,
    },
    Disconnect,
}

impl Packet {
    /// Builds the request a client sends to redeem `token`.
    pub fn connection_request(token: &ConnectToken) -> Self {
        Packet::ConnectionRequest {
            version_info: token.version_info,
            protocol_id: token.protocol_id,
            expire_timestamp: token.expire_timestamp,
            nonce: token.nonce,
            private_data: token.private_data.clone(),
        }
    }
}

/// JSON envelope handed out by the token endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WebToken {
    pub client_id: u64,
    pub connect_token: String,
}

// Seconds since the unix epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info_is_null_terminated() {
        assert_eq!(VERSION_INFO.len(), VERSION_INFO_BYTES);
        assert_eq!(VERSION_INFO[VERSION_INFO_BYTES - 1], 0);
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::from_bytes([0xAB; KEY_BYTES]);
        let printed = format!("{:?}", key);
        assert!(!printed.contains("171"));
        assert!(!printed.to_lowercase().contains("ab"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_private_key_from_slice_checks_length() {
        assert!(PrivateKey::from_slice(&[1u8; KEY_BYTES]).is_ok());

        match PrivateKey::from_slice(&[1u8; 16]) {
            Err(TokenError::InvalidKeyLength(len)) => assert_eq!(len, 16),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_largest_payload_packet_fits_packet_budget() {
        let packet = Packet::Payload {
            sequence: u64::MAX,
            data: vec![0xFF; MAX_PAYLOAD_BYTES],
        };

        let serialized = bincode::serialize(&packet).unwrap();
        assert!(serialized.len() <= MAX_PACKET_BYTES);
    }

    #[test]
    fn test_connection_request_fits_packet_budget() {
        let packet = Packet::ConnectionRequest {
            version_info: VERSION_INFO,
            protocol_id: 0x1122334455667788,
            expire_timestamp: u64::MAX,
            nonce: [7; NONCE_BYTES],
            private_data: vec![0; CONNECT_TOKEN_PRIVATE_BYTES],
        };

        let serialized = bincode::serialize(&packet).unwrap();
        assert!(serialized.len() <= MAX_PACKET_BYTES);
    }

    #[test]
    fn test_truncated_packet_is_rejected() {
        let data = bincode::serialize(&Packet::Payload {
            sequence: 9,
            data: vec![1, 2, 3, 4],
        })
        .unwrap();

        let result: Result<Packet, _> = bincode::deserialize(&data[..data.len() / 2]);
        assert!(result.is_err());

        let empty: Result<Packet, _> = bincode::deserialize(&[]);
        assert!(empty.is_err());
    }
}
