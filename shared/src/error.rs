//! Error types for token handling and the UDP transport.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("connect token must name at least one server")]
    NoServerAddresses,

    #[error("connect token names {count} servers, at most {max} fit")]
    TooManyServerAddresses { count: usize, max: usize },

    #[error("user data must be {expected} bytes, got {actual}")]
    UserDataSize { expected: usize, actual: usize },

    #[error("private key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("random byte generation failed: {0}")]
    Entropy(#[from] rand::Error),

    #[error("private token section does not fit in {max} bytes ({actual})")]
    PrivateDataTooLarge { actual: usize, max: usize },

    #[error("failed to seal private token section")]
    Encrypt,

    #[error("failed to open private token section")]
    Decrypt,

    #[error("connect token must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unsupported connect token version")]
    InvalidVersion,

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("max clients must be between 1 and {max}, got {actual}")]
    InvalidMaxClients { actual: usize, max: usize },

    #[error("server must be initialized before listening")]
    NotInitialized,

    #[error("server is already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
