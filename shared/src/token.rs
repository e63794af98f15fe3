//! Connect tokens: the capability a client presents to a UDP server.
//!
//! A token has a public part the client can read (which servers to try, when
//! the token expires, the connection timeout) and a private part sealed with
//! XChaCha20-Poly1305 under the key shared by the token issuer and every
//! server. Version info, protocol id and expiry are bound as associated data,
//! so a server rejects tokens minted for a different protocol.

use crate::error::TokenError;
use crate::{
    unix_timestamp, PrivateKey, CONNECT_TOKEN_BYTES, CONNECT_TOKEN_PRIVATE_BYTES, MAC_BYTES,
    MAX_SERVERS_PER_CONNECT, NONCE_BYTES, USER_DATA_BYTES, VERSION_INFO, VERSION_INFO_BYTES,
};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Public view of a connect token as it travels to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectToken {
    pub version_info: [u8; VERSION_INFO_BYTES],
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    pub sequence: u64,
    pub nonce: [u8; NONCE_BYTES],
    pub timeout_seconds: i32,
    pub server_addresses: Vec<SocketAddr>,
    /// Sealed [`PrivateConnectToken`], always `CONNECT_TOKEN_PRIVATE_BYTES` long
    pub private_data: Vec<u8>,
}

/// Section of the token only servers holding the private key can read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivateConnectToken {
    pub client_id: u64,
    pub timeout_seconds: i32,
    pub server_addresses: Vec<SocketAddr>,
    pub user_data: Vec<u8>,
}

impl ConnectToken {
    /// Builds and seals a token for `client_id`.
    ///
    /// The expiry is relative to now; enforcement happens on the server
    /// that redeems the token. The nonce is drawn from `rng`.
    #[allow(clippy::too_many_arguments)]
    pub fn generate<R: RngCore + ?Sized>(
        client_id: u64,
        server_addresses: &[SocketAddr],
        protocol_id: u64,
        expiry_seconds: u64,
        timeout_seconds: i32,
        sequence: u64,
        user_data: &[u8],
        key: &PrivateKey,
        rng: &mut R,
    ) -> Result<Self, TokenError> {
        check_server_addresses(server_addresses)?;

        if user_data.len() != USER_DATA_BYTES {
            return Err(TokenError::UserDataSize {
                expected: USER_DATA_BYTES,
                actual: user_data.len(),
            });
        }

        let mut nonce = [0u8; NONCE_BYTES];
        rng.try_fill_bytes(&mut nonce)?;

        let create_timestamp = unix_timestamp();
        let expire_timestamp = create_timestamp.saturating_add(expiry_seconds);

        let private = PrivateConnectToken {
            client_id,
            timeout_seconds,
            server_addresses: server_addresses.to_vec(),
            user_data: user_data.to_vec(),
        };
        let private_data = private.seal(protocol_id, expire_timestamp, &nonce, key)?;

        Ok(Self {
            version_info: VERSION_INFO,
            protocol_id,
            create_timestamp,
            expire_timestamp,
            sequence,
            nonce,
            timeout_seconds,
            server_addresses: server_addresses.to_vec(),
            private_data,
        })
    }

    /// Serializes the token into exactly `CONNECT_TOKEN_BYTES` bytes.
    pub fn write(&self) -> Result<Vec<u8>, TokenError> {
        let mut buffer = bincode::serialize(self)?;
        if buffer.len() > CONNECT_TOKEN_BYTES {
            return Err(TokenError::InvalidLength {
                expected: CONNECT_TOKEN_BYTES,
                actual: buffer.len(),
            });
        }
        buffer.resize(CONNECT_TOKEN_BYTES, 0);
        Ok(buffer)
    }

    /// Parses the public part of a serialized token.
    pub fn read(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != CONNECT_TOKEN_BYTES {
            return Err(TokenError::InvalidLength {
                expected: CONNECT_TOKEN_BYTES,
                actual: bytes.len(),
            });
        }

        let token: ConnectToken = bincode::deserialize(bytes)?;
        if token.version_info != VERSION_INFO {
            return Err(TokenError::InvalidVersion);
        }
        if token.private_data.len() != CONNECT_TOKEN_PRIVATE_BYTES {
            return Err(TokenError::InvalidLength {
                expected: CONNECT_TOKEN_PRIVATE_BYTES,
                actual: token.private_data.len(),
            });
        }
        check_server_addresses(&token.server_addresses)?;

        Ok(token)
    }

    pub fn decrypt_private(&self, key: &PrivateKey) -> Result<PrivateConnectToken, TokenError> {
        PrivateConnectToken::open(
            &self.private_data,
            &self.version_info,
            self.protocol_id,
            self.expire_timestamp,
            &self.nonce,
            key,
        )
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expire_timestamp <= now
    }
}

impl PrivateConnectToken {
    fn seal(
        &self,
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: &[u8; NONCE_BYTES],
        key: &PrivateKey,
    ) -> Result<Vec<u8>, TokenError> {
        let max = CONNECT_TOKEN_PRIVATE_BYTES - MAC_BYTES;
        let mut plaintext = bincode::serialize(self)?;
        if plaintext.len() > max {
            return Err(TokenError::PrivateDataTooLarge {
                actual: plaintext.len(),
                max,
            });
        }
        plaintext.resize(max, 0);

        let aad = associated_data(&VERSION_INFO, protocol_id, expire_timestamp);
        cipher(key)
            .encrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| TokenError::Encrypt)
    }

    /// Opens a sealed private section. Fails if the key, the associated
    /// header fields or the ciphertext do not match what was sealed.
    pub fn open(
        private_data: &[u8],
        version_info: &[u8; VERSION_INFO_BYTES],
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: &[u8; NONCE_BYTES],
        key: &PrivateKey,
    ) -> Result<Self, TokenError> {
        if private_data.len() != CONNECT_TOKEN_PRIVATE_BYTES {
            return Err(TokenError::InvalidLength {
                expected: CONNECT_TOKEN_PRIVATE_BYTES,
                actual: private_data.len(),
            });
        }

        let aad = associated_data(version_info, protocol_id, expire_timestamp);
        let plaintext = cipher(key)
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: private_data,
                    aad: &aad,
                },
            )
            .map_err(|_| TokenError::Decrypt)?;

        // Trailing zero padding is ignored by bincode
        Ok(bincode::deserialize(&plaintext)?)
    }
}

fn cipher(key: &PrivateKey) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

fn associated_data(
    version_info: &[u8; VERSION_INFO_BYTES],
    protocol_id: u64,
    expire_timestamp: u64,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(VERSION_INFO_BYTES + 16);
    aad.extend_from_slice(version_info);
    aad.extend_from_slice(&protocol_id.to_le_bytes());
    aad.extend_from_slice(&expire_timestamp.to_le_bytes());
    aad
}

fn check_server_addresses(addresses: &[SocketAddr]) -> Result<(), TokenError> {
    if addresses.is_empty() {
        return Err(TokenError::NoServerAddresses);
    }
    if addresses.len() > MAX_SERVERS_PER_CONNECT {
        return Err(TokenError::TooManyServerAddresses {
            count: addresses.len(),
            max: MAX_SERVERS_PER_CONNECT,
        });
    }
    Ok(())
}
