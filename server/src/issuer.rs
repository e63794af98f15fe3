//! Connect token issuance for newly allocated client identities.

use crate::topology::ServerTopology;
use rand::rngs::OsRng;
use rand::RngCore;
use shared::{ConnectToken, PrivateKey, TokenError, USER_DATA_BYTES};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenGenerationError {
    #[error("failed to generate user data: {0}")]
    Entropy(#[source] rand::Error),

    #[error("failed to build connect token: {0}")]
    Token(#[from] TokenError),
}

/// Mints connect tokens sealed with the fleet's shared key.
///
/// The entropy source is cloned for every token, so it has to be a handle
/// to a shared generator such as `OsRng` rather than a seeded one.
pub struct TokenIssuer<R = OsRng> {
    key: PrivateKey,
    rng: R,
}

impl TokenIssuer<OsRng> {
    pub fn new(key: PrivateKey) -> Self {
        Self::with_rng(key, OsRng)
    }
}

impl<R: RngCore + Clone> TokenIssuer<R> {
    pub fn with_rng(key: PrivateKey, rng: R) -> Self {
        Self { key, rng }
    }

    /// Builds a serialized token naming every address in `topology`.
    ///
    /// Nothing is returned on failure; a half-built token never leaves here.
    pub fn issue(
        &self,
        client_id: u64,
        topology: &ServerTopology,
        protocol_id: u64,
        expiry_seconds: u64,
        timeout_seconds: i32,
        sequence: u64,
    ) -> Result<Vec<u8>, TokenGenerationError> {
        let mut rng = self.rng.clone();

        let mut user_data = vec![0u8; USER_DATA_BYTES];
        rng.try_fill_bytes(&mut user_data)
            .map_err(TokenGenerationError::Entropy)?;

        let token = ConnectToken::generate(
            client_id,
            topology.addrs(),
            protocol_id,
            expiry_seconds,
            timeout_seconds,
            sequence,
            &user_data,
            &self.key,
            &mut rng,
        )?;

        Ok(token.write()?)
    }
}
