//! # Fleet Client Library
//!
//! Minimal headless client for the server fleet. It fetches a connect token
//! from the web endpoint, then redeems it against the servers the token names,
//! trying them in order until one accepts.

pub mod network;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::info;
use shared::{ConnectToken, TokenError, WebToken};
use thiserror::Error;

pub use network::{Client, SessionStats};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint refused to issue a token")]
    TokenRefused,

    #[error("connect token is not valid base64")]
    Encoding(#[from] base64::DecodeError),

    #[error("malformed connect token: {0}")]
    Token(#[from] TokenError),

    #[error("connect token has expired")]
    TokenExpired,

    #[error("no server accepted the connection")]
    ConnectionFailed,

    #[error("disconnected by server")]
    Disconnected,

    #[error("packet encoding failed: {0}")]
    Packet(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Token handed out by the web endpoint, decoded and parsed
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub client_id: u64,
    pub token: ConnectToken,
}

/// Requests a connect token from `base_url` (e.g. `http://127.0.0.1:8880`).
///
/// The endpoint answers `200 OK` with a plain `error` body when it cannot issue
/// a token, so the body is inspected rather than the status.
pub async fn fetch_token(
    http: &reqwest::Client,
    base_url: &str,
) -> Result<IssuedToken, ClientError> {
    let url = format!("{}/token", base_url.trim_end_matches('/'));
    let body = http.get(&url).send().await?.error_for_status()?.text().await?;
    parse_token_response(&body)
}

fn parse_token_response(body: &str) -> Result<IssuedToken, ClientError> {
    if body.trim() == "error" {
        return Err(ClientError::TokenRefused);
    }

    let web_token: WebToken =
        serde_json::from_str(body).map_err(|_| ClientError::TokenRefused)?;
    let bytes = STANDARD.decode(web_token.connect_token.as_bytes())?;
    let token = ConnectToken::read(&bytes)?;

    info!(
        "Received token for client {} naming {} servers",
        web_token.client_id,
        token.server_addresses.len()
    );

    Ok(IssuedToken {
        client_id: web_token.client_id,
        token,
    })
}
