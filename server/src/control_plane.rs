//! HTTP side-channel handing out connect tokens and accepting shutdown.
//!
//! ```text
//! GET|POST /token     -> {"client_id": u64, "connect_token": "<base64>"}  or  "error"
//! GET|POST /shutdown  -> "done"
//! ```
//!
//! Token failures answer `200 OK` with a bare `error` body. Callers must look
//! at the body; the status code does not distinguish the two outcomes.

use crate::allocator::ClientIdAllocator;
use crate::issuer::TokenIssuer;
use crate::shutdown::{ShutdownCoordinator, ShutdownSource};
use crate::topology::ServerTopology;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{info, warn};
use shared::WebToken;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// How long in-flight HTTP connections may linger once shutdown starts
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Protocol parameters baked into every token
#[derive(Debug, Clone, Copy)]
pub struct TokenSettings {
    pub protocol_id: u64,
    pub expiry_seconds: u64,
    pub timeout_seconds: i32,
    pub sequence: u64,
}

#[derive(Clone)]
pub struct ControlPlane {
    allocator: Arc<ClientIdAllocator>,
    issuer: Arc<TokenIssuer>,
    topology: Arc<ServerTopology>,
    settings: TokenSettings,
    shutdown: ShutdownCoordinator,
}

impl ControlPlane {
    pub fn new(
        allocator: Arc<ClientIdAllocator>,
        issuer: Arc<TokenIssuer>,
        topology: Arc<ServerTopology>,
        settings: TokenSettings,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            allocator,
            issuer,
            topology,
            settings,
            shutdown,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/token", get(serve_token).post(serve_token))
            .route("/shutdown", get(serve_shutdown).post(serve_shutdown))
            .with_state(self)
    }

    /// Serves until the shutdown coordinator fires. Open connections get
    /// `DRAIN_GRACE` to finish; after that they are abandoned and this returns.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let shutdown = self.shutdown.clone();
        let drain = self.shutdown.clone();
        if let Ok(addr) = listener.local_addr() {
            info!("Token server listening on {}", addr);
        }

        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { drain.triggered().await })
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => result?,
            _ = async {
                shutdown.triggered().await;
                tokio::time::sleep(DRAIN_GRACE).await;
            } => {
                warn!(
                    "Connections still open {:?} after shutdown, dropping them",
                    DRAIN_GRACE
                );
            }
        }

        info!("Token server stopped");
        Ok(())
    }

    fn issue(&self) -> Option<WebToken> {
        let client_id = self.allocator.next();
        let settings = self.settings;

        match self.issuer.issue(
            client_id,
            &self.topology,
            settings.protocol_id,
            settings.expiry_seconds,
            settings.timeout_seconds,
            settings.sequence,
        ) {
            Ok(token) => Some(WebToken {
                client_id,
                connect_token: STANDARD.encode(token),
            }),
            Err(e) => {
                warn!("Failed to issue token for client {}: {}", client_id, e);
                None
            }
        }
    }
}

async fn serve_token(State(plane): State<ControlPlane>) -> Response {
    match plane.issue() {
        Some(token) => {
            info!("Issuing new token for client {}", token.client_id);
            Json(token).into_response()
        }
        None => "error".into_response(),
    }
}

async fn serve_shutdown(State(plane): State<ControlPlane>) -> &'static str {
    plane.shutdown.trigger(ShutdownSource::Http);
    "done"
}
