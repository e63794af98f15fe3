use clap::Parser;
use log::{error, info, warn};
use server::config::KEY_ENV_VAR;
use server::{
    Args, ClientIdAllocator, ControlPlane, ServerPool, ShutdownCoordinator, ShutdownSource,
    TokenIssuer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// How long stopped instances get to finish their last tick and tear down
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts the server fleet and the token web server, then waits for shutdown.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config(std::env::var(KEY_ENV_VAR).ok())?;

    let shutdown = ShutdownCoordinator::new();
    let interrupt = shutdown.spawn_interrupt_listener();

    // Launch the UDP servers
    let key = config.key.clone();
    let protocol_id = config.tokens.protocol_id;
    let max_clients = config.max_clients;
    let mut pool = ServerPool::start(&config.pool, shutdown.token(), |addr| {
        shared::Server::new(addr, key.clone(), protocol_id, max_clients)
    })?;

    // Token web server
    let listener = match TcpListener::bind(config.web_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind token server on {}: {}", config.web_addr, e);
            shutdown.trigger(ShutdownSource::Fatal);
            pool.join_all(JOIN_TIMEOUT).await;
            return Err(e.into());
        }
    };
    let control_plane = ControlPlane::new(
        Arc::new(ClientIdAllocator::new()),
        Arc::new(TokenIssuer::new(config.key)),
        pool.topology(),
        config.tokens,
        shutdown.clone(),
    );

    let mut failed_instance = None;
    tokio::select! {
        result = control_plane.serve(listener) => {
            if let Err(e) = result {
                error!("Token server failed: {}", e);
                shutdown.trigger(ShutdownSource::Fatal);
            }
        }
        index = pool.wait_for_failure() => {
            error!("Server instance {} failed to start, shutting down", index);
            shutdown.trigger(ShutdownSource::Fatal);
            failed_instance = Some(index);
        }
    }

    let reports = pool.join_all(JOIN_TIMEOUT).await;
    for report in &reports {
        match report {
            Ok(report) => info!(
                "Instance {} on {} stopped after {} ticks ({:.2}s server time)",
                report.index, report.addr, report.ticks, report.server_time
            ),
            Err(e) => warn!("{}", e),
        }
    }

    interrupt.abort();
    info!("Shutdown complete");

    match failed_instance {
        Some(index) => Err(format!("server instance {} failed to start", index).into()),
        None => Ok(()),
    }
}
