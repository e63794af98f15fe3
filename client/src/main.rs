use clap::Parser;
use client::{fetch_token, Client};
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the token web server
    #[arg(short = 'w', long, default_value = "http://127.0.0.1:8880")]
    web: String,

    /// Number of ticks to stay connected
    #[arg(short = 'n', long, default_value = "300")]
    ticks: u64,

    /// Client ticks per second
    #[arg(
        short,
        long,
        default_value = "60",
        value_parser = clap::value_parser!(u32).range(1..=1000)
    )]
    tick_rate: u32,

    /// Seconds each server gets to answer a connection request
    #[arg(long, default_value = "2")]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let http = reqwest::Client::new();
    let issued = fetch_token(&http, &args.web).await?;
    info!("Assigned client id {}", issued.client_id);

    let connect_timeout = Duration::from_secs(args.connect_timeout);
    let mut client = Client::connect(&issued.token, connect_timeout).await?;
    let stats = client
        .run(args.ticks, Duration::from_secs_f64(1.0 / args.tick_rate as f64))
        .await?;
    client.disconnect().await?;

    info!(
        "Received {} payloads ({} bytes) over {} ticks, last sequence {}",
        stats.payloads_received, stats.bytes_received, stats.ticks, stats.last_sequence
    );

    Ok(())
}
