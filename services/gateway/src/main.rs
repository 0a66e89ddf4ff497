// gateway: Bridges relay-delivered messages to an AI backend, metered in
// micropayment units.
//
// Exit codes: 0 normal, 1 config/signer errors, 2 no relay reachable at
// startup.

use clap::Parser;
use gateway::config;
use gateway::oracle::HttpOracle;
use gateway::signer::KeySigner;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "Relay-to-AI gateway with micropayment metering")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "gateway starting");

    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            return ExitCode::from(1);
        }
    };

    let signer = match KeySigner::from_encoded(&cfg.private_key) {
        Ok(signer) => Arc::new(signer),
        Err(e) => {
            eprintln!("FATAL: invalid private key: {}", e);
            return ExitCode::from(1);
        }
    };

    let oracle = match HttpOracle::new(
        cfg.ai.api_url.clone(),
        cfg.ai.api_key.clone(),
        cfg.ai.model.clone(),
        Duration::from_millis(cfg.ai.timeout_ms),
    ) {
        Ok(oracle) => oracle,
        Err(e) => {
            eprintln!("FATAL: could not build AI client: {}", e);
            return ExitCode::from(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match gateway::run(cfg, signer, oracle, shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(gateway::GatewayError::NoRelayConnected) => {
            error!("could not connect to any relay at startup");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "gateway failed");
            ExitCode::from(1)
        }
    }
}
