//! erl-loader - entity-resolution queue loader entry point

use clap::Parser;
use erl_common::logging::{init_logging, LogConfig};
use erl_common::LoaderError;
use erl_loader::config::{Cli, ConsumerConfig};
use erl_loader::consumer;
use erl_loader::engine::{EngineGateway, HttpEngineGateway, NoopEngineGateway};
use erl_loader::input;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit code for configuration errors, after printing usage help
const EXIT_CONFIG: i32 = 2;

/// Exit code for runtime failures
const EXIT_RUNTIME: i32 = 1;

fn exit_config_error(err: &LoaderError) -> ! {
    eprintln!("Error: {err}");
    eprintln!();
    eprintln!("For more information, try '--help'.");
    process::exit(EXIT_CONFIG);
}

/// Choose the engine gateway once, at startup.
fn build_gateway(config: &ConsumerConfig) -> Result<Arc<dyn EngineGateway>, LoaderError> {
    if config.dry_run {
        info!("dry run: records will be validated and dropped");
        return Ok(Arc::new(NoopEngineGateway::new()));
    }
    match &config.engine_url {
        Some(url) => Ok(Arc::new(HttpEngineGateway::new(
            url,
            config.engine_config_json.as_deref(),
        )?)),
        None => Err(LoaderError::config(
            "an engine URL is required unless --dry-run is set (--engine-url)",
        )),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if let Some(ref level) = cli.log_level {
        match level.parse() {
            Ok(level) => log_config = log_config.with_level(level),
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(EXIT_CONFIG);
            },
        }
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Error: failed to initialize logging: {e}");
        process::exit(EXIT_RUNTIME);
    }

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "starting"
    );

    let config = match ConsumerConfig::resolve(&cli) {
        Ok(config) => config,
        Err(e) => exit_config_error(&e),
    };

    if config.delay_seconds > 0 {
        info!(delay_seconds = config.delay_seconds, "startup delay");
        tokio::time::sleep(Duration::from_secs(config.delay_seconds)).await;
    }

    let gateway = match build_gateway(&config) {
        Ok(gateway) => gateway,
        Err(e) => exit_config_error(&e),
    };

    let transport = match input::select(&config) {
        Ok(transport) => transport,
        Err(e) => exit_config_error(&e),
    };

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining in-flight work");
            shutdown.cancel();
        }
    });

    info!(load_id = %config.load_id, workers = config.worker_count, "consuming");
    match consumer::run(token, transport, &config, gateway).await {
        Ok(()) => info!("shutdown complete"),
        Err(e) => {
            error!(error = %e, "consumption failed");
            process::exit(EXIT_RUNTIME);
        },
    }
}
