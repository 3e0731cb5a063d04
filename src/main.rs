//! Entry point and lifecycle: parses CLI flags, fetches the node's
//! configuration and user roster from the subscription API, starts the
//! periodic refresh/report tasks and the QUIC acceptor, and shuts down
//! cleanly on SIGINT/SIGTERM.

use clap::Parser;
use hysteria_node::api::{HttpApiClient, SubscriptionApi};
use hysteria_node::config::{self, ServerConfig};
use hysteria_node::keypair;
use hysteria_node::registry::{TrafficTable, UserTable};
use hysteria_node::server::Server;
use hysteria_node::tasks::{fetch_users_task, report_traffic_task};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Hysteria-protocol QUIC proxy fleet node.
///
/// All flags are also settable via an `X_PANDA_HYSTERIA_`-prefixed
/// environment variable (e.g. `X_PANDA_HYSTERIA_API`).
#[derive(Parser, Debug)]
#[command(name = "hysteria-node", disable_version_flag = true)]
struct Cli {
    /// Subscription API base URL.
    #[arg(long, env = "X_PANDA_HYSTERIA_API")]
    api: String,

    /// Bearer token for the subscription API.
    #[arg(long, env = "X_PANDA_HYSTERIA_TOKEN")]
    token: String,

    /// This node's id, as known to the subscription API.
    #[arg(long, env = "X_PANDA_HYSTERIA_NODE")]
    node: i64,

    /// HTTP timeout for subscription API calls.
    #[arg(long, env = "X_PANDA_HYSTERIA_TIMEOUT", value_parser = humantime::parse_duration, default_value = "15s")]
    timeout: Duration,

    /// TLS certificate file.
    #[arg(long, env = "X_PANDA_HYSTERIA_CERT_FILE", default_value = "/root/.cert/server.crt")]
    cert_file: PathBuf,

    /// TLS private key file.
    #[arg(long, env = "X_PANDA_HYSTERIA_KEY_FILE", default_value = "/root/.cert/server.key")]
    key_file: PathBuf,

    /// Interval between user-roster refreshes.
    #[arg(long, env = "X_PANDA_HYSTERIA_FETCH_USERS_INTERVAL", value_parser = humantime::parse_duration, default_value = "60s")]
    fetch_users_interval: Duration,

    /// Interval between traffic reports.
    #[arg(long, env = "X_PANDA_HYSTERIA_REPORT_TRAFFIC_INTERVAL", value_parser = humantime::parse_duration, default_value = "90s")]
    report_traffics_interval: Duration,

    /// Log verbosity: debug, info, or error.
    #[arg(long, env = "X_PANDA_HYSTERIA_LOG_MODE", default_value = "error")]
    log_mode: String,

    /// Print `version=<v>` and exit.
    #[arg(long)]
    version: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("version={}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let level = match config::validate_log_mode(&cli.log_mode) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    env_logger::Builder::new()
        .filter_level(level.parse().expect("validated log levels always parse"))
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("failed to start the async runtime");
    if let Err(e) = runtime.block_on(run(cli)) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let api: Arc<dyn SubscriptionApi> = Arc::new(HttpApiClient::new(
        cli.api.clone(),
        cli.token.clone(),
        cli.node.to_string(),
        cli.timeout,
    ));

    let node_info = api.get_node_info().await?;
    let server_config = ServerConfig::from_node_info(
        &node_info,
        cli.cert_file.display().to_string(),
        cli.key_file.display().to_string(),
    )?;
    info!(
        "node config: listen={} protocol={:?} up={}bps down={}bps disable_udp={}",
        server_config.listen,
        server_config.protocol,
        server_config.up_bps(),
        server_config.down_bps(),
        server_config.disable_udp
    );

    let tls_config = keypair::load_tls_config(&cli.cert_file, &cli.key_file)?;

    let users = Arc::new(UserTable::new());
    let initial_roster = api.get_user_list().await?;
    hysteria_node::registry::apply_diff(&users, &[], &initial_roster);
    info!("loaded {} users", users.len());

    let traffic = Arc::new(TrafficTable::new());

    let server = Server::bind(&server_config, tls_config, users.clone(), traffic.clone())?;

    let fetch_handle = tokio::spawn(fetch_users_task(
        api.clone(),
        users.clone(),
        cli.fetch_users_interval,
    ));
    let report_handle = tokio::spawn(report_traffic_task(
        api.clone(),
        traffic.clone(),
        cli.report_traffics_interval,
    ));

    let serve = async {
        server.serve().await;
    };

    tokio::select! {
        _ = serve => {
            info!("acceptor exited");
        }
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            server.shutdown();
        }
    }

    fetch_handle.abort();
    report_handle.abort();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
