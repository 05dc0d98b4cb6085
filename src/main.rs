use clap::Parser;
use sxgate::admin::AdminListener;
use sxgate::config::GatewayConfig;
use sxgate::gateway::Gateway;
use sxgate::listener::Listener;
use sxgate::watcher;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// HTTP reverse-proxy gateway with per-route auth, caching and rate
/// limiting.
#[derive(Parser, Debug)]
#[command(name = "sxgate", version)]
struct Args {
    /// Listen address for proxied traffic.
    #[arg(short = 'l', long, default_value = "0.0.0.0:7654")]
    listen: String,

    /// Listen address for the metrics and health endpoints.
    #[arg(long, default_value = "0.0.0.0:6060")]
    admin: String,

    /// Path to the configuration file.
    #[arg(short = 'f', long, default_value = "config.yml")]
    config: PathBuf,

    /// Follow upstream redirects on GET requests.
    #[arg(long)]
    fast: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let conf = GatewayConfig::from_path(&args.config)?;

    let gateway = Arc::new(Gateway::new(args.fast));
    gateway.load_config(&conf)?;

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let proxy_listener = Listener::bind(&args.listen, Arc::clone(&gateway)).await?;
    info!("listening at {}", proxy_listener.local_addr());

    let admin_listener = AdminListener::bind(&args.admin).await?;
    info!(
        "admin endpoints on {} (/healthz, /metrics)",
        admin_listener.local_addr()
    );

    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        let config_path = args.config.clone();
        async move {
            if let Err(e) = watcher::watch_config(config_path, gateway).await {
                error!("configuration watcher error: {}", e);
            }
        }
    });

    let mut proxy_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = proxy_listener.serve(shutdown_rx).await {
                error!("proxy listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut proxy_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut proxy_task => {
            proxy_finished = true;
            if let Err(err) = res {
                error!("proxy task join error: {}", err);
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            if let Err(err) = res {
                error!("admin task join error: {}", err);
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !proxy_finished {
        if let Err(err) = proxy_task.await {
            error!("proxy task join error: {}", err);
        }
    }

    if !admin_finished {
        if let Err(err) = admin_task.await {
            error!("admin task join error: {}", err);
        }
    }

    info!("shutdown complete");
    Ok(())
}
