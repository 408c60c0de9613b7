use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use walletgate::{app, AppState, Config};

#[derive(Parser)]
#[command(name = "walletgate", version, about = "Wallet-authenticated remote access gateway")]
struct Args {
    /// Path to the TOML configuration file. Defaults to `walletgate.toml`
    /// in the current directory if present.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.auth.authorized_addresses.is_empty() {
        warn!("allow-list is empty: any wallet with a valid signature will be admitted");
    }
    if config.server.allowed_origins.is_empty() {
        warn!("no allowed origins configured: accepting cross-origin requests from anywhere");
    }

    let listen = config.server.listen.clone();
    let state = AppState::new(config);
    let shutdown = state.shutdown.clone();
    let registry = state.registry.clone();
    let router = app(state);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {listen}: {e}"));
    info!(%listen, "gateway listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await
        .expect("server error");

    // Connections are gone; close whatever backends are still live.
    registry.close_all().await;
    info!("gateway stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
