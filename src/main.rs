use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use scanhub_server::auth::jwt;
use scanhub_server::config::{generate_config_template, Config};
use scanhub_server::db;
use scanhub_server::routes;
use scanhub_server::session::{heartbeat, SessionManager};
use scanhub_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "scanhub_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "scanhub_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("SCANHUB server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database (identity lookup + availability signal)
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    // Build application state
    let state = AppState {
        db,
        jwt_secret,
        sessions: SessionManager::new(),
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
    };

    // Start the heartbeat monitor. Failure to set up the timer task would
    // be a startup error; once running, sweeps never kill the process.
    let monitor = heartbeat::spawn(state.clone());
    tracing::info!(
        interval_secs = config.heartbeat_interval_secs,
        "Heartbeat monitor started"
    );

    // Build router
    let app = routes::build_router(state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Cancel the sweep timer before exit so no tick fires mid-teardown.
    monitor.abort();
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
