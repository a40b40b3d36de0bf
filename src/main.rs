use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{info, warn};

use retail_fulfillment as app;
use app::events::{LoggingNotifier, Notifier};
use app::services::carrier_client::HttpCarrierClient;
use app::services::carriers::CarrierClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = app::config::load_config().context("failed to load configuration")?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_config = app::db::DbConfig::from(&cfg);
    let db_pool = app::db::establish_connection_with_config(&db_config)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        app::db::run_migrations(&db_pool)
            .await
            .context("failed running migrations")?;
    }
    let db = Arc::new(db_pool);

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = app::events::EventSender::new(event_tx);
    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);
    tokio::spawn(app::events::process_events(event_rx, notifier));

    let carrier_client: Arc<dyn CarrierClient> = Arc::new(
        HttpCarrierClient::new(&cfg.carrier).context("failed to build carrier client")?,
    );
    if cfg.carrier.webhook_secret.is_none() {
        warn!("carrier webhook secret not configured; callbacks are accepted unsigned");
    }

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid listen address")?;
    let state = app::AppState::new(db, cfg, event_sender, carrier_client);
    let router = app::handlers::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("fulfillment server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
