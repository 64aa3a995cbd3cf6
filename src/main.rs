use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{signal, sync::mpsc};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};
use tracing::{error, info, warn};

use order_engine as engine;
use order_engine::events::{EventNotifier, EventSender, Notifier};
use order_engine::services::gateway::DummyGateway;
use order_engine::services::payments::PaymentEngine;
use order_engine::services::pricing::{FlatTaxPricing, PricingProvider};
use order_engine::services::EngineSettings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = engine::config::load_config()?;
    engine::config::init_tracing(cfg.log_level(), cfg.log_json);
    engine::handlers::health::init_start_time();

    // Init DB
    let db_pool = engine::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        engine::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    tokio::spawn(engine::events::process_events(event_rx));
    let notifier: Arc<dyn Notifier> = Arc::new(EventNotifier::new(EventSender::new(event_tx)));

    let pricing: Arc<dyn PricingProvider> = Arc::new(FlatTaxPricing::from_rate(cfg.default_tax_rate));
    let payments = PaymentEngine::new(Arc::new(DummyGateway));
    info!(gateway = payments.gateway_name(), "payment gateway configured");

    let services = engine::handlers::AppServices::new(
        db_arc.clone(),
        notifier,
        pricing,
        payments,
        EngineSettings::from(&cfg),
    );

    let app_state = engine::AppState {
        db: db_arc,
        config: cfg.clone(),
        services,
    };

    let cors_layer = if cfg.is_production() {
        CorsLayer::new()
    } else {
        CorsLayer::permissive()
    };

    let app = engine::app(app_state)
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors_layer);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("order-engine listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
