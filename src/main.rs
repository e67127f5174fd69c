use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{error, info, warn};

use storefront_fulfillment as app;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = app::config::load_config()?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = app::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        app::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);
    let cfg = Arc::new(cfg);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(app::events::EventSender::new(event_tx));
    tokio::spawn(app::events::process_events(event_rx));

    // External collaborators
    let notifier = app::notifications::notifier_from_config(&cfg.notifications)
        .context("failed to build notifier")?;
    let collaborators = app::services::orders::OrderCollaborators {
        carrier: Arc::new(app::shipping::HttpCarrierClient::new(&cfg.carrier)?),
        gateway: Arc::new(app::payments::HttpPaymentGateway::new(&cfg.payment)?),
        notifications: app::notifications::NotificationDispatcher::new(
            notifier,
            cfg.notifications.operator_address.clone(),
        ),
    };

    // Aggregate app services used by HTTP handlers
    let services = app::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        cfg.clone(),
        collaborators,
    );

    if cfg.retry_queue.enabled {
        Arc::new(services.retry_scheduler()).spawn();
    } else {
        warn!("Retry queue scheduler disabled; failed shipments stay queued until it is enabled");
    }

    let app_state = app::AppState {
        db: db_arc,
        config: cfg.clone(),
        event_sender,
        services,
    };
    let router = app::app_router(app_state);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    info!("storefront-fulfillment listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
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
                error!("failed to install SIGTERM handler: {}", e);
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
}
