use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use http::HeaderValue;
use tokio::{signal, sync::mpsc};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

use agrimart_api as api;
use api::clients::currency::HttpCurrencyConverter;
use api::clients::payments::PaypalGateway;
use api::message_queue::{InMemoryMessageQueue, MessageQueue};
use api::notifications::{
    InvoiceDispatcher, InvoiceSender, LoggingInvoiceSender, WebhookInvoiceSender,
};
use api::services::checkout::CheckoutSettings;
use api::services::pricing::FlatRateShipping;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    // Outbound clients are built once and shared by every request
    let gateway = Arc::new(PaypalGateway::new(&cfg.payment).context("payment gateway client")?);
    let converter =
        Arc::new(HttpCurrencyConverter::new(&cfg.currency).context("currency converter client")?);
    let shipping = Arc::new(FlatRateShipping::new(cfg.checkout.delivery_surcharge));

    let services = api::handlers::AppServices::new(
        db_arc.clone(),
        gateway,
        converter,
        shipping,
        CheckoutSettings::from_config(&cfg),
        Some(event_sender),
    );

    // Invoice pipeline: outbox rows → queue → sender
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::with_max_size(
        cfg.notifications.queue_max_size,
    ));
    let invoice_sender: Arc<dyn InvoiceSender> = match &cfg.notifications.invoice_webhook_url {
        Some(url) => {
            info!(%url, "Invoice webhook delivery enabled");
            Arc::new(
                WebhookInvoiceSender::new(
                    url.clone(),
                    cfg.notifications.invoice_webhook_secret.clone(),
                    cfg.payment.timeout(),
                )
                .context("invoice webhook client")?,
            )
        }
        None => {
            info!("Invoice webhook URL not configured; invoices are logged only");
            Arc::new(LoggingInvoiceSender)
        }
    };
    let poll_interval = cfg.notifications.outbox_poll_interval();
    api::events::outbox::OutboxRelay::new(db_arc.clone(), queue.clone(), &cfg.notifications)
        .start(poll_interval);
    InvoiceDispatcher::new(queue, invoice_sender)
        .with_outbox_acks(api::events::outbox::OutboxAcks::new(db_arc.clone()))
        .start(poll_interval);
    services
        .inventory
        .clone()
        .spawn_sweeper(cfg.checkout.reservation_sweep_interval());

    let auth_service = Arc::new(api::auth::AuthService::from_config(&cfg));
    let cors_layer = cors_layer(&cfg)?;
    let request_timeout = cfg.request_timeout();
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;

    let app_state = api::AppState {
        db: db_arc,
        config: Arc::new(cfg),
        services,
        auth: auth_service,
    };

    let app = api::build_router(app_state)
        .layer(api::tracing::configure_http_tracing())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CompressionLayer::new())
        .layer(cors_layer);

    info!("agrimart-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn cors_layer(cfg: &api::config::AppConfig) -> anyhow::Result<CorsLayer> {
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    if let Some(origins) = configured_origins {
        Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any))
    } else if cfg.should_allow_permissive_cors() {
        info!("Using permissive CORS because explicit origins were not configured");
        Ok(CorsLayer::permissive())
    } else {
        anyhow::bail!(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
        )
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
    info!("Shutdown signal received");
}
