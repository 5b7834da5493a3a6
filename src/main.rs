use std::net::SocketAddr;
use std::sync::Arc;

use crochet_shop_backend::api;
use crochet_shop_backend::config::AppConfig;
use crochet_shop_backend::database::delivery_repository::{DeliveryRepository, PgDeliveryRepository};
use crochet_shop_backend::database::in_memory::InMemoryStore;
use crochet_shop_backend::database::order_repository::{OrderRepository, PgOrderRepository};
use crochet_shop_backend::database::payment_repository::{PaymentRepository, PgPaymentRepository};
use crochet_shop_backend::database::{init_pool_from_config, run_migrations};
use crochet_shop_backend::health::{self, HealthChecker};
use crochet_shop_backend::logging::init_tracing_with;
use crochet_shop_backend::middleware::logging::{request_logging_middleware, UuidRequestId};
use crochet_shop_backend::payments::providers::MpesaClient;
use crochet_shop_backend::services::checkout::CheckoutService;
use crochet_shop_backend::services::delivery::DeliveryService;
use crochet_shop_backend::services::notification::{
    LogNotificationSink, NotificationSink, PgNotificationSink,
};
use crochet_shop_backend::services::order_lifecycle::OrderLifecycleService;
use crochet_shop_backend::services::payment_service::PaymentService;
use crochet_shop_backend::services::reconciliation::ReconciliationEngine;
use crochet_shop_backend::services::webhook_processor::WebhookProcessor;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown");
}

struct Repositories {
    orders: Arc<dyn OrderRepository>,
    payments: Arc<dyn PaymentRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    notifier: Arc<dyn NotificationSink>,
    db_pool: Option<sqlx::PgPool>,
}

async fn build_repositories(config: &AppConfig) -> anyhow::Result<Repositories> {
    let Some(database) = &config.database else {
        warn!("⏭️  SKIP_EXTERNALS=true: using the in-memory store, data will not survive a restart");
        let store = Arc::new(InMemoryStore::new());
        return Ok(Repositories {
            orders: store.clone(),
            payments: store.clone(),
            deliveries: store,
            notifier: Arc::new(LogNotificationSink::new()),
            db_pool: None,
        });
    };

    info!("📊 Initializing database connection pool...");
    let pool = init_pool_from_config(database).await?;
    run_migrations(&pool).await?;
    info!(
        max_connections = pool.options().get_max_connections(),
        "✅ Database ready"
    );

    Ok(Repositories {
        orders: Arc::new(PgOrderRepository::new(pool.clone())),
        payments: Arc::new(PgPaymentRepository::new(pool.clone())),
        deliveries: Arc::new(PgDeliveryRepository::new(pool.clone())),
        notifier: Arc::new(PgNotificationSink::new(pool.clone())),
        db_pool: Some(pool),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing_with(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "🚀 Starting crochet shop backend"
    );

    let repos = build_repositories(&config).await?;

    let gateway = Arc::new(MpesaClient::from_env()?);
    info!(
        environment = ?gateway.config().environment,
        "✅ M-PESA client configured"
    );
    let callback_token = gateway.config().callback_token.clone();

    let engine = Arc::new(ReconciliationEngine::new(
        repos.payments.clone(),
        repos.notifier.clone(),
    ));

    let orders_state = Arc::new(api::orders::OrdersState {
        checkout: Arc::new(CheckoutService::new(
            repos.orders.clone(),
            repos.notifier.clone(),
            config.payments.order_code_max_attempts,
        )),
        lifecycle: Arc::new(OrderLifecycleService::new(
            repos.orders.clone(),
            repos.payments.clone(),
            repos.notifier.clone(),
        )),
        delivery: Arc::new(DeliveryService::new(
            repos.orders.clone(),
            repos.deliveries.clone(),
            repos.notifier.clone(),
        )),
    });

    let payments_state = Arc::new(api::payments::PaymentsState {
        payments: Arc::new(PaymentService::new(
            repos.orders.clone(),
            repos.payments.clone(),
            gateway,
            engine.clone(),
            config.payments.query_max_retries,
        )),
    });

    let webhook_state = Arc::new(api::webhooks::WebhookState {
        processor: Arc::new(WebhookProcessor::new(engine, callback_token)),
    });

    let app = api::router(orders_state, payments_state, webhook_state)
        .merge(health::router(HealthChecker::new(repos.db_pool.clone())))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    let addr: SocketAddr = config.server.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(pool) = repos.db_pool {
        pool.close().await;
    }

    info!("👋 Server shutdown complete");
    Ok(())
}
