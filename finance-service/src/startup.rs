//! Application startup and lifecycle management.

use crate::config::{FinanceConfig, PaymentsConfig};
use crate::handlers::{self, ledger, payments, tenants};
use crate::services::gateway::{KcbGateway, ManualGateway, MpesaGateway};
use crate::services::{
    init_metrics, Clock, GatewayRegistry, Ledger, LedgerStore, MemoryLedgerStore, PgLedgerStore,
    Reconciler, SystemClock,
};
use axum::{
    middleware,
    routing::{get, patch, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: FinanceConfig,
    pub ledger: Ledger,
    pub reconciler: Reconciler,
}

/// Gateways enabled by configuration.
pub fn build_gateways(config: &PaymentsConfig) -> GatewayRegistry {
    let mut registry = GatewayRegistry::new();
    if let Some(mpesa) = &config.mpesa {
        tracing::info!(base_url = %mpesa.base_url, short_code = %mpesa.short_code, "M-Pesa gateway enabled");
        registry.register(Arc::new(MpesaGateway::new(mpesa.clone())));
    }
    if let Some(kcb) = &config.kcb {
        tracing::info!(base_url = %kcb.base_url, "KCB gateway enabled");
        registry.register(Arc::new(KcbGateway::new(kcb.clone())));
    }
    if config.manual_enabled {
        registry.register(Arc::new(ManualGateway::new()));
    }
    registry
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/tenants", post(tenants::register_tenant))
        .route("/tenants/summary", get(tenants::all_summaries))
        .route("/tenants/:tenant_id/unit", put(tenants::assign_unit))
        .route("/tenants/:tenant_id/summary", get(tenants::tenant_summary))
        .route(
            "/tenants/:tenant_id/finance-history",
            get(tenants::finance_history),
        )
        .route(
            "/tenants/:tenant_id/invoices/active",
            get(tenants::active_invoice),
        )
        .route("/ledger/invoices", post(ledger::issue_invoice))
        .route("/ledger/adjustments", post(ledger::record_adjustment))
        .route("/ledger/payments/:payment_id", patch(ledger::settle_payment))
        .route("/payments", post(ledger::record_payment))
        .route("/payments/:provider/initiate", post(payments::initiate_payment))
        .route(
            "/payments/:provider/status/:payment_id",
            get(payments::payment_status),
        )
        .route(
            "/payments/:provider/cancel/:payment_id",
            post(payments::cancel_payment),
        )
        .route("/payments/:provider/callback", post(payments::provider_callback))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: FinanceConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn LedgerStore> = match &config.database {
            Some(db) => {
                let store = PgLedgerStore::connect(&db.url, db.max_connections, db.min_connections)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                        e
                    })?;
                store.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(store)
            }
            None => {
                tracing::warn!("DATABASE_URL not set - ledger is held in memory");
                Arc::new(MemoryLedgerStore::new())
            }
        };

        let gateways = build_gateways(&config.payments);
        Self::build_with(config, store, Arc::new(SystemClock), gateways).await
    }

    /// Build around an existing store, clock and gateway set.
    pub async fn build_with(
        config: FinanceConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        gateways: GatewayRegistry,
    ) -> Result<Self, AppError> {
        init_metrics();

        let ledger = Ledger::new(store, clock, &config.billing);
        let reconciler = Reconciler::new(
            ledger.clone(),
            gateways,
            config.payments.attempt_retention,
        );

        let addr = (config.common.host.as_str(), config.common.port);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, host = %config.common.host, port = config.common.port, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port = port,
            providers = ?reconciler.gateways().providers(),
            "Finance service listener bound"
        );

        Ok(Self {
            port,
            listener,
            state: AppState {
                config,
                ledger,
                reconciler,
            },
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ledger(&self) -> Ledger {
        self.state.ledger.clone()
    }

    pub fn reconciler(&self) -> Reconciler {
        self.state.reconciler.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let reconciler = self.state.reconciler.clone();
        let app = router(self.state);

        tracing::info!(
            service = "finance-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, app).await;
        reconciler.shutdown();
        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
