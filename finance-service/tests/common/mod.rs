#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use finance_service::config::{BillingConfig, FinanceConfig, PaymentsConfig};
use finance_service::error::GatewayError;
use finance_service::models::{Tenant, Unit};
use finance_service::services::gateway::{
    normalize_msisdn, ChargeHandle, ChargeRequest, GatewayRegistry, GatewayStatus,
    ManualGateway, PaymentGateway, PollPolicy, Provider, StatusReport,
};
use finance_service::services::{
    FixedClock, Ledger, LedgerStore, MemoryLedgerStore, NewTenant, Reconciler,
};
use finance_service::startup::Application;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// 2026-03-10 09:00 in Nairobi.
pub const NOW: &str = "2026-03-10T06:00:00Z";

pub fn d(s: &str) -> Decimal {
    Decimal::from_str(s).expect("valid decimal")
}

pub fn at(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid timestamp")
}

pub fn test_config() -> FinanceConfig {
    FinanceConfig {
        common: service_core::config::Config {
            port: 0,
            host: "127.0.0.1".to_string(),
        },
        service_name: "finance-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: None,
        billing: BillingConfig::default(),
        payments: PaymentsConfig::default(),
    }
}

/// Gateway whose status checks replay a script. The last scripted result
/// repeats once the script runs out.
pub struct ScriptedGateway {
    provider: Provider,
    policy: PollPolicy,
    handle: String,
    script: Mutex<VecDeque<Result<StatusReport, GatewayError>>>,
    last: Mutex<Option<Result<StatusReport, GatewayError>>>,
    pub initiations: AtomicU32,
    pub checks: AtomicU32,
}

impl ScriptedGateway {
    pub fn new(handle: &str, policy: PollPolicy) -> Self {
        Self {
            provider: Provider::Mpesa,
            policy,
            handle: handle.to_string(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            initiations: AtomicU32::new(0),
            checks: AtomicU32::new(0),
        }
    }

    pub fn then(self, result: Result<StatusReport, GatewayError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn pending(self, times: usize) -> Self {
        (0..times).fold(self, |g, _| g.then(Ok(StatusReport::pending())))
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn poll_policy(&self) -> PollPolicy {
        self.policy
    }

    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError> {
        let phone = request
            .phone
            .as_deref()
            .ok_or(GatewayError::PhoneRequired("mpesa"))?;
        let phone = normalize_msisdn(self.provider, phone)?;
        self.initiations.fetch_add(1, Ordering::SeqCst);
        Ok(ChargeHandle {
            payment_handle: self.handle.clone(),
            provider_message: "Success. Request accepted for processing".to_string(),
            status: GatewayStatus::Pending,
            phone: Some(phone),
        })
    }

    async fn check_status(&self, _payment_handle: &str) -> Result<StatusReport, GatewayError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(result) => {
                *last = Some(result.clone());
                result
            }
            None => last.clone().unwrap_or_else(|| Ok(StatusReport::pending())),
        }
    }
}

/// Gateway whose charge requests never get an answer.
pub struct StalledGateway {
    pub initiations: AtomicU32,
}

impl StalledGateway {
    pub fn new() -> Self {
        Self {
            initiations: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PaymentGateway for StalledGateway {
    fn provider(&self) -> Provider {
        Provider::Mpesa
    }

    fn poll_policy(&self) -> PollPolicy {
        fast_policy()
    }

    async fn initiate(&self, _request: &ChargeRequest) -> Result<ChargeHandle, GatewayError> {
        self.initiations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Err(GatewayError::unavailable("mpesa", "no answer"))
    }

    async fn check_status(&self, _payment_handle: &str) -> Result<StatusReport, GatewayError> {
        Ok(StatusReport::pending())
    }
}

pub fn fast_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_secs(3),
        max_polls: 10,
        ceiling: Duration::from_secs(120),
    }
}

/// Ledger and reconciler over an in-memory store, without HTTP.
pub struct TestLedger {
    pub ledger: Ledger,
    pub reconciler: Reconciler,
    pub clock: Arc<FixedClock>,
    pub store: Arc<MemoryLedgerStore>,
}

impl TestLedger {
    pub fn new() -> Self {
        Self::with_gateways(GatewayRegistry::new().with(Arc::new(ManualGateway::new())))
    }

    pub fn with_gateways(gateways: GatewayRegistry) -> Self {
        let clock = Arc::new(FixedClock::new(at(NOW)));
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Ledger::new(store.clone(), clock.clone(), &BillingConfig::default());
        let reconciler = Reconciler::new(ledger.clone(), gateways, Duration::from_secs(3600));
        Self {
            ledger,
            reconciler,
            clock,
            store,
        }
    }

    pub async fn tenant(&self, name: &str) -> Tenant {
        self.ledger
            .register_tenant(NewTenant {
                tenant_id: None,
                name: name.to_string(),
                phone: Some("0712345678".to_string()),
                email: None,
            })
            .await
            .expect("Failed to register tenant")
    }

    pub async fn tenant_with_rent(&self, name: &str, rent: &str) -> Tenant {
        let tenant = self.tenant(name).await;
        let (tenant, _) = self
            .ledger
            .assign_unit(
                tenant.tenant_id,
                Unit {
                    unit_id: Uuid::new_v4(),
                    property_id: None,
                    label: Some("A1".to_string()),
                    monthly_rent: d(rent),
                },
                false,
            )
            .await
            .expect("Failed to assign unit");
        tenant
    }

    pub async fn payment_count(&self, tenant_id: Uuid) -> usize {
        self.store
            .load_book(tenant_id)
            .await
            .expect("Failed to load book")
            .payments
            .len()
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub ledger: Ledger,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(GatewayRegistry::new().with(Arc::new(ManualGateway::new()))).await
    }

    pub async fn spawn_with(gateways: GatewayRegistry) -> Self {
        let clock = Arc::new(FixedClock::new(at(NOW)));
        let app = Application::build_with(
            test_config(),
            Arc::new(MemoryLedgerStore::new()),
            clock,
            gateways,
        )
        .await
        .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);
        let ledger = app.ledger();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            ledger,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }
}
