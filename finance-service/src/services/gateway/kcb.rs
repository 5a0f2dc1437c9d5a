//! KCB Buni STK push adapter.
//!
//! Buni offers no status query for STK requests, so results arrive only via
//! authenticated callbacks for handles this gateway issued. Until one lands
//! every poll reports pending.

use super::{
    check_amount, normalize_msisdn, tokenized_callback_url, whole_shillings, CallbackInbox,
    ChargeHandle, ChargeRequest, GatewayStatus, PaymentGateway, PollPolicy, Provider,
    StatusReport,
};
use crate::config::KcbConfig;
use crate::error::GatewayError;
use crate::services::metrics::{GATEWAY_REQUESTS_TOTAL, GATEWAY_REQUEST_DURATION};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const PROVIDER: &str = "kcb";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuniStkRequest<'a> {
    phone_number: &'a str,
    amount: String,
    invoice_number: String,
    shared_short_code: bool,
    org_short_code: &'a str,
    org_pass_key: &'a str,
    callback_url: &'a str,
    transaction_description: &'a str,
}

#[derive(Debug, Deserialize)]
struct BuniStkResponse {
    response: Option<BuniStkBody>,
    header: Option<BuniHeader>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BuniStkBody {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    response_code: Option<Value>,
    response_description: Option<String>,
    customer_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuniHeader {
    status_code: Option<Value>,
    status_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

struct CachedToken {
    value: Secret<String>,
    expires_at: Instant,
}

pub struct KcbGateway {
    client: Client,
    config: KcbConfig,
    callback_url: String,
    token: RwLock<Option<CachedToken>>,
    inbox: CallbackInbox,
}

fn code_is_zero(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => s.trim() == "0",
        Some(Value::Number(n)) => n.as_i64() == Some(0),
        _ => false,
    }
}

impl KcbGateway {
    pub fn new(config: KcbConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        if config.callback_token.is_none() {
            tracing::warn!("KCB_CALLBACK_TOKEN is not set; KCB charges can never be confirmed");
        }
        let callback_url =
            tokenized_callback_url(&config.callback_url, config.callback_token.as_ref());
        let inbox = CallbackInbox::new(config.callback_token.clone(), config.callback_retention);

        Self {
            client,
            config,
            callback_url,
            token: RwLock::new(None),
            inbox,
        }
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut slot = self.token.write().await;
        if let Some(cached) = slot.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.expose_secret().clone());
            }
        }

        let url = format!("{}/token?grant_type=client_credentials", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(
                self.config.consumer_key.expose_secret(),
                Some(self.config.consumer_secret.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| GatewayError::unavailable(PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, "KCB token request failed");
            return Err(if status.is_server_error() {
                GatewayError::unavailable(PROVIDER, format!("token endpoint returned {}", status))
            } else {
                GatewayError::rejected(PROVIDER, "authentication with Buni failed")
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::unavailable(PROVIDER, format!("bad token response: {}", e)))?;

        let lifetime = token.expires_in.unwrap_or(3600);
        let value = token.access_token.clone();
        *slot = Some(CachedToken {
            value: Secret::new(token.access_token),
            expires_at: Instant::now() + Duration::from_secs(lifetime.saturating_sub(60)),
        });
        Ok(value)
    }
}

#[async_trait]
impl PaymentGateway for KcbGateway {
    fn provider(&self) -> Provider {
        Provider::Kcb
    }

    fn poll_policy(&self) -> PollPolicy {
        self.config.poll
    }

    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError> {
        let raw_phone = request
            .phone
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or(GatewayError::PhoneRequired(PROVIDER))?;
        let phone = normalize_msisdn(Provider::Kcb, raw_phone)?;
        check_amount(Provider::Kcb, request.amount, self.config.min_amount)?;
        let amount = whole_shillings(Provider::Kcb, request.amount)?;

        let token = self.access_token().await?;
        let payload = BuniStkRequest {
            phone_number: &phone,
            amount: amount.to_string(),
            invoice_number: format!(
                "{}-{}",
                self.config.org_short_code,
                request.reference.simple()
            ),
            shared_short_code: true,
            org_short_code: &self.config.org_short_code,
            org_pass_key: self.config.org_pass_key.expose_secret(),
            callback_url: &self.callback_url,
            transaction_description: request.narrative.as_deref().unwrap_or("Rent payment"),
        };

        let url = format!("{}/mm/api/request/1.0.0/stkpush", self.config.base_url);
        let timer = GATEWAY_REQUEST_DURATION
            .with_label_values(&[PROVIDER, "stk_push"])
            .start_timer();
        let result = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await;
        timer.observe_duration();

        let response = result.map_err(|e| {
            GATEWAY_REQUESTS_TOTAL
                .with_label_values(&[PROVIDER, "stk_push", "error"])
                .inc();
            GatewayError::unavailable(PROVIDER, e.to_string())
        })?;

        let status = response.status();
        GATEWAY_REQUESTS_TOTAL
            .with_label_values(&[PROVIDER, "stk_push", status.as_str()])
            .inc();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::unavailable(PROVIDER, e.to_string()))?;

        if status.is_server_error() {
            tracing::error!(status = %status, "KCB STK push failed");
            return Err(GatewayError::unavailable(
                PROVIDER,
                format!("STK push returned {}", status),
            ));
        }

        let parsed: BuniStkResponse = serde_json::from_str(&body).map_err(|e| {
            GatewayError::rejected(PROVIDER, format!("unexpected STK response ({}): {}", status, e))
        })?;

        let header_ok = parsed
            .header
            .as_ref()
            .map(|h| code_is_zero(h.status_code.as_ref()))
            .unwrap_or(true);
        let body = parsed.response;
        let accepted = status.is_success()
            && header_ok
            && body
                .as_ref()
                .map(|b| code_is_zero(b.response_code.as_ref()))
                .unwrap_or(false);

        let checkout_request_id = match body.as_ref().and_then(|b| b.checkout_request_id.clone()) {
            Some(id) if accepted => id,
            _ => {
                let message = body
                    .as_ref()
                    .and_then(|b| b.response_description.clone())
                    .or_else(|| parsed.header.and_then(|h| h.status_description))
                    .unwrap_or_else(|| "STK push was not accepted".to_string());
                tracing::error!(status = %status, error = %message, "KCB STK push rejected");
                return Err(GatewayError::rejected(PROVIDER, message));
            }
        };

        self.inbox.issue(&checkout_request_id);
        tracing::info!(
            checkout_request_id = %checkout_request_id,
            amount = amount,
            reference = %request.reference,
            "KCB STK push accepted"
        );

        Ok(ChargeHandle {
            payment_handle: checkout_request_id,
            provider_message: body
                .and_then(|b| b.customer_message)
                .unwrap_or_else(|| "Check your phone to complete the payment".to_string()),
            status: GatewayStatus::Pending,
            phone: Some(phone),
        })
    }

    async fn check_status(&self, payment_handle: &str) -> Result<StatusReport, GatewayError> {
        Ok(self
            .inbox
            .pushed(payment_handle)
            .unwrap_or_else(StatusReport::pending))
    }

    fn callbacks(&self) -> Option<&CallbackInbox> {
        Some(&self.inbox)
    }
}
