//! Safaricom M-Pesa (Daraja) STK push adapter.
//!
//! Charges are raised with `/mpesa/stkpush/v1/processrequest` and confirmed
//! by polling `/mpesa/stkpushquery/v1/query`. An STK callback alone never
//! settles a charge: a pushed `paid` stands only once the query agrees, and
//! then contributes the receipt and amount the query does not carry.

use super::{
    check_amount, normalize_msisdn, tokenized_callback_url, whole_shillings, CallbackInbox,
    ChargeHandle, ChargeRequest, GatewayStatus, PaymentGateway, PollPolicy, Provider,
    StatusReport,
};
use crate::config::MpesaConfig;
use crate::error::GatewayError;
use crate::services::metrics::{GATEWAY_REQUESTS_TOTAL, GATEWAY_REQUEST_DURATION};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{FixedOffset, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const PROVIDER: &str = "mpesa";

/// Daraja reports this while the customer has not yet answered the prompt.
const STILL_PROCESSING_CODES: [&str; 2] = ["500.001.1001", "4999"];

/// Daraja timestamps are East Africa Time.
const EAT_OFFSET_SECS: i32 = 3 * 3600;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'a str,
    amount: u64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    response_code: Option<Value>,
    response_description: Option<String>,
    customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    result_code: Option<Value>,
    result_desc: Option<String>,
}

/// Daraja error body, e.g. `{"errorCode": "400.002.02", "errorMessage": "..."}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DarajaError {
    error_code: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<Value>,
}

struct CachedToken {
    value: Secret<String>,
    expires_at: Instant,
}

pub struct MpesaGateway {
    client: Client,
    config: MpesaConfig,
    callback_url: String,
    token: RwLock<Option<CachedToken>>,
    inbox: CallbackInbox,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        if config.callback_token.is_none() {
            tracing::warn!("MPESA_CALLBACK_TOKEN is not set; STK callbacks will be refused");
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

    fn timestamp() -> String {
        let now = Utc::now();
        match FixedOffset::east_opt(EAT_OFFSET_SECS) {
            Some(eat) => now.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string(),
            None => now.format("%Y%m%d%H%M%S").to_string(),
        }
    }

    /// `base64(shortcode + passkey + timestamp)`.
    fn password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.config.short_code,
            self.config.pass_key.expose_secret(),
            timestamp
        ))
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.expose_secret().clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(cached) = slot.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.expose_secret().clone());
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(
                self.config.consumer_key.expose_secret(),
                Some(self.config.consumer_secret.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| GatewayError::unavailable(PROVIDER, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::unavailable(PROVIDER, e.to_string()))?;

        if !status.is_success() {
            tracing::error!(status = %status, "M-Pesa token request failed");
            return Err(if status.is_server_error() {
                GatewayError::unavailable(PROVIDER, format!("token endpoint returned {}", status))
            } else {
                GatewayError::rejected(PROVIDER, "authentication with Daraja failed")
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::unavailable(PROVIDER, format!("bad token response: {}", e)))?;

        // Daraja sends expires_in as a string.
        let lifetime = token
            .expires_in
            .as_ref()
            .and_then(|v| match v {
                Value::String(s) => s.parse::<u64>().ok(),
                other => other.as_u64(),
            })
            .unwrap_or(3599);

        let value = token.access_token.clone();
        *slot = Some(CachedToken {
            value: Secret::new(token.access_token),
            expires_at: Instant::now() + Duration::from_secs(lifetime.saturating_sub(60)),
        });
        Ok(value)
    }

    async fn post_json<T: Serialize>(
        &self,
        path: &str,
        operation: &'static str,
        payload: &T,
    ) -> Result<(StatusCode, String), GatewayError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.config.base_url, path);

        let timer = GATEWAY_REQUEST_DURATION
            .with_label_values(&[PROVIDER, operation])
            .start_timer();
        let result = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await;
        timer.observe_duration();

        let response = result.map_err(|e| {
            GATEWAY_REQUESTS_TOTAL
                .with_label_values(&[PROVIDER, operation, "error"])
                .inc();
            GatewayError::unavailable(PROVIDER, e.to_string())
        })?;

        let status = response.status();
        GATEWAY_REQUESTS_TOTAL
            .with_label_values(&[PROVIDER, operation, status.as_str()])
            .inc();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::unavailable(PROVIDER, e.to_string()))?;

        tracing::debug!(status = %status, operation = operation, "Daraja response");
        Ok((status, body))
    }

    async fn query(&self, checkout_request_id: &str) -> Result<StatusReport, GatewayError> {
        let timestamp = Self::timestamp();
        let request = StkQueryRequest {
            business_short_code: &self.config.short_code,
            password: self.password(&timestamp),
            timestamp,
            checkout_request_id,
        };

        let (status, body) = self
            .post_json("/mpesa/stkpushquery/v1/query", "stk_query", &request)
            .await?;

        if !status.is_success() {
            let error: Option<DarajaError> = serde_json::from_str(&body).ok();
            let code = error.as_ref().and_then(|e| e.error_code.clone());
            if code
                .as_deref()
                .is_some_and(|c| STILL_PROCESSING_CODES.contains(&c))
            {
                return Ok(StatusReport::pending());
            }
            let message = error
                .and_then(|e| e.error_message)
                .unwrap_or_else(|| format!("query returned {}", status));
            return Err(GatewayError::unavailable(PROVIDER, message));
        }

        let parsed: StkQueryResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::unavailable(PROVIDER, format!("bad query response: {}", e)))?;

        let report = match parsed.result_code.as_ref().map(code_string).as_deref() {
            Some("0") => StatusReport::paid(None, None),
            Some(code) if STILL_PROCESSING_CODES.contains(&code) => StatusReport::pending(),
            Some(code) => StatusReport::failed(
                parsed
                    .result_desc
                    .unwrap_or_else(|| format!("Declined with result code {}", code)),
            ),
            None => StatusReport::pending(),
        };
        Ok(report)
    }
}

fn code_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    fn provider(&self) -> Provider {
        Provider::Mpesa
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
        let phone = normalize_msisdn(Provider::Mpesa, raw_phone)?;
        check_amount(Provider::Mpesa, request.amount, self.config.min_amount)?;
        let amount = whole_shillings(Provider::Mpesa, request.amount)?;

        let timestamp = Self::timestamp();
        let description = request.narrative.as_deref().unwrap_or("Rent payment");
        let payload = StkPushRequest {
            business_short_code: &self.config.short_code,
            password: self.password(&timestamp),
            timestamp,
            transaction_type: &self.config.transaction_type,
            amount,
            party_a: &phone,
            party_b: &self.config.short_code,
            phone_number: &phone,
            callback_url: &self.callback_url,
            account_reference: &self.config.account_reference,
            transaction_desc: description,
        };

        let (status, body) = self
            .post_json("/mpesa/stkpush/v1/processrequest", "stk_push", &payload)
            .await?;

        if !status.is_success() {
            let message = serde_json::from_str::<DarajaError>(&body)
                .ok()
                .and_then(|e| e.error_message)
                .unwrap_or_else(|| format!("STK push returned {}", status));
            tracing::error!(status = %status, error = %message, "M-Pesa STK push failed");
            return Err(if status.is_server_error() {
                GatewayError::unavailable(PROVIDER, message)
            } else {
                GatewayError::rejected(PROVIDER, message)
            });
        }

        let parsed: StkPushResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::unavailable(PROVIDER, format!("bad STK response: {}", e)))?;

        let accepted = parsed.response_code.as_ref().map(code_string).as_deref() == Some("0");
        let checkout_request_id = match (accepted, parsed.checkout_request_id) {
            (true, Some(id)) => id,
            _ => {
                return Err(GatewayError::rejected(
                    PROVIDER,
                    parsed
                        .response_description
                        .unwrap_or_else(|| "STK push was not accepted".to_string()),
                ))
            }
        };

        self.inbox.issue(&checkout_request_id);
        tracing::info!(
            checkout_request_id = %checkout_request_id,
            amount = amount,
            reference = %request.reference,
            "M-Pesa STK push accepted"
        );

        Ok(ChargeHandle {
            payment_handle: checkout_request_id,
            provider_message: parsed
                .customer_message
                .unwrap_or_else(|| "Check your phone to complete the payment".to_string()),
            status: GatewayStatus::Pending,
            phone: Some(phone),
        })
    }

    async fn check_status(&self, payment_handle: &str) -> Result<StatusReport, GatewayError> {
        if let Some(report) = self.inbox.settled(payment_handle) {
            return Ok(report);
        }

        let queried = self.query(payment_handle).await?;
        let pushed = self.inbox.pushed(payment_handle);
        if let Some(pushed) = &pushed {
            if pushed.status != queried.status && queried.status.is_terminal() {
                tracing::warn!(
                    checkout_request_id = %payment_handle,
                    pushed = ?pushed.status,
                    queried = ?queried.status,
                    "STK callback disagrees with Daraja query"
                );
            }
        }
        let report = match pushed {
            Some(pushed)
                if pushed.status == GatewayStatus::Paid && queried.status == GatewayStatus::Paid =>
            {
                pushed
            }
            _ => queried,
        };
        Ok(self.inbox.settle(payment_handle, report))
    }

    fn callbacks(&self) -> Option<&CallbackInbox> {
        Some(&self.inbox)
    }
}
