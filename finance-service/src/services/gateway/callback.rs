//! Provider push notifications and terminal-result memoisation.
//!
//! Callback requests carry a shared `token` query parameter which is
//! appended to the callback URL sent with each charge.
//!
//! Both Daraja and KCB Buni deliver STK results as
//! `{"Body": {"stkCallback": {...}}}`.

use super::StatusReport;
use crate::error::GatewayError;
use dashmap::DashMap;
use reqwest::Url;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    result_code: Value,
    result_desc: Option<String>,
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackMetadata {
    #[serde(default)]
    item: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackItem {
    name: String,
    value: Option<Value>,
}

/// A parsed, provider-agnostic push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCallback {
    pub payment_handle: String,
    pub report: StatusReport,
}

impl ProviderCallback {
    pub fn parse_stk(payload: &Value) -> Result<Self, GatewayError> {
        let envelope: CallbackEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| GatewayError::rejected("callback", format!("malformed callback: {}", e)))?;
        let stk = envelope.body.stk_callback;

        let result_code = match &stk.result_code {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };

        let report = if result_code == "0" {
            let items = stk
                .callback_metadata
                .map(|m| m.item)
                .unwrap_or_default();
            let receipt = item_value(&items, "MpesaReceiptNumber").map(value_to_string);
            let amount = item_value(&items, "Amount")
                .map(value_to_string)
                .and_then(|s| Decimal::from_str(&s).ok());
            StatusReport::paid(receipt, amount)
        } else {
            StatusReport::failed(
                stk.result_desc
                    .unwrap_or_else(|| format!("Declined with result code {}", result_code)),
            )
        };

        Ok(Self {
            payment_handle: stk.checkout_request_id,
            report,
        })
    }
}

fn item_value<'a>(items: &'a [CallbackItem], name: &str) -> Option<&'a Value> {
    items
        .iter()
        .find(|i| i.name == name)
        .and_then(|i| i.value.as_ref())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Append the shared callback token to a provider callback URL.
pub fn tokenized_callback_url(base: &str, token: Option<&Secret<String>>) -> String {
    let Some(token) = token else {
        return base.to_string();
    };
    match Url::parse(base) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("token", token.expose_secret());
            url.to_string()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Callback URL is not a valid URL; sending it unchanged");
            base.to_string()
        }
    }
}

/// What became of a callback handed to the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// A terminal result was already held for the handle.
    Duplicate,
    /// The handle was never issued here, or has expired.
    UnknownHandle,
}

#[derive(Debug)]
struct InboxEntry {
    issued_at: Instant,
    /// Result pushed by the provider.
    pushed: Option<StatusReport>,
    /// Result confirmed by `check_status`, repeated on every later call.
    settled: Option<StatusReport>,
}

/// Push notifications and settled results for the handles this gateway
/// issued.
///
/// Only handles registered with [`CallbackInbox::issue`] accept results, and
/// entries are dropped `retention` after issue. For each handle the first
/// terminal result wins.
#[derive(Debug)]
pub struct CallbackInbox {
    token: Option<Secret<String>>,
    retention: Duration,
    entries: DashMap<String, InboxEntry>,
}

impl CallbackInbox {
    pub fn new(token: Option<Secret<String>>, retention: Duration) -> Self {
        Self {
            token: token.filter(|t| !t.expose_secret().is_empty()),
            retention,
            entries: DashMap::new(),
        }
    }

    /// Constant-time check of the token presented on a callback request.
    /// With no token configured every callback is refused.
    pub fn authenticate(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (Some(expected), Some(presented)) => expected
                .expose_secret()
                .as_bytes()
                .ct_eq(presented.as_bytes())
                .into(),
            _ => false,
        }
    }

    pub fn accepts_callbacks(&self) -> bool {
        self.token.is_some()
    }

    /// Register a handle returned by the provider for a charge we raised.
    pub fn issue(&self, payment_handle: &str) {
        self.prune();
        self.entries
            .entry(payment_handle.to_string())
            .or_insert_with(|| InboxEntry {
                issued_at: Instant::now(),
                pushed: None,
                settled: None,
            });
    }

    pub fn deliver(&self, callback: ProviderCallback) -> Delivery {
        self.prune();
        let Some(mut entry) = self.entries.get_mut(&callback.payment_handle) else {
            return Delivery::UnknownHandle;
        };
        if entry.pushed.is_some() || !callback.report.status.is_terminal() {
            return Delivery::Duplicate;
        }
        entry.pushed = Some(callback.report);
        Delivery::Accepted
    }

    /// Result pushed by the provider, if one arrived.
    pub fn pushed(&self, payment_handle: &str) -> Option<StatusReport> {
        self.entries
            .get(payment_handle)
            .and_then(|e| e.pushed.clone())
    }

    pub fn settled(&self, payment_handle: &str) -> Option<StatusReport> {
        self.entries
            .get(payment_handle)
            .and_then(|e| e.settled.clone())
    }

    /// Record the terminal result for an issued handle and return the one
    /// that stands. Pending reports and unknown handles are not stored.
    pub fn settle(&self, payment_handle: &str, report: StatusReport) -> StatusReport {
        if !report.status.is_terminal() {
            return report;
        }
        match self.entries.get_mut(payment_handle) {
            Some(mut entry) => entry.settled.get_or_insert(report).clone(),
            None => report,
        }
    }

    pub fn prune(&self) {
        let now = Instant::now();
        let retention = self.retention;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.issued_at) < retention);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
