//! Counter payments confirmed by staff at the time of entry.

use super::{
    ChargeHandle, ChargeRequest, GatewayStatus, PaymentGateway, PollPolicy, Provider, StatusReport,
};
use crate::error::GatewayError;
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

#[derive(Debug, Default)]
pub struct ManualGateway {
    issued: DashMap<String, Decimal>,
}

impl ManualGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentGateway for ManualGateway {
    fn provider(&self) -> Provider {
        Provider::Manual
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::immediate()
    }

    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError> {
        super::check_amount(Provider::Manual, request.amount, Decimal::ZERO)?;

        let payment_handle = format!("MAN-{}", request.reference.simple());
        self.issued.insert(payment_handle.clone(), request.amount);

        Ok(ChargeHandle {
            payment_handle,
            provider_message: "Payment recorded".to_string(),
            status: GatewayStatus::Paid,
            phone: request.phone.clone(),
        })
    }

    async fn check_status(&self, payment_handle: &str) -> Result<StatusReport, GatewayError> {
        self.issued
            .get(payment_handle)
            .map(|amount| StatusReport::paid(None, Some(*amount)))
            .ok_or_else(|| GatewayError::UnknownHandle(payment_handle.to_string()))
    }
}
