//! Payment reconciliation: drives a provider charge from initiation to a
//! terminal result and records confirmed money on the ledger.
//!
//! Each attempt is a [`PaymentAttempt`] state machine guarded by its own
//! mutex. Polling runs on a spawned task per attempt and stops on a
//! terminal state, on cancellation, or on service shutdown.

use crate::error::{FinanceError, GatewayError};
use crate::models::money::to_cents;
use crate::models::PaymentStatus;
use crate::services::gateway::{
    ChargeHandle, ChargeRequest, GatewayRegistry, GatewayStatus, PaymentGateway, PollPolicy,
    Provider, StatusReport,
};
use crate::services::ledger::{Ledger, NewPayment};
use crate::services::metrics::{ACTIVE_ATTEMPTS, RECONCILIATION_OUTCOMES_TOTAL};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

const COMMIT_ATTEMPTS: u32 = 5;

/// Upper bound on a provider's answer to a charge request.
const INITIATE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptState {
    Idle,
    Initiating,
    Pending,
    Paid,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
    Cancelled,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initiating => "initiating",
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Paid | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

/// What the poll loop should do after feeding a result to an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    KeepPolling,
    /// Provider confirmed the money; the ledger write is still outstanding.
    Confirmed(StatusReport),
    Declined,
    TimedOut,
    /// The attempt had already left `Pending`.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct PaymentAttempt {
    pub attempt_id: Uuid,
    pub provider: Provider,
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub amount: Decimal,
    pub phone: Option<String>,
    pub narrative: Option<String>,
    pub state: AttemptState,
    pub payment_handle: Option<String>,
    pub provider_message: Option<String>,
    pub notes: Option<String>,
    pub receipt: Option<String>,
    pub ledger_payment_id: Option<Uuid>,
    pub polls: u32,
    pub transient_errors: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    policy: PollPolicy,
    /// Transient check failures since the last answered check.
    error_streak: u32,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    confirmed: bool,
}

impl PaymentAttempt {
    pub fn new(
        provider: Provider,
        policy: PollPolicy,
        request: &ChargeRequest,
        unit_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt_id: request.reference,
            provider,
            tenant_id: request.tenant_id,
            unit_id,
            amount: request.amount,
            phone: request.phone.clone(),
            narrative: request.narrative.clone(),
            state: AttemptState::Idle,
            payment_handle: None,
            provider_message: None,
            notes: None,
            receipt: None,
            ledger_payment_id: None,
            polls: 0,
            transient_errors: 0,
            created_at: now,
            updated_at: now,
            policy,
            error_streak: 0,
            started_at: None,
            finished_at: None,
            confirmed: false,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Wall-clock ceiling for this attempt, once started.
    pub fn deadline(&self) -> Option<Instant> {
        self.started_at.map(|s| s + self.policy.ceiling)
    }

    fn finish(&mut self, state: AttemptState, notes: Option<String>, at: Instant) {
        self.state = state;
        if notes.is_some() {
            self.notes = notes;
        }
        self.finished_at = Some(at);
        self.updated_at = Utc::now();
    }

    fn time_out(&mut self, at: Instant) -> PollOutcome {
        let notes = format!(
            "Could not confirm payment with {} after {} checks; verify manually before retrying",
            self.provider, self.polls
        );
        self.finish(AttemptState::TimedOut, Some(notes), at);
        PollOutcome::TimedOut
    }

    pub fn begin(&mut self, now: Instant) -> Result<(), FinanceError> {
        if self.state != AttemptState::Idle {
            return Err(FinanceError::Conflict(format!(
                "attempt {} already {}",
                self.attempt_id,
                self.state.as_str()
            )));
        }
        self.state = AttemptState::Initiating;
        self.started_at = Some(now);
        Ok(())
    }

    /// Apply the provider's acknowledgement. Providers that settle
    /// synchronously confirm or decline here without entering a poll.
    pub fn initiated(&mut self, handle: &ChargeHandle, now: Instant) -> PollOutcome {
        if self.state != AttemptState::Initiating {
            return PollOutcome::Ignored;
        }
        self.payment_handle = Some(handle.payment_handle.clone());
        self.provider_message = Some(handle.provider_message.clone());
        if handle.phone.is_some() {
            self.phone = handle.phone.clone();
        }
        self.state = AttemptState::Pending;
        self.updated_at = Utc::now();

        match handle.status {
            GatewayStatus::Pending => PollOutcome::KeepPolling,
            GatewayStatus::Paid => {
                self.confirmed = true;
                PollOutcome::Confirmed(StatusReport::paid(None, Some(self.amount)))
            }
            GatewayStatus::Failed => {
                self.finish(
                    AttemptState::Failed,
                    Some(handle.provider_message.clone()),
                    now,
                );
                PollOutcome::Declined
            }
        }
    }

    pub fn initiation_failed(&mut self, error: &GatewayError, now: Instant) -> bool {
        if self.state != AttemptState::Initiating {
            return false;
        }
        self.finish(AttemptState::Failed, Some(error.to_string()), now);
        true
    }

    /// The provider never answered the charge request. The prompt may still
    /// have reached the handset, so the outcome is unknown rather than failed.
    pub fn initiation_timed_out(&mut self, now: Instant) -> bool {
        if self.state != AttemptState::Initiating {
            return false;
        }
        let notes = format!(
            "No answer from {} to the charge request; verify manually before retrying",
            self.provider
        );
        self.finish(AttemptState::TimedOut, Some(notes), now);
        true
    }

    /// Feed one `check_status` result into the attempt.
    ///
    /// Transient errors do not use up the poll budget. They end the attempt
    /// only when `max_polls` of them arrive back to back, or at the ceiling.
    pub fn record_poll(
        &mut self,
        result: Result<StatusReport, GatewayError>,
        now: Instant,
    ) -> PollOutcome {
        if self.state != AttemptState::Pending || self.confirmed {
            return PollOutcome::Ignored;
        }
        self.updated_at = Utc::now();

        match result {
            Ok(report) => match report.status {
                GatewayStatus::Pending => {
                    self.polls += 1;
                    self.error_streak = 0;
                    if self.polls >= self.policy.max_polls || self.past_deadline(now) {
                        self.time_out(now)
                    } else {
                        PollOutcome::KeepPolling
                    }
                }
                GatewayStatus::Paid => {
                    self.receipt = report.receipt.clone();
                    let collected = report.amount.map(to_cents);
                    if let Some(collected) = collected.filter(|c| *c != self.amount) {
                        tracing::warn!(
                            attempt_id = %self.attempt_id,
                            requested = %self.amount,
                            collected = %collected,
                            "Provider reported a different amount"
                        );
                        let notes = format!(
                            "{} reported KES {} collected against a KES {} charge; reconcile manually",
                            self.provider, collected, self.amount
                        );
                        self.finish(AttemptState::TimedOut, Some(notes), now);
                        return PollOutcome::TimedOut;
                    }
                    self.confirmed = true;
                    PollOutcome::Confirmed(report)
                }
                GatewayStatus::Failed => {
                    let notes = report
                        .notes
                        .unwrap_or_else(|| format!("Payment declined by {}", self.provider));
                    self.finish(AttemptState::Failed, Some(notes), now);
                    PollOutcome::Declined
                }
            },
            Err(e) if e.is_transient() => {
                self.transient_errors += 1;
                self.error_streak += 1;
                tracing::warn!(
                    attempt_id = %self.attempt_id,
                    transient_errors = self.transient_errors,
                    error_streak = self.error_streak,
                    error = %e,
                    "Status check failed, will retry"
                );
                if self.error_streak >= self.policy.max_polls || self.past_deadline(now) {
                    self.time_out(now)
                } else {
                    PollOutcome::KeepPolling
                }
            }
            Err(e) => {
                let notes = format!("Status check failed ({}); verify manually", e);
                self.finish(AttemptState::TimedOut, Some(notes), now);
                PollOutcome::TimedOut
            }
        }
    }

    fn past_deadline(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }

    /// Time the attempt out if its ceiling passed without a confirmation.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.state == AttemptState::Pending && !self.confirmed && self.past_deadline(now) {
            self.time_out(now);
            return true;
        }
        false
    }

    pub fn mark_paid(&mut self, ledger_payment_id: Uuid, now: Instant) {
        self.ledger_payment_id = Some(ledger_payment_id);
        let notes = self.receipt.as_ref().map(|r| format!("Receipt {}", r));
        self.finish(AttemptState::Paid, notes, now);
    }

    /// Provider confirmed but the ledger write kept failing.
    pub fn mark_unrecorded(&mut self, error: &FinanceError, now: Instant) {
        let notes = format!(
            "Payment confirmed by {} but could not be recorded ({}); reconcile manually",
            self.provider, error
        );
        self.finish(AttemptState::TimedOut, Some(notes), now);
    }

    /// Stop polling. The provider-side charge is left alone.
    pub fn cancel(&mut self, now: Instant) -> Result<(), FinanceError> {
        if self.state.is_terminal() {
            return Err(FinanceError::Conflict(format!(
                "payment attempt already {}",
                self.state.as_str()
            )));
        }
        if self.confirmed {
            return Err(FinanceError::Conflict(
                "payment already confirmed and is being recorded".to_string(),
            ));
        }
        self.finish(
            AttemptState::Cancelled,
            Some("Stopped checking; the charge may still complete on the handset".to_string()),
            now,
        );
        Ok(())
    }

    fn retired(&self, now: Instant, retention: Duration) -> bool {
        self.finished_at
            .is_some_and(|f| now.saturating_duration_since(f) >= retention)
    }

    pub fn view(&self) -> AttemptView {
        AttemptView {
            payment_id: self.attempt_id,
            provider: self.provider,
            tenant_id: self.tenant_id,
            amount: self.amount,
            status: self.state,
            payment_handle: self.payment_handle.clone(),
            message: self.provider_message.clone(),
            notes: self.notes.clone(),
            receipt: self.receipt.clone(),
            ledger_payment_id: self.ledger_payment_id,
            polls: self.polls,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub payment_id: Uuid,
    pub provider: Provider,
    pub tenant_id: Uuid,
    pub amount: Decimal,
    pub status: AttemptState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_payment_id: Option<Uuid>,
    pub polls: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub amount: Decimal,
    pub phone: Option<String>,
    pub narrative: Option<String>,
}

struct AttemptSlot {
    attempt: Mutex<PaymentAttempt>,
    token: CancellationToken,
}

struct ReconcilerInner {
    ledger: Ledger,
    gateways: GatewayRegistry,
    attempts: DashMap<Uuid, Arc<AttemptSlot>>,
    /// Tenant -> its non-terminal attempt.
    active: DashMap<Uuid, Uuid>,
    shutdown: CancellationToken,
    retention: Duration,
}

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

impl Reconciler {
    pub fn new(ledger: Ledger, gateways: GatewayRegistry, retention: Duration) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                ledger,
                gateways,
                attempts: DashMap::new(),
                active: DashMap::new(),
                shutdown: CancellationToken::new(),
                retention,
            }),
        }
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.inner.gateways
    }

    /// Start a charge. Gateway rejections surface immediately and leave the
    /// ledger untouched.
    ///
    /// The provider call runs on its own task, so an attempt still reaches a
    /// terminal state when the caller goes away mid-request.
    #[tracing::instrument(skip(self, request), fields(tenant_id = %request.tenant_id, amount = %request.amount))]
    pub async fn initiate(
        &self,
        provider: Provider,
        request: InitiatePayment,
    ) -> Result<AttemptView, FinanceError> {
        let amount = to_cents(request.amount);
        if amount <= Decimal::ZERO {
            return Err(FinanceError::validation("amount must be greater than zero"));
        }
        let tenant = self.inner.ledger.tenant(request.tenant_id).await?;
        let gateway = self.inner.gateways.get(provider)?;
        self.prune();

        let charge = ChargeRequest {
            reference: Uuid::new_v4(),
            tenant_id: tenant.tenant_id,
            amount,
            phone: request.phone.or_else(|| tenant.phone.clone()),
            narrative: request.narrative,
        };

        match self.inner.active.entry(charge.tenant_id) {
            Entry::Occupied(e) => {
                return Err(FinanceError::AlreadyInProgress {
                    tenant_id: charge.tenant_id,
                    attempt_id: *e.get(),
                })
            }
            Entry::Vacant(v) => {
                v.insert(charge.reference);
            }
        }

        let mut attempt = PaymentAttempt::new(
            provider,
            gateway.poll_policy(),
            &charge,
            request.unit_id.or_else(|| tenant.unit_id()),
            self.inner.ledger.now(),
        );
        attempt.begin(Instant::now())?;
        let slot = Arc::new(AttemptSlot {
            attempt: Mutex::new(attempt),
            token: self.inner.shutdown.child_token(),
        });
        self.inner.attempts.insert(charge.reference, slot.clone());
        ACTIVE_ATTEMPTS.inc();

        let reconciler = self.clone();
        let span = tracing::info_span!("payment_initiate", attempt_id = %charge.reference);
        let task = tokio::spawn(
            async move { reconciler.run_initiation(slot, gateway, charge).await }.instrument(span),
        );
        task.await
            .map_err(|e| FinanceError::Internal(format!("payment initiation task failed: {}", e)))?
    }

    async fn run_initiation(
        &self,
        slot: Arc<AttemptSlot>,
        gateway: Arc<dyn PaymentGateway>,
        charge: ChargeRequest,
    ) -> Result<AttemptView, FinanceError> {
        let call = tokio::time::timeout(INITIATE_TIMEOUT, gateway.initiate(&charge));
        let result = tokio::select! {
            // Cancelled or shutting down while the provider call was in flight.
            _ = slot.token.cancelled() => {
                let view = slot.attempt.lock().await.view();
                return Ok(view);
            }
            result = call => result,
        };

        let handle = match result {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                tracing::warn!(attempt_id = %charge.reference, error = %e, "Payment initiation rejected");
                let mut attempt = slot.attempt.lock().await;
                if attempt.initiation_failed(&e, Instant::now()) {
                    self.finished(&attempt);
                }
                return Err(e.into());
            }
            Err(_) => {
                tracing::error!(
                    attempt_id = %charge.reference,
                    timeout_secs = INITIATE_TIMEOUT.as_secs(),
                    "Provider did not answer the charge request"
                );
                let mut attempt = slot.attempt.lock().await;
                if attempt.initiation_timed_out(Instant::now()) {
                    self.finished(&attempt);
                }
                return Ok(attempt.view());
            }
        };

        let outcome = slot.attempt.lock().await.initiated(&handle, Instant::now());
        tracing::info!(
            attempt_id = %charge.reference,
            payment_handle = %handle.payment_handle,
            status = ?handle.status,
            "Payment initiated"
        );

        match outcome {
            PollOutcome::KeepPolling => self.spawn_poller(slot.clone(), gateway),
            PollOutcome::Confirmed(report) => self.commit(&slot, report).await,
            PollOutcome::Declined | PollOutcome::TimedOut => {
                self.finished(&*slot.attempt.lock().await)
            }
            // Cancelled while the provider call was in flight.
            PollOutcome::Ignored => {}
        }

        let view = slot.attempt.lock().await.view();
        Ok(view)
    }

    pub async fn status(&self, provider: Provider, attempt_id: Uuid) -> Result<AttemptView, FinanceError> {
        let slot = self.slot(provider, attempt_id).await?;
        let view = slot.attempt.lock().await.view();
        Ok(view)
    }

    pub async fn cancel(&self, provider: Provider, attempt_id: Uuid) -> Result<AttemptView, FinanceError> {
        let slot = self.slot(provider, attempt_id).await?;
        let mut attempt = slot.attempt.lock().await;
        attempt.cancel(Instant::now())?;
        slot.token.cancel();
        self.finished(&attempt);
        tracing::info!(attempt_id = %attempt_id, "Payment polling cancelled");
        Ok(attempt.view())
    }

    pub fn shutdown(&self) {
        tracing::info!(
            attempts = self.inner.attempts.len(),
            "Stopping payment reconciliation"
        );
        self.inner.shutdown.cancel();
    }

    async fn slot(&self, provider: Provider, attempt_id: Uuid) -> Result<Arc<AttemptSlot>, FinanceError> {
        let slot = self
            .inner
            .attempts
            .get(&attempt_id)
            .map(|s| s.value().clone())
            .ok_or(FinanceError::AttemptNotFound(attempt_id))?;
        if slot.attempt.lock().await.provider != provider {
            return Err(FinanceError::AttemptNotFound(attempt_id));
        }
        Ok(slot)
    }

    /// Bookkeeping for an attempt that just reached a terminal state.
    fn finished(&self, attempt: &PaymentAttempt) {
        self.inner
            .active
            .remove_if(&attempt.tenant_id, |_, id| *id == attempt.attempt_id);
        ACTIVE_ATTEMPTS.dec();
        RECONCILIATION_OUTCOMES_TOTAL
            .with_label_values(&[attempt.provider.as_str(), attempt.state.as_str()])
            .inc();
        tracing::info!(
            attempt_id = %attempt.attempt_id,
            tenant_id = %attempt.tenant_id,
            state = attempt.state.as_str(),
            polls = attempt.polls,
            "Payment attempt finished"
        );
    }

    fn prune(&self) {
        let now = Instant::now();
        let retention = self.inner.retention;
        self.inner.attempts.retain(|_, slot| match slot.attempt.try_lock() {
            Ok(attempt) => !attempt.retired(now, retention),
            Err(_) => true,
        });
    }

    fn spawn_poller(&self, slot: Arc<AttemptSlot>, gateway: Arc<dyn PaymentGateway>) {
        let reconciler = self.clone();
        let span = tracing::info_span!("payment_poll", provider = %gateway.provider());
        tokio::spawn(async move { reconciler.poll(slot, gateway).await }.instrument(span));
    }

    async fn poll(&self, slot: Arc<AttemptSlot>, gateway: Arc<dyn PaymentGateway>) {
        loop {
            let (handle, wake_at) = {
                let attempt = slot.attempt.lock().await;
                let Some(handle) = attempt.payment_handle.clone() else {
                    return;
                };
                let next = Instant::now() + attempt.policy().interval;
                let wake_at = attempt.deadline().map_or(next, |d| next.min(d));
                (handle, wake_at)
            };

            tokio::select! {
                _ = slot.token.cancelled() => {
                    tracing::debug!(payment_handle = %handle, "Polling stopped");
                    return;
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            {
                let mut attempt = slot.attempt.lock().await;
                if attempt.state.is_terminal() {
                    return;
                }
                if attempt.expire(Instant::now()) {
                    self.finished(&attempt);
                    return;
                }
            }

            // In-flight checks run to completion; a cancelled attempt ignores the result.
            let result = gateway.check_status(&handle).await;
            let outcome = {
                let mut attempt = slot.attempt.lock().await;
                let outcome = attempt.record_poll(result, Instant::now());
                match outcome {
                    PollOutcome::Declined | PollOutcome::TimedOut => self.finished(&attempt),
                    _ => {}
                }
                outcome
            };

            match outcome {
                PollOutcome::KeepPolling => continue,
                PollOutcome::Confirmed(report) => {
                    self.commit(&slot, report).await;
                    return;
                }
                PollOutcome::Declined | PollOutcome::TimedOut | PollOutcome::Ignored => return,
            }
        }
    }

    /// Write a confirmed charge to the ledger, retrying store failures.
    async fn commit(&self, slot: &AttemptSlot, report: StatusReport) {
        let request = {
            let attempt = slot.attempt.lock().await;
            let receipt = report.receipt.clone().or_else(|| attempt.receipt.clone());
            NewPayment {
                tenant_id: attempt.tenant_id,
                unit_id: attempt.unit_id,
                amount: attempt.amount,
                method: attempt.provider.payment_method(),
                source: attempt.provider.payment_source(),
                external_tx_id: attempt.payment_handle.clone(),
                phone: attempt.phone.clone(),
                paid_at: None,
                description: attempt
                    .narrative
                    .clone()
                    .or_else(|| Some(format!("Rent payment via {}", attempt.provider))),
                notes: receipt.map(|r| format!("{} receipt {}", attempt.provider, r)),
                status: PaymentStatus::Paid,
            }
        };

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let mut tries = 0u32;
        let result = retry(backoff, || {
            tries += 1;
            let try_no = tries;
            let ledger = self.inner.ledger.clone();
            let request = request.clone();
            async move {
                ledger.record_payment(request).await.map_err(|e| match e {
                    FinanceError::Store(_) if try_no < COMMIT_ATTEMPTS => {
                        tracing::warn!(attempt = try_no, error = %e, "Recording confirmed payment failed, retrying");
                        backoff::Error::transient(e)
                    }
                    e => backoff::Error::permanent(e),
                })
            }
        })
        .await;

        let mut attempt = slot.attempt.lock().await;
        match result {
            Ok(payment) => {
                tracing::info!(
                    attempt_id = %attempt.attempt_id,
                    payment_id = %payment.payment_id,
                    "Confirmed payment recorded"
                );
                attempt.mark_paid(payment.payment_id, Instant::now());
            }
            Err(e) => {
                tracing::error!(
                    attempt_id = %attempt.attempt_id,
                    error = %e,
                    "Confirmed payment could not be recorded"
                );
                attempt.mark_unrecorded(&e, Instant::now());
            }
        }
        self.finished(&attempt);
    }
}
