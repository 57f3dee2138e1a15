//! Payment status poller.
//!
//! After a wallet debit is accepted the customer approves it on their phone.
//! We query `check-status` on a fixed interval until the gateway reports a
//! terminal status, the poll budget runs out, or the donor cancels.
//!
//! Each iteration: check cancel → wait (cancellable) → check cancel → query.
//! A failed status request is logged and counts as "still pending".

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::platform::PaymentGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_polls: u32,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_polls: 20,
            interval: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollOutcome {
    Successful,
    Failed,
    /// Still pending after `max_polls` checks.
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Status requests actually sent.
    pub polls: u32,
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Successful,
    Failed,
    Pending,
}

/// Pull the status string out of a `check-status` document. The gateway
/// uses `status` or `transactionStatus`, sometimes nested under `data`.
pub fn extract_status(raw: &Value) -> Option<String> {
    fn direct(v: &Value) -> Option<String> {
        ["status", "transactionStatus"]
            .iter()
            .find_map(|key| v.get(key).and_then(Value::as_str))
            .map(str::to_string)
    }
    direct(raw).or_else(|| raw.get("data").and_then(direct))
}

pub fn classify_status(status: Option<&str>) -> StatusKind {
    match status.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
        Some("SUCCESSFUL") | Some("SUCCESS") => StatusKind::Successful,
        Some("FAILED") => StatusKind::Failed,
        _ => StatusKind::Pending,
    }
}

/// Poll `ref_no` until it settles. `on_poll` is called with the attempt
/// number right before each status request.
pub async fn poll_until_settled(
    gateway: &dyn PaymentGateway,
    ref_no: &str,
    settings: &PollSettings,
    cancel: &CancellationToken,
    mut on_poll: impl FnMut(u32),
) -> PollReport {
    let mut polls = 0u32;
    let mut last_status = None;

    let report = |outcome, polls, last_status| PollReport {
        outcome,
        polls,
        last_status,
    };

    loop {
        if cancel.is_cancelled() {
            info!("Polling for {ref_no} cancelled after {polls} checks");
            return report(PollOutcome::Cancelled, polls, last_status);
        }
        if polls >= settings.max_polls {
            warn!("Polling for {ref_no} timed out after {polls} checks");
            return report(PollOutcome::TimedOut, polls, last_status);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => continue,
            _ = tokio::time::sleep(settings.interval) => {}
        }
        if cancel.is_cancelled() {
            continue;
        }

        polls += 1;
        on_poll(polls);

        match gateway.check_status(ref_no).await {
            Ok(raw) => {
                let status = extract_status(&raw);
                info!("Status check {polls}/{} for {ref_no}: {raw}", settings.max_polls);
                let kind = classify_status(status.as_deref());
                last_status = status;
                match kind {
                    StatusKind::Successful => return report(PollOutcome::Successful, polls, last_status),
                    StatusKind::Failed => return report(PollOutcome::Failed, polls, last_status),
                    StatusKind::Pending => {}
                }
            }
            Err(e) => {
                warn!("Status check {polls} for {ref_no} failed, continuing: {e}");
            }
        }
    }
}
