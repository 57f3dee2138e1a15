//! Guest mobile-money donation flow.
//!
//! One submission runs strictly in sequence:
//!
//! 1. debit the donor's wallet for the total (donation + tip),
//! 2. poll the payment status until it settles,
//! 3. record the guest donation and issue a receipt.
//!
//! Step 3 runs only for a payment the gateway confirmed as successful and the
//! donor did not cancel. Every other path (declined, unknown gateway answer,
//! transport failure, timeout, cancellation) ends without a donation record.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::{GatewayError, Result};
use crate::fees::{format_amount, DonationIntent, PaymentMethod};
use crate::network::Network;
use crate::notify::Notification;
use crate::platform::{DebitResponse, GuestDonation, MomoPayload, PaymentGateway};
use crate::poller::{poll_until_settled, PollOutcome, PollSettings};
use crate::receipt::{new_receipt_number, ReceiptRecord};

pub const GATEWAY_OK: &str = "000";
pub const GATEWAY_TRANSACTION_FAILED: &str = "100";

pub const TRANSACTION_FAILED_MESSAGE: &str =
    "Transaction Failed. Please try again or use a different payment method.";

const ANONYMOUS_DONOR: &str = "Anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    #[default]
    Idle,
    Initiated,
    Polling,
    Successful,
    Failed,
    Cancelled,
    /// Still pending when the poll budget ran out; a failure for the donor.
    Timeout,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

/// Live view of one submission, published on a `watch` channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmissionProgress {
    pub state: TransactionState,
    pub reference_no: Option<String>,
    pub poll_count: u32,
    pub notifications: Vec<Notification>,
    pub receipt: Option<ReceiptRecord>,
}

/// Mobile-money fields of the donation form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MomoFields {
    pub customer: String,
    pub msisdn: String,
    pub network: Network,
    pub narration: String,
}

#[derive(Debug, Clone)]
pub struct DonationRequest {
    pub campaign_slug: String,
    pub intent: DonationIntent,
    pub momo: MomoFields,
}

impl DonationRequest {
    /// Build the wallet-debit body, rejecting incomplete forms.
    pub fn momo_payload(&self) -> Result<MomoPayload> {
        if self.intent.payment_method != PaymentMethod::Momo {
            return Err(GatewayError::Validation(
                "Card payments are not available yet; please use Mobile Money".to_string(),
            ));
        }
        if self.momo.msisdn.trim().is_empty() {
            return Err(GatewayError::Validation("Phone number is required".to_string()));
        }
        if !self.momo.network.is_known() {
            return Err(GatewayError::Validation(
                "Unsupported mobile network for this phone number".to_string(),
            ));
        }
        if self.momo.customer.trim().is_empty() {
            return Err(GatewayError::Validation("Full name is required".to_string()));
        }

        Ok(MomoPayload {
            customer: self.momo.customer.trim().to_string(),
            msisdn: self.momo.msisdn.trim().to_string(),
            amount: format_amount(self.intent.total_amount()?),
            network: self.momo.network,
            narration: self.momo.narration.trim().to_string(),
        })
    }
}

/// What the gateway's answer to a debit request means for the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitClassification {
    /// Debit initiated; poll `ref_no`.
    Accepted {
        transaction_id: String,
        ref_no: String,
    },
    /// `000` without a transaction id.
    MissingTransactionId,
    /// Explicit `100`, in a success body or an error body.
    TransactionFailed { error: Option<String> },
    /// Any other gateway code.
    UnknownError { code: Option<String>, error: Option<String> },
    /// No usable answer at all.
    Transport { message: String },
}

fn error_text(value: &Option<serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

pub fn classify_debit(result: &Result<DebitResponse>) -> DebitClassification {
    match result {
        Ok(response) => {
            let code = response.error_code.as_deref();
            let error_is_null = matches!(response.error, None | Some(serde_json::Value::Null));
            match code {
                Some(GATEWAY_OK) if error_is_null => {
                    let data = response.data.clone().unwrap_or_default();
                    match data.transaction_id {
                        Some(transaction_id) => DebitClassification::Accepted {
                            ref_no: data.ref_no.unwrap_or_else(|| transaction_id.clone()),
                            transaction_id,
                        },
                        None => DebitClassification::MissingTransactionId,
                    }
                }
                Some(GATEWAY_TRANSACTION_FAILED) => DebitClassification::TransactionFailed {
                    error: error_text(&response.error),
                },
                _ => DebitClassification::UnknownError {
                    code: response.error_code.clone(),
                    error: error_text(&response.error),
                },
            }
        }
        Err(e) => {
            let body = e.response_body();
            let code = body
                .and_then(|b| b.get("errorCode"))
                .and_then(|c| c.as_str().map(str::to_string).or_else(|| c.as_u64().map(|n| n.to_string())));
            if code.as_deref() == Some(GATEWAY_TRANSACTION_FAILED) {
                return DebitClassification::TransactionFailed {
                    error: body.and_then(|b| error_text(&b.get("error").cloned())),
                };
            }
            let message = match (e, body) {
                (_, Some(body)) => format!("API Error: {body}"),
                (GatewayError::Http(err), None) if err.is_connect() || err.is_timeout() => {
                    "No response from server. Please check your network or server logs.".to_string()
                }
                (other, None) => format!("Network Error: {other}"),
            };
            DebitClassification::Transport { message }
        }
    }
}

/// Defaults sent with every guest donation record.
#[derive(Debug, Clone)]
pub struct GuestDefaults {
    pub payment_method_id: u32,
    pub email: String,
}

pub struct Orchestrator {
    gateway: Arc<dyn PaymentGateway>,
    pool: SqlitePool,
    settings: PollSettings,
    guest: GuestDefaults,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        pool: SqlitePool,
        settings: PollSettings,
        guest: GuestDefaults,
    ) -> Self {
        Self {
            gateway,
            pool,
            settings,
            guest,
        }
    }

    pub fn gateway(&self) -> Arc<dyn PaymentGateway> {
        Arc::clone(&self.gateway)
    }

    /// Run one submission to completion. Only form validation fails with an
    /// error; remote failures are reported through `progress`.
    pub async fn submit(
        &self,
        request: &DonationRequest,
        cancel: &CancellationToken,
        progress: &watch::Sender<SubmissionProgress>,
    ) -> Result<SubmissionProgress> {
        let payload = request.momo_payload()?;

        progress.send_modify(|p| {
            *p = SubmissionProgress {
                state: TransactionState::Initiated,
                ..SubmissionProgress::default()
            }
        });

        info!(
            "Debiting {} on {} for campaign {}",
            payload.amount,
            payload.network.as_str(),
            request.campaign_slug
        );
        let debit = self.gateway.debit_wallet(&payload).await;
        match &debit {
            Ok(response) => info!("Debit response: {response:?}"),
            Err(e) => self.cache_debit_error(&payload, e).await,
        }

        let final_state = match classify_debit(&debit) {
            DebitClassification::Accepted {
                transaction_id,
                ref_no,
            } => {
                self.follow_payment(request, &payload, &transaction_id, &ref_no, cancel, progress)
                    .await
            }
            DebitClassification::MissingTransactionId => {
                error!("Debit accepted without a transaction id");
                finish(
                    progress,
                    TransactionState::Failed,
                    Notification::error(
                        "Payment Error",
                        "No transaction ID received. No donation has been recorded.",
                    ),
                )
            }
            DebitClassification::TransactionFailed { error } => {
                warn!("Gateway declined the debit: {error:?}");
                finish(
                    progress,
                    TransactionState::Failed,
                    Notification::error("Payment Error", TRANSACTION_FAILED_MESSAGE),
                )
            }
            DebitClassification::UnknownError { code, error } => {
                error!("Unknown gateway answer {code:?}: {error:?}");
                finish(
                    progress,
                    TransactionState::Failed,
                    Notification::warning(
                        "Payment Status Unknown",
                        format!(
                            "We could not confirm your payment ({}). No donation has been recorded.",
                            error.unwrap_or_else(|| "Unknown error".to_string())
                        ),
                    ),
                )
            }
            DebitClassification::Transport { message } => {
                error!("Payment Error: {message}");
                finish(
                    progress,
                    TransactionState::Failed,
                    Notification::error(
                        "Payment Error",
                        "We could not reach the payment service. No donation has been recorded.",
                    ),
                )
            }
        };

        if let Err(e) =
            db::set_state(&self.pool, db::KEY_LAST_CAMPAIGN_SLUG, &request.campaign_slug).await
        {
            warn!("Could not remember last campaign: {e}");
        }

        info!("Submission for {} ended in {final_state:?}", request.campaign_slug);
        Ok(progress.borrow().clone())
    }

    async fn follow_payment(
        &self,
        request: &DonationRequest,
        payload: &MomoPayload,
        transaction_id: &str,
        ref_no: &str,
        cancel: &CancellationToken,
        progress: &watch::Sender<SubmissionProgress>,
    ) -> TransactionState {
        info!("Payment {transaction_id} initiated, waiting for approval on the phone");
        progress.send_modify(|p| {
            p.state = TransactionState::Polling;
            p.reference_no = Some(ref_no.to_string());
            p.notifications.push(Notification::info(
                "Approve Payment",
                "Please approve the payment prompt on your phone.",
            ));
        });

        let report = poll_until_settled(self.gateway.as_ref(), ref_no, &self.settings, cancel, |n| {
            progress.send_modify(|p| p.poll_count = n);
        })
        .await;

        // A cancel that lands while the final status request is in flight still wins.
        let outcome = if cancel.is_cancelled() {
            PollOutcome::Cancelled
        } else {
            report.outcome
        };

        match outcome {
            PollOutcome::Successful => {
                self.record_donation(request, payload, transaction_id, ref_no, progress)
                    .await
            }
            PollOutcome::Failed => finish(
                progress,
                TransactionState::Failed,
                Notification::error(
                    "Payment Failed",
                    "The payment was not approved. No donation has been recorded.",
                ),
            ),
            PollOutcome::TimedOut => finish(
                progress,
                TransactionState::Timeout,
                Notification::warning(
                    "Payment Not Confirmed",
                    format!(
                        "We did not receive a confirmation in time. No donation has been recorded. \
                         If you were charged, contact support with reference {ref_no}."
                    ),
                ),
            ),
            PollOutcome::Cancelled => finish(
                progress,
                TransactionState::Cancelled,
                Notification::info(
                    "Donation Cancelled",
                    "You cancelled this donation. No donation has been recorded.",
                ),
            ),
        }
    }

    async fn record_donation(
        &self,
        request: &DonationRequest,
        payload: &MomoPayload,
        transaction_id: &str,
        ref_no: &str,
        progress: &watch::Sender<SubmissionProgress>,
    ) -> TransactionState {
        let intent = &request.intent;
        let name = if intent.is_anonymous {
            ANONYMOUS_DONOR.to_string()
        } else {
            payload.customer.clone()
        };
        let not_recorded = || {
            Notification::error(
                "Donation Not Recorded",
                format!(
                    "Your payment went through but we could not record your donation. \
                     Please contact support with reference {ref_no}."
                ),
            )
        };
        let quote = match intent.quote() {
            Ok(quote) => quote,
            Err(e) => {
                error!("Cannot price donation after successful payment {transaction_id}: {e}");
                return finish(progress, TransactionState::Successful, not_recorded());
            }
        };
        let donation = GuestDonation {
            payment_method_id: self.guest.payment_method_id,
            amount: intent.donation_amount,
            name: name.clone(),
            email: self.guest.email.clone(),
            is_anonymous: intent.is_anonymous,
        };

        if let Err(e) = self
            .gateway
            .donate_guest(&request.campaign_slug, &donation)
            .await
        {
            error!("Donation Record Error after successful payment {transaction_id}: {e}");
            return finish(progress, TransactionState::Successful, not_recorded());
        }

        let now = Utc::now().trunc_subsecs(0);
        let receipt = ReceiptRecord {
            receipt_number: new_receipt_number(now),
            campaign_slug: request.campaign_slug.clone(),
            donor_name: name,
            amount: intent.donation_amount,
            fee_amount: quote.fee_amount,
            total_amount: quote.total_amount,
            payment_method: intent.payment_method,
            network: Some(payload.network),
            timestamp: now,
            transaction_id: Some(transaction_id.to_string()),
            reference_no: Some(ref_no.to_string()),
        };
        if let Err(e) = db::insert_receipt(&self.pool, &receipt).await {
            warn!("Could not store receipt {}: {e}", receipt.receipt_number);
        }
        info!("Guest donation recorded, receipt {}", receipt.receipt_number);

        progress.send_modify(|p| p.receipt = Some(receipt));
        finish(
            progress,
            TransactionState::Successful,
            Notification::success("Donation Recorded", "Thank you for your donation!"),
        )
    }

    /// Keep the raw failure for diagnostics. Failing to do so is not fatal.
    async fn cache_debit_error(&self, payload: &MomoPayload, err: &GatewayError) {
        let entry = json!({
            "error": err.to_string(),
            "body": err.response_body(),
            "payload": payload,
            "time": Utc::now().to_rfc3339(),
        });
        if let Err(e) = db::set_state(&self.pool, db::KEY_LAST_MOMO_ERROR, &entry.to_string()).await {
            error!("Failed to cache error: {e}");
        }
    }
}

fn finish(
    progress: &watch::Sender<SubmissionProgress>,
    state: TransactionState,
    notification: Notification,
) -> TransactionState {
    progress.send_modify(|p| {
        p.state = state;
        p.notifications.push(notification);
    });
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    use crate::notify::Severity;
    use crate::platform::DebitData;
    use crate::poller::tests::ScriptedGateway;

    fn request(anonymous: bool) -> DonationRequest {
        DonationRequest {
            campaign_slug: "clean-water".to_string(),
            intent: DonationIntent::new(dec!(100), dec!(2), PaymentMethod::Momo, anonymous).unwrap(),
            momo: MomoFields {
                customer: "Ama Mensah".to_string(),
                msisdn: "0244123456".to_string(),
                network: Network::Mtn,
                narration: "Ama Mensah".to_string(),
            },
        }
    }

    fn accepted() -> DebitResponse {
        DebitResponse {
            error_code: Some("000".to_string()),
            error: None,
            data: Some(DebitData {
                transaction_id: Some("TX-1".to_string()),
                ref_no: Some("REF-1".to_string()),
            }),
        }
    }

    async fn orchestrator(gateway: Arc<ScriptedGateway>) -> (Orchestrator, SqlitePool) {
        // The paused test clock auto-advances while sqlx's worker thread
        // connects, which trips the pool acquire timeout; build the pool
        // on the real clock, then pause again.
        tokio::time::resume();
        let pool = db::test_pool().await;
        tokio::time::pause();
        let orchestrator = Orchestrator::new(
            gateway,
            pool.clone(),
            PollSettings::default(),
            GuestDefaults {
                payment_method_id: 1,
                email: "guest@myeasydonate.com".to_string(),
            },
        );
        (orchestrator, pool)
    }

    async fn run(
        orchestrator: &Orchestrator,
        request: &DonationRequest,
        cancel: &CancellationToken,
    ) -> SubmissionProgress {
        let (tx, _rx) = watch::channel(SubmissionProgress::default());
        orchestrator.submit(request, cancel, &tx).await.unwrap()
    }

    #[test]
    fn payload_uses_total_with_two_decimals() {
        let payload = request(false).momo_payload().unwrap();
        assert_eq!(payload.amount, "102.50");
        assert_eq!(payload.network, Network::Mtn);
        assert_eq!(payload.narration, "Ama Mensah");
    }

    #[test]
    fn payload_requires_complete_form() {
        let mut r = request(false);
        r.momo.customer = "  ".to_string();
        assert!(matches!(r.momo_payload(), Err(GatewayError::Validation(_))));

        let mut r = request(false);
        r.momo.network = Network::Unknown;
        assert!(matches!(r.momo_payload(), Err(GatewayError::Validation(_))));

        let mut r = request(false);
        r.intent.payment_method = PaymentMethod::Card;
        assert!(matches!(r.momo_payload(), Err(GatewayError::Validation(_))));
    }

    #[test]
    fn classifies_gateway_answers() {
        assert_eq!(
            classify_debit(&Ok(accepted())),
            DebitClassification::Accepted {
                transaction_id: "TX-1".to_string(),
                ref_no: "REF-1".to_string()
            }
        );

        let mut no_ref = accepted();
        no_ref.data = Some(DebitData {
            transaction_id: Some("TX-2".to_string()),
            ref_no: None,
        });
        assert_eq!(
            classify_debit(&Ok(no_ref)),
            DebitClassification::Accepted {
                transaction_id: "TX-2".to_string(),
                ref_no: "TX-2".to_string()
            }
        );

        let mut no_tx = accepted();
        no_tx.data = None;
        assert_eq!(classify_debit(&Ok(no_tx)), DebitClassification::MissingTransactionId);

        let declined = DebitResponse {
            error_code: Some("100".to_string()),
            error: Some(json!("Transaction Failed")),
            data: None,
        };
        assert_eq!(
            classify_debit(&Ok(declined)),
            DebitClassification::TransactionFailed {
                error: Some("Transaction Failed".to_string())
            }
        );

        let odd = DebitResponse {
            error_code: Some("000".to_string()),
            error: Some(json!("partial")),
            data: None,
        };
        assert!(matches!(
            classify_debit(&Ok(odd)),
            DebitClassification::UnknownError { .. }
        ));

        let body_100: Result<DebitResponse> = Err(GatewayError::Api {
            status: 400,
            body: Some(json!({ "errorCode": "100", "error": "Transaction Failed" })),
        });
        assert!(matches!(
            classify_debit(&body_100),
            DebitClassification::TransactionFailed { .. }
        ));

        let body_other: Result<DebitResponse> = Err(GatewayError::Api {
            status: 500,
            body: Some(json!({ "message": "boom" })),
        });
        assert!(matches!(
            classify_debit(&body_other),
            DebitClassification::Transport { message } if message.starts_with("API Error")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_payment_records_donation_and_issues_receipt() {
        let gateway = Arc::new(
            ScriptedGateway::pending()
                .with_debit(Ok(accepted()))
                .with_statuses(vec![
                    Ok(json!({ "status": "PENDING" })),
                    Ok(json!({ "status": "SUCCESSFUL" })),
                ]),
        );
        let (orchestrator, pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Successful);
        assert_eq!(progress.poll_count, 2);
        assert_eq!(progress.reference_no.as_deref(), Some("REF-1"));
        assert_eq!(gateway.donate_calls(), 1);

        let recorded = gateway.recorded.lock().unwrap().clone();
        let (slug, donation) = &recorded[0];
        assert_eq!(slug, "clean-water");
        assert_eq!(donation.amount, dec!(100));
        assert_eq!(donation.name, "Ama Mensah");
        assert_eq!(donation.payment_method_id, 1);
        assert!(!donation.is_anonymous);

        let receipt = progress.receipt.unwrap();
        assert_eq!(receipt.total_amount, dec!(102.5));
        assert_eq!(receipt.fee_amount, dec!(2.5));
        assert_eq!(receipt.transaction_id.as_deref(), Some("TX-1"));
        assert_eq!(
            db::get_receipt(&pool, &receipt.receipt_number).await.unwrap(),
            Some(receipt)
        );
        assert_eq!(
            progress.notifications.last().unwrap().severity,
            Severity::Success
        );
        assert_eq!(
            db::get_state(&pool, db::KEY_LAST_CAMPAIGN_SLUG)
                .await
                .unwrap()
                .as_deref(),
            Some("clean-water")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_donation_hides_the_name() {
        let gateway = Arc::new(
            ScriptedGateway::pending()
                .with_debit(Ok(accepted()))
                .with_statuses(vec![Ok(json!({ "status": "SUCCESS" }))]),
        );
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(true), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Successful);
        let recorded = gateway.recorded.lock().unwrap().clone();
        assert_eq!(recorded[0].1.name, "Anonymous");
        assert!(recorded[0].1.is_anonymous);
        assert_eq!(progress.receipt.unwrap().donor_name, "Anonymous");
    }

    #[tokio::test(start_paused = true)]
    async fn error_code_100_never_records() {
        let gateway = Arc::new(ScriptedGateway::pending().with_debit(Ok(DebitResponse {
            error_code: Some("100".to_string()),
            error: Some(json!("Transaction Failed")),
            data: None,
        })));
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Failed);
        assert_eq!(gateway.status_calls(), 0);
        assert_eq!(gateway.donate_calls(), 0);
        let last = progress.notifications.last().unwrap();
        assert_eq!(last.title, "Payment Error");
        assert_eq!(last.description, TRANSACTION_FAILED_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn error_code_100_in_error_body_never_records() {
        let gateway = Arc::new(ScriptedGateway::pending().with_debit(Err(GatewayError::Api {
            status: 422,
            body: Some(json!({ "errorCode": "100", "error": "Transaction Failed" })),
        })));
        let (orchestrator, pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Failed);
        assert_eq!(gateway.donate_calls(), 0);
        assert_eq!(
            progress.notifications.last().unwrap().description,
            TRANSACTION_FAILED_MESSAGE
        );
        let cached = db::get_state(&pool, db::KEY_LAST_MOMO_ERROR).await.unwrap().unwrap();
        assert!(cached.contains("\"errorCode\":\"100\""));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_cached_and_never_records() {
        let gateway = Arc::new(ScriptedGateway::pending().with_debit(Err(GatewayError::Api {
            status: 502,
            body: Some(json!({ "message": "bad gateway" })),
        })));
        let (orchestrator, pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Failed);
        assert_eq!(gateway.donate_calls(), 0);
        let cached = db::get_state(&pool, db::KEY_LAST_MOMO_ERROR).await.unwrap().unwrap();
        let cached: Value = serde_json::from_str(&cached).unwrap();
        assert_eq!(cached["payload"]["msisdn"], "0244123456");
        assert_eq!(cached["body"]["message"], "bad gateway");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_gateway_code_never_records() {
        let gateway = Arc::new(ScriptedGateway::pending().with_debit(Ok(DebitResponse {
            error_code: Some("999".to_string()),
            error: Some(json!("Something odd")),
            data: None,
        })));
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Failed);
        assert_eq!(gateway.status_calls(), 0);
        assert_eq!(gateway.donate_calls(), 0);
        assert_eq!(progress.notifications.last().unwrap().severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_transaction_id_never_records() {
        let gateway = Arc::new(ScriptedGateway::pending().with_debit(Ok(DebitResponse {
            error_code: Some("000".to_string()),
            error: None,
            data: Some(DebitData::default()),
        })));
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Failed);
        assert_eq!(gateway.status_calls(), 0);
        assert_eq!(gateway.donate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_never_records() {
        let gateway = Arc::new(ScriptedGateway::pending().with_debit(Ok(accepted())));
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Timeout);
        assert!(progress.state.is_failure());
        assert_eq!(progress.poll_count, 20);
        assert_eq!(gateway.status_calls(), 20);
        assert_eq!(gateway.donate_calls(), 0);
        assert!(progress.receipt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_never_records() {
        let gateway = Arc::new(
            ScriptedGateway::pending()
                .with_debit(Ok(accepted()))
                .with_statuses(vec![Ok(json!({ "status": "FAILED" }))]),
        );
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Failed);
        assert_eq!(gateway.donate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_poll_never_records() {
        let cancel = CancellationToken::new();
        let mut scripted = ScriptedGateway::pending().with_debit(Ok(accepted()));
        scripted.cancel_on_call = Some((3, cancel.clone()));
        let gateway = Arc::new(scripted);
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &cancel).await;

        assert_eq!(progress.state, TransactionState::Cancelled);
        assert_eq!(gateway.status_calls(), 3);
        assert_eq!(gateway.donate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_final_success_check_still_wins() {
        let cancel = CancellationToken::new();
        let mut scripted = ScriptedGateway::pending()
            .with_debit(Ok(accepted()))
            .with_statuses(vec![Ok(json!({ "status": "SUCCESSFUL" }))]);
        scripted.cancel_on_call = Some((1, cancel.clone()));
        let gateway = Arc::new(scripted);
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &cancel).await;

        assert_eq!(progress.state, TransactionState::Cancelled);
        assert_eq!(gateway.donate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn record_failure_is_reported_without_retry() {
        let mut scripted = ScriptedGateway::pending()
            .with_debit(Ok(accepted()))
            .with_statuses(vec![Ok(json!({ "status": "SUCCESSFUL" }))]);
        scripted.donate_fails = true;
        let gateway = Arc::new(scripted);
        let (orchestrator, _pool) = orchestrator(gateway.clone()).await;

        let progress = run(&orchestrator, &request(false), &CancellationToken::new()).await;

        assert_eq!(progress.state, TransactionState::Successful);
        assert_eq!(gateway.donate_calls(), 1);
        assert!(progress.receipt.is_none());
        let last = progress.notifications.last().unwrap();
        assert_eq!(last.title, "Donation Not Recorded");
        assert!(last.description.contains("REF-1"));
    }
}
