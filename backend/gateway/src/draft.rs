//! Server-held donation forms ("drafts").
//!
//! Each draft owns a `watch` channel carrying the phone field. A spawned
//! observer subscribes to it, and whenever a change completes a number on a
//! known network it runs the name enquiry and fills in the donor name. The
//! observer ends when the draft is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::donation::{
    DonationRequest, MomoFields, Orchestrator, SubmissionProgress, TransactionState,
};
use crate::errors::{GatewayError, Result};
use crate::fees::{self, DonationIntent, FeeQuote, PaymentMethod, TipSlider};
use crate::network::{self, Network};
use crate::platform::PaymentGateway;

#[derive(Debug, Clone)]
struct DraftForm {
    campaign_slug: String,
    campaign_title: String,
    amount: Option<Decimal>,
    tip: TipSlider,
    payment_method: Option<PaymentMethod>,
    is_anonymous: bool,
    momo: MomoFields,
    enquiry_in_flight: bool,
}

/// Partial update of a draft; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftPatch {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub tip_percent: Option<Decimal>,
    /// `null` deselects the payment method.
    #[serde(default, with = "double_option")]
    pub payment_method: Option<Option<PaymentMethod>>,
    #[serde(default)]
    pub is_anonymous: Option<bool>,
    #[serde(default)]
    pub msisdn: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
}

/// Tell "field absent" apart from "field is null".
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftSnapshot {
    pub id: Uuid,
    pub campaign_slug: String,
    pub campaign_title: String,
    pub amount: Option<Decimal>,
    pub tip_percent: Decimal,
    pub payment_method: Option<PaymentMethod>,
    pub is_anonymous: bool,
    pub momo: MomoFields,
    pub enquiry_in_flight: bool,
    pub quote: Option<FeeQuote>,
    pub donation_loading: bool,
    pub submission: Option<SubmissionProgress>,
}

struct ActiveSubmission {
    cancel: CancellationToken,
    progress: watch::Receiver<SubmissionProgress>,
}

impl ActiveSubmission {
    fn is_running(&self) -> bool {
        !self.progress.borrow().state.is_terminal()
    }
}

pub struct Draft {
    id: Uuid,
    form: Arc<Mutex<DraftForm>>,
    phone: watch::Sender<String>,
    submission: Mutex<Option<ActiveSubmission>>,
    last_touched: Mutex<Instant>,
}

impl Draft {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Apply a patch. Every field is checked before anything changes, so a
    /// rejected patch leaves the draft untouched.
    pub async fn update(&self, patch: DraftPatch) -> Result<DraftSnapshot> {
        {
            let mut form = self.form.lock().await;

            if let Some(amount) = patch.amount {
                fees::validate_amount(amount)?;
            }
            if patch.customer.is_some() && form.enquiry_in_flight {
                return Err(GatewayError::Validation(
                    "Name lookup in progress, try again shortly".to_string(),
                ));
            }

            if let Some(amount) = patch.amount {
                form.amount = Some(amount);
                form.tip.on_amount_changed(amount);
            }
            if let Some(chosen) = patch.tip_percent {
                let amount = form.amount.unwrap_or_default();
                form.tip.set(chosen, amount);
            }
            if let Some(method) = patch.payment_method {
                form.payment_method = method;
            }
            if let Some(anonymous) = patch.is_anonymous {
                form.is_anonymous = anonymous;
            }
            if let Some(customer) = patch.customer {
                form.momo.narration = customer.clone();
                form.momo.customer = customer;
            }
            if let Some(msisdn) = patch.msisdn {
                form.momo.network = network::detect(&msisdn);
                form.momo.msisdn = msisdn.clone();
                self.phone.send_replace(msisdn);
            }
        }
        Ok(self.snapshot().await)
    }

    async fn touch(&self) {
        *self.last_touched.lock().await = Instant::now();
    }

    async fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_touched.lock().await)
    }

    async fn is_submitting(&self) -> bool {
        self.submission
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveSubmission::is_running)
    }

    pub async fn snapshot(&self) -> DraftSnapshot {
        let form = self.form.lock().await.clone();
        let submission = self
            .submission
            .lock()
            .await
            .as_ref()
            .map(|s| s.progress.borrow().clone());
        let donation_loading = submission
            .as_ref()
            .is_some_and(|p| !p.state.is_terminal());

        let quote = form.amount.and_then(|amount| {
            DonationIntent::new(
                amount,
                form.tip.value(),
                form.payment_method.unwrap_or(PaymentMethod::Momo),
                form.is_anonymous,
            )
            .and_then(|intent| intent.quote())
            .ok()
        });

        DraftSnapshot {
            id: self.id,
            campaign_slug: form.campaign_slug,
            campaign_title: form.campaign_title,
            amount: form.amount,
            tip_percent: form.tip.value(),
            payment_method: form.payment_method,
            is_anonymous: form.is_anonymous,
            momo: form.momo,
            enquiry_in_flight: form.enquiry_in_flight,
            quote,
            donation_loading,
            submission,
        }
    }

    async fn donation_request(&self) -> Result<DonationRequest> {
        let form = self.form.lock().await;
        let payment_method = form.payment_method.ok_or_else(|| {
            GatewayError::Validation("Please choose a payment method".to_string())
        })?;
        let amount = form.amount.unwrap_or_default();
        let intent = DonationIntent::new(amount, form.tip.value(), payment_method, form.is_anonymous)?;
        Ok(DonationRequest {
            campaign_slug: form.campaign_slug.clone(),
            intent,
            momo: form.momo.clone(),
        })
    }

    /// Start the donation in the background. A second submit while one is
    /// still running is refused.
    pub async fn submit(&self, orchestrator: Arc<Orchestrator>) -> Result<DraftSnapshot> {
        {
            let mut active = self.submission.lock().await;
            if active.as_ref().is_some_and(ActiveSubmission::is_running) {
                return Err(GatewayError::Validation(
                    "A donation is already being processed".to_string(),
                ));
            }

            let request = self.donation_request().await?;
            request.momo_payload()?;

            let cancel = CancellationToken::new();
            let (tx, rx) = watch::channel(SubmissionProgress::default());
            // Mark as running before the task starts so a racing submit sees it.
            tx.send_modify(|p| p.state = TransactionState::Initiated);

            let task_cancel = cancel.clone();
            let draft_id = self.id;
            tokio::spawn(async move {
                if let Err(e) = orchestrator.submit(&request, &task_cancel, &tx).await {
                    error!("Draft {draft_id} submission rejected: {e}");
                }
            });

            *active = Some(ActiveSubmission {
                cancel,
                progress: rx,
            });
        }
        Ok(self.snapshot().await)
    }

    /// Ask the running submission to stop. Returns `false` when nothing runs.
    pub async fn cancel(&self) -> bool {
        match self.submission.lock().await.as_ref() {
            Some(active) if active.is_running() => {
                info!("Draft {} cancelled by donor", self.id);
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Phone-field observer: runs the name enquiry for every completed number.
async fn watch_phone(
    form: Arc<Mutex<DraftForm>>,
    mut phone: watch::Receiver<String>,
    gateway: Arc<dyn PaymentGateway>,
) {
    while phone.changed().await.is_ok() {
        let msisdn = phone.borrow_and_update().clone();
        let Some((local, network)) = network::enquiry_trigger(&msisdn) else {
            continue;
        };

        debug!("Number complete, running name enquiry for {local}");
        form.lock().await.enquiry_in_flight = true;
        let result = gateway.name_enquiry(&local, network).await;

        let mut form = form.lock().await;
        form.enquiry_in_flight = false;
        match result {
            Ok(Some(name)) if network::normalize(&form.momo.msisdn) == local => {
                info!("Name enquiry resolved {local}");
                form.momo.customer = name.clone();
                form.momo.narration = name;
            }
            Ok(Some(_)) => debug!("Discarding stale name enquiry for {local}"),
            Ok(None) => warn!("Name enquiry returned no name for {local}"),
            Err(e) => warn!("Name enquiry error for {local}: {e}"),
        }
    }
}

#[derive(Default)]
pub struct DraftStore {
    drafts: RwLock<HashMap<Uuid, Arc<Draft>>>,
}

impl DraftStore {
    pub async fn create(
        &self,
        campaign_slug: String,
        campaign_title: String,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Arc<Draft> {
        let form = Arc::new(Mutex::new(DraftForm {
            campaign_slug,
            campaign_title,
            amount: None,
            tip: TipSlider::default(),
            payment_method: Some(PaymentMethod::Momo),
            is_anonymous: false,
            momo: MomoFields {
                network: Network::Unknown,
                ..MomoFields::default()
            },
            enquiry_in_flight: false,
        }));
        let (phone, rx) = watch::channel(String::new());
        tokio::spawn(watch_phone(form.clone(), rx, gateway));

        let draft = Arc::new(Draft {
            id: Uuid::new_v4(),
            form,
            phone,
            submission: Mutex::new(None),
            last_touched: Mutex::new(Instant::now()),
        });
        self.drafts.write().await.insert(draft.id, draft.clone());
        draft
    }

    /// Look a draft up; every lookup counts as activity on it.
    pub async fn get(&self, id: Uuid) -> Result<Arc<Draft>> {
        let draft = self
            .drafts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("Draft {id}")))?;
        draft.touch().await;
        Ok(draft)
    }

    pub async fn len(&self) -> usize {
        self.drafts.read().await.len()
    }

    /// Drop drafts untouched for `max_idle` that have no running submission.
    /// Dropping a draft also ends its phone observer. Returns how many went.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let candidates: Vec<Arc<Draft>> = self.drafts.read().await.values().cloned().collect();

        let mut stale = Vec::new();
        for draft in candidates {
            if draft.idle_for(now).await >= max_idle && !draft.is_submitting().await {
                stale.push(draft.id);
            }
        }

        let mut drafts = self.drafts.write().await;
        for id in &stale {
            drafts.remove(id);
        }
        stale.len()
    }

    /// Drop a draft; a running submission is cancelled first.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let draft = self
            .drafts
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("Draft {id}")))?;
        draft.cancel().await;
        Ok(())
    }
}

/// Background sweep of abandoned drafts, run for the life of the process.
pub async fn run_sweeper(store: Arc<DraftStore>, max_idle: Duration, every: Duration) {
    info!("Draft sweeper starting, idle limit {}s", max_idle.as_secs());
    loop {
        tokio::time::sleep(every).await;
        let evicted = store.evict_idle(max_idle).await;
        if evicted > 0 {
            info!("Evicted {evicted} idle drafts, {} remaining", store.len().await);
        }
    }
}
