//! Client for the crowdfunding REST API.
//!
//! Every request carries `Accept: application/json` and, when the session
//! holds one, `Authorization: Bearer <token>`. Non-2xx answers become
//! [`GatewayError::Api`] with the decoded JSON body (if any), so callers can
//! still inspect gateway error codes carried by a failed response.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::{GatewayError, Result};
use crate::network::Network;
use crate::session::BearerToken;

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

/// Accepts `"abc"`, `123` or `null`; the API is not consistent about ids and amounts.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Either `{ "data": T }` or a bare `T`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } | Self::Bare(data) => data,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignOwner {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignCategory {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub goal_amount: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub current_amount: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub category: Option<CampaignCategory>,
    #[serde(default)]
    pub user: Option<CampaignOwner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentDonation {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub amount: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentDonations {
    #[serde(default, deserialize_with = "lenient_string")]
    pub total_raised: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub goal_amount: Option<String>,
    #[serde(default)]
    pub total_donations: u64,
    #[serde(default)]
    pub recent_donations: Vec<RecentDonation>,
}

#[derive(Debug, Serialize)]
struct NameEnquiryRequest<'a> {
    msisdn: &'a str,
    network: Network,
}

#[derive(Debug, Deserialize)]
struct NameEnquiryData {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NameEnquiryResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<NameEnquiryData>,
}

/// Body of `POST /payments/debit-wallet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MomoPayload {
    pub customer: String,
    pub msisdn: String,
    pub amount: String,
    pub network: Network,
    pub narration: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DebitData {
    #[serde(default, rename = "transactionId", deserialize_with = "lenient_string")]
    pub transaction_id: Option<String>,
    #[serde(default, rename = "refNo", deserialize_with = "lenient_string")]
    pub ref_no: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DebitResponse {
    #[serde(default, rename = "errorCode", deserialize_with = "lenient_string")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub data: Option<DebitData>,
}

/// Body of `POST /campaigns/{slug}/donate/guest`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestDonation {
    pub payment_method_id: u32,
    pub amount: Decimal,
    pub name: String,
    pub email: String,
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserResponse {
    user: User,
}

// ─────────────────────────────────────────────────────────
// Payment seam
// ─────────────────────────────────────────────────────────

/// The remote calls the donation flow depends on.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Registered account holder name, `None` when the API has no answer.
    async fn name_enquiry(&self, msisdn: &str, network: Network) -> Result<Option<String>>;

    async fn debit_wallet(&self, payload: &MomoPayload) -> Result<DebitResponse>;

    /// Raw status document; the shape varies, see [`crate::poller::extract_status`].
    async fn check_status(&self, ref_no: &str) -> Result<Value>;

    async fn donate_guest(&self, slug: &str, donation: &GuestDonation) -> Result<Value>;
}

// ─────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PlatformClient {
    client: Client,
    base_url: String,
    token: BearerToken,
}

impl PlatformClient {
    pub fn new(client: Client, base_url: impl Into<String>, token: BearerToken) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let mut request = request.header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = self.token.get().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let body = serde_json::from_slice::<Value>(&bytes).ok();
            debug!("Remote API answered {status}: {body:?}");
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    // ── Campaigns ──────────────────────────────────────────

    /// `GET /campaigns/public`; accepts a bare list or `{ "data": [...] }`.
    pub async fn public_campaigns(&self) -> Result<Vec<Campaign>> {
        let envelope: Envelope<Vec<Campaign>> =
            self.send(self.client.get(self.url("/campaigns/public"))).await?;
        Ok(envelope.into_inner())
    }

    pub async fn campaign(&self, slug: &str) -> Result<Campaign> {
        let envelope: Envelope<Campaign> = self
            .send(self.client.get(self.url(&format!("/campaigns/{slug}"))))
            .await?;
        Ok(envelope.into_inner())
    }

    /// Look a campaign up by slug in the public listing.
    pub async fn find_public_campaign(&self, slug: &str) -> Result<Campaign> {
        self.public_campaigns()
            .await?
            .into_iter()
            .find(|c| c.slug == slug)
            .ok_or_else(|| GatewayError::NotFound(format!("Campaign {slug}")))
    }

    pub async fn recent_donations(&self, slug: &str) -> Result<RecentDonations> {
        let envelope: Envelope<RecentDonations> = self
            .send(
                self.client
                    .get(self.url(&format!("/campaigns/{slug}/donations/recent"))),
            )
            .await?;
        Ok(envelope.into_inner())
    }

    // ── Auth ───────────────────────────────────────────────

    pub async fn login(&self, credentials: &Credentials) -> Result<AuthResponse> {
        self.send(self.client.post(self.url("/login")).json(credentials))
            .await
    }

    pub async fn register(&self, registration: &Registration) -> Result<AuthResponse> {
        self.send(self.client.post(self.url("/register")).json(registration))
            .await
    }

    pub async fn logout(&self) -> Result<()> {
        let _: Value = self.send(self.client.post(self.url("/logout"))).await?;
        Ok(())
    }

    pub async fn current_user(&self) -> Result<User> {
        let response: UserResponse = self.send(self.client.get(self.url("/user"))).await?;
        Ok(response.user)
    }
}

#[async_trait]
impl PaymentGateway for PlatformClient {
    async fn name_enquiry(&self, msisdn: &str, network: Network) -> Result<Option<String>> {
        let response: NameEnquiryResponse = self
            .send(
                self.client
                    .post(self.url("/wallet/name-enquiry"))
                    .json(&NameEnquiryRequest { msisdn, network }),
            )
            .await?;

        Ok(response
            .data
            .and_then(|d| d.name)
            .filter(|name| response.success && !name.trim().is_empty()))
    }

    async fn debit_wallet(&self, payload: &MomoPayload) -> Result<DebitResponse> {
        self.send(
            self.client
                .post(self.url("/payments/debit-wallet"))
                .json(payload),
        )
        .await
    }

    async fn check_status(&self, ref_no: &str) -> Result<Value> {
        self.send(
            self.client
                .get(self.url(&format!("/payments/check-status/{ref_no}"))),
        )
        .await
    }

    async fn donate_guest(&self, slug: &str, donation: &GuestDonation) -> Result<Value> {
        self.send(
            self.client
                .post(self.url(&format!("/campaigns/{slug}/donate/guest")))
                .json(donation),
        )
        .await
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
