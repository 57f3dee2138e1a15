//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::db;
use crate::donation::Orchestrator;
use crate::draft::{DraftPatch, DraftSnapshot, DraftStore};
use crate::errors::{GatewayError, Result};
use crate::fees::{DonationIntent, FeeQuote, PaymentMethod, DEFAULT_TIP_PERCENT};
use crate::network::{self, Network};
use crate::platform::{Campaign, Credentials, PlatformClient, RecentDonations, Registration, User};
use crate::receipt::{self, ReceiptFormat, ReceiptRecord};
use crate::session::SessionContext;

/// Front-end page the request was made from, used for the 401 rule.
pub const PAGE_HEADER: &str = "x-page-path";

pub struct ApiState {
    pub pool: SqlitePool,
    pub platform: PlatformClient,
    pub session: SessionContext,
    pub orchestrator: Arc<Orchestrator>,
    pub drafts: Arc<DraftStore>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fees", get(quote_fees))
        .route("/network/:msisdn", get(detect_network))
        .route("/campaigns", get(list_campaigns))
        .route("/campaigns/:slug", get(get_campaign))
        .route("/campaigns/:slug/donations/recent", get(get_recent_donations))
        .route("/session/last-campaign", get(last_campaign))
        .route("/drafts", post(create_draft))
        .route(
            "/drafts/:id",
            get(get_draft).patch(update_draft).delete(delete_draft),
        )
        .route("/drafts/:id/submit", post(submit_draft))
        .route("/drafts/:id/cancel", post(cancel_draft))
        .route("/receipts/:number", get(get_receipt))
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/logout", post(logout))
        .route("/auth/user", get(current_user))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn page_path(headers: &HeaderMap) -> &str {
    headers
        .get(PAGE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("/")
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct NetworkResponse {
    pub msisdn: String,
    pub normalized: String,
    pub network: Network,
    pub triggers_enquiry: bool,
}

#[derive(Serialize)]
pub struct CampaignsResponse {
    pub count: usize,
    pub campaigns: Vec<Campaign>,
}

#[derive(Serialize)]
pub struct LastCampaignResponse {
    pub slug: Option<String>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub authenticated: bool,
    pub user: Option<User>,
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FeeQuery {
    pub amount: Decimal,
    #[serde(default)]
    pub tip: Option<Decimal>,
}

#[derive(Deserialize)]
pub struct CreateDraft {
    pub campaign_slug: String,
}

#[derive(Deserialize)]
pub struct ReceiptQuery {
    #[serde(default)]
    pub format: ReceiptFormat,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /fees?amount=…&tip=…`
pub async fn quote_fees(Query(query): Query<FeeQuery>) -> Result<Json<FeeQuote>> {
    let intent = DonationIntent::new(
        query.amount,
        query.tip.unwrap_or(DEFAULT_TIP_PERCENT),
        PaymentMethod::Momo,
        false,
    )?;
    Ok(Json(intent.quote()?))
}

/// `GET /network/:msisdn`
pub async fn detect_network(Path(msisdn): Path<String>) -> Json<NetworkResponse> {
    Json(NetworkResponse {
        normalized: network::normalize(&msisdn),
        network: network::detect(&msisdn),
        triggers_enquiry: network::enquiry_trigger(&msisdn).is_some(),
        msisdn,
    })
}

/// `GET /campaigns`
pub async fn list_campaigns(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<CampaignsResponse>> {
    let result = state.platform.public_campaigns().await;
    let campaigns = state.session.check(page_path(&headers), result).await?;
    Ok(Json(CampaignsResponse {
        count: campaigns.len(),
        campaigns,
    }))
}

/// `GET /campaigns/:slug`
///
/// Also remembers the slug as the last visited campaign.
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Campaign>> {
    let result = state.platform.campaign(&slug).await;
    let campaign = state.session.check(page_path(&headers), result).await?;
    db::set_state(&state.pool, db::KEY_LAST_CAMPAIGN_SLUG, &campaign.slug).await?;
    Ok(Json(campaign))
}

/// `GET /campaigns/:slug/donations/recent`
pub async fn get_recent_donations(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RecentDonations>> {
    let result = state.platform.recent_donations(&slug).await;
    Ok(Json(state.session.check(page_path(&headers), result).await?))
}

/// `GET /session/last-campaign`
pub async fn last_campaign(State(state): State<Arc<ApiState>>) -> Result<Json<LastCampaignResponse>> {
    let slug = db::get_state(&state.pool, db::KEY_LAST_CAMPAIGN_SLUG).await?;
    Ok(Json(LastCampaignResponse { slug }))
}

/// `POST /drafts`
///
/// Opens a donation form for a public campaign.
pub async fn create_draft(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateDraft>,
) -> Result<(StatusCode, Json<DraftSnapshot>)> {
    let campaign = state.platform.find_public_campaign(&body.campaign_slug).await?;
    let draft = state
        .drafts
        .create(
            campaign.slug,
            campaign.title,
            state.orchestrator.gateway(),
        )
        .await;
    Ok((StatusCode::CREATED, Json(draft.snapshot().await)))
}

/// `GET /drafts/:id`
pub async fn get_draft(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DraftSnapshot>> {
    let draft = state.drafts.get(id).await?;
    Ok(Json(draft.snapshot().await))
}

/// `PATCH /drafts/:id`
pub async fn update_draft(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<DraftPatch>,
) -> Result<Json<DraftSnapshot>> {
    let draft = state.drafts.get(id).await?;
    Ok(Json(draft.update(patch).await?))
}

/// `DELETE /drafts/:id`
pub async fn delete_draft(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.drafts.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /drafts/:id/submit`
///
/// Starts the payment; poll `GET /drafts/:id` for progress.
pub async fn submit_draft(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DraftSnapshot>)> {
    let draft = state.drafts.get(id).await?;
    let snapshot = draft.submit(state.orchestrator.clone()).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// `POST /drafts/:id/cancel`
pub async fn cancel_draft(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let draft = state.drafts.get(id).await?;
    let cancelled = draft.cancel().await;
    Ok(Json(json!({ "id": draft.id(), "cancelled": cancelled })))
}

/// `GET /receipts/:number?format=json|text|html|data-url`
pub async fn get_receipt(
    State(state): State<Arc<ApiState>>,
    Path(number): Path<String>,
    Query(query): Query<ReceiptQuery>,
) -> Result<Response> {
    let record: ReceiptRecord = db::get_receipt(&state.pool, &number)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("Receipt {number}")))?;

    let response = match query.format {
        ReceiptFormat::Json => Json(record).into_response(),
        ReceiptFormat::Text => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            receipt::render_document(&record, receipt::PAGE_HEIGHT_LINES).to_text(),
        )
            .into_response(),
        ReceiptFormat::Html => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            receipt::render_html(&record),
        )
            .into_response(),
        ReceiptFormat::DataUrl => Json(json!({
            "receipt_number": record.receipt_number,
            "data_url": receipt::html_data_url(&record),
        }))
        .into_response(),
    };
    Ok(response)
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<Arc<ApiState>>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<SessionResponse>> {
    let response = state.session.login(&credentials).await?;
    Ok(Json(SessionResponse {
        authenticated: state.session.is_authenticated().await,
        user: response.user,
    }))
}

/// `POST /auth/register`
pub async fn register(
    State(state): State<Arc<ApiState>>,
    Json(registration): Json<Registration>,
) -> Result<Json<SessionResponse>> {
    let response = state.session.register(&registration).await?;
    Ok(Json(SessionResponse {
        authenticated: state.session.is_authenticated().await,
        user: response.user,
    }))
}

/// `POST /auth/logout`
pub async fn logout(State(state): State<Arc<ApiState>>) -> Result<Json<SessionResponse>> {
    state.session.logout().await?;
    Ok(Json(SessionResponse {
        authenticated: false,
        user: None,
    }))
}

/// `GET /auth/user`
pub async fn current_user(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>> {
    let user = state.session.current_user(page_path(&headers)).await?;
    Ok(Json(SessionResponse {
        authenticated: true,
        user: Some(user),
    }))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
