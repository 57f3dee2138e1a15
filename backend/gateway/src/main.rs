//! MyEasyDonate donation gateway: entry point.
//!
//! Fronts the crowdfunding platform API for the donation flow: fee quoting,
//! network detection and name enquiry, mobile-money debit with status
//! polling, guest donation recording and receipts. Exposes an Axum REST API
//! for the web front-end.

mod api;
mod config;
mod db;
mod donation;
mod draft;
mod errors;
mod fees;
mod network;
mod notify;
mod platform;
mod poller;
mod receipt;
mod session;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use donation::{GuestDefaults, Orchestrator};
use draft::DraftStore;
use platform::PlatformClient;
use poller::PollSettings;
use session::{BearerToken, SessionContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("Platform API at {}", config.api_base_url);

    // SQLite holds the session token, local state and issued receipts.
    let pool = db::init_pool(&config.database_url).await?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .default_headers(headers)
        .build()?;

    // ─── Session ──────────────────────────────────────────
    let token = BearerToken::default();
    let platform = PlatformClient::new(client, config.api_base_url.clone(), token.clone());
    let session = SessionContext::new(pool.clone(), token, platform.clone());
    match session.init().await {
        Ok(Some(user)) => info!("Signed in as {}", user.email),
        Ok(None) => info!("Starting without a session"),
        Err(e) => warn!("Session restore failed: {e}"),
    }

    // ─── Donation flow ────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(platform.clone()),
        pool.clone(),
        PollSettings {
            max_polls: config.max_polls,
            interval: config.poll_interval(),
        },
        GuestDefaults {
            payment_method_id: config.guest_payment_method_id,
            email: config.guest_email.clone(),
        },
    ));

    // ─── Draft sweeper ────────────────────────────────────
    let drafts = Arc::new(DraftStore::default());
    tokio::spawn(draft::run_sweeper(
        drafts.clone(),
        config.draft_idle(),
        config.draft_sweep(),
    ));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        platform,
        session,
        orchestrator,
        drafts,
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
