//! Authenticated session: the bearer token, its persistence, and the rules
//! for dropping it.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db;
use crate::errors::{GatewayError, Result};
use crate::platform::{AuthResponse, Credentials, PlatformClient, Registration, User};

pub const LOGIN_ROUTE: &str = "/login";

const PUBLIC_ROUTES: &[&str] = &[
    "/",
    "/about",
    "/campaign",
    "/faq",
    "/volunteer",
    "/success-story",
    "/all-campaigns",
    "/public-campaigns",
    "/upcoming-campaigns",
    "/contact",
];

const PUBLIC_ROUTE_PREFIXES: &[&str] = &["/donate/", "/DonationsPage/", "/campaign/"];

/// Front-end pages on which a 401 must not end the session.
pub fn is_public_route(path: &str) -> bool {
    PUBLIC_ROUTES.contains(&path) || PUBLIC_ROUTE_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Shared, in-memory copy of the session token read by every outbound request.
#[derive(Debug, Clone, Default)]
pub struct BearerToken(Arc<RwLock<Option<String>>>);

impl BearerToken {
    pub async fn get(&self) -> Option<String> {
        self.0.read().await.clone()
    }

    pub async fn set(&self, token: Option<String>) {
        *self.0.write().await = token;
    }
}

/// Scoped session context, injected into the handlers that need it.
#[derive(Clone)]
pub struct SessionContext {
    pool: SqlitePool,
    token: BearerToken,
    platform: PlatformClient,
}

impl SessionContext {
    pub fn new(pool: SqlitePool, token: BearerToken, platform: PlatformClient) -> Self {
        Self {
            pool,
            token,
            platform,
        }
    }

    /// Restore the stored token and check it against `GET /user`. An invalid
    /// token is discarded. Returns the signed-in user, if any.
    pub async fn init(&self) -> Result<Option<User>> {
        let Some(stored) = db::get_state(&self.pool, db::KEY_TOKEN).await? else {
            info!("No stored session token");
            return Ok(None);
        };
        self.token.set(Some(stored)).await;

        match self.platform.current_user().await {
            Ok(user) => {
                info!("Session restored for user {}", user.id);
                Ok(Some(user))
            }
            Err(e) => {
                warn!("Stored session token rejected: {e}");
                self.clear().await?;
                Ok(None)
            }
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.get().await.is_some()
    }

    async fn store(&self, response: &AuthResponse) -> Result<()> {
        if let Some(token) = &response.token {
            db::set_state(&self.pool, db::KEY_TOKEN, token).await?;
            self.token.set(Some(token.clone())).await;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.token.set(None).await;
        db::clear_state(&self.pool, db::KEY_TOKEN).await
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<AuthResponse> {
        let response = self.platform.login(credentials).await?;
        self.store(&response).await?;
        Ok(response)
    }

    pub async fn register(&self, registration: &Registration) -> Result<AuthResponse> {
        let response = self.platform.register(registration).await?;
        self.store(&response).await?;
        Ok(response)
    }

    /// The token is dropped even when the remote logout fails.
    pub async fn logout(&self) -> Result<()> {
        if let Err(e) = self.platform.logout().await {
            warn!("Remote logout failed: {e}");
        }
        self.clear().await
    }

    pub async fn current_user(&self, page: &str) -> Result<User> {
        let result = self.platform.current_user().await;
        self.check(page, result).await
    }

    /// Apply the 401 rule to a remote result: on a private page the session
    /// ends and the caller is sent to the login page.
    pub async fn check<T>(&self, page: &str, result: Result<T>) -> Result<T> {
        match result {
            Err(GatewayError::Api { status: 401, .. })
                if !page.contains(LOGIN_ROUTE) && !is_public_route(page) =>
            {
                warn!("401 on private page {page}; clearing session");
                self.clear().await?;
                Err(GatewayError::Unauthorized {
                    redirect: LOGIN_ROUTE,
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use serde_json::json;

    async fn context(server: &mockito::ServerGuard) -> (SessionContext, BearerToken, SqlitePool) {
        let pool = db::test_pool().await;
        let token = BearerToken::default();
        let platform = PlatformClient::new(Client::new(), server.url(), token.clone());
        (
            SessionContext::new(pool.clone(), token.clone(), platform),
            token,
            pool,
        )
    }

    #[test]
    fn public_routes() {
        assert!(is_public_route("/"));
        assert!(is_public_route("/faq"));
        assert!(is_public_route("/campaign/clean-water"));
        assert!(is_public_route("/donate/clean-water"));
        assert!(is_public_route("/DonationsPage/clean-water"));
        assert!(!is_public_route("/dashboard"));
        assert!(!is_public_route("/withdraw"));
    }

    #[tokio::test]
    async fn login_stores_token_and_logout_clears_it() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/login")
            .with_body(json!({ "token": "t-1", "user": { "id": 1, "name": "Esi", "email": "esi@example.com" } }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/logout")
            .with_status(500)
            .create_async()
            .await;

        let (session, token, pool) = context(&server).await;
        session
            .login(&Credentials {
                email: "esi@example.com".to_string(),
                password: "pw".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(token.get().await.as_deref(), Some("t-1"));
        assert_eq!(
            db::get_state(&pool, db::KEY_TOKEN).await.unwrap().as_deref(),
            Some("t-1")
        );

        session.logout().await.unwrap();
        assert!(!session.is_authenticated().await);
        assert_eq!(db::get_state(&pool, db::KEY_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn init_discards_rejected_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user")
            .with_status(401)
            .create_async()
            .await;

        let (session, token, pool) = context(&server).await;
        db::set_state(&pool, db::KEY_TOKEN, "stale").await.unwrap();

        assert!(session.init().await.unwrap().is_none());
        assert_eq!(token.get().await, None);
        assert_eq!(db::get_state(&pool, db::KEY_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unauthorized_on_private_page_ends_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user")
            .with_status(401)
            .create_async()
            .await;

        let (session, token, _pool) = context(&server).await;
        token.set(Some("t-2".to_string())).await;

        let err = session.current_user("/campaign/clean-water").await.unwrap_err();
        assert!(matches!(err, GatewayError::Api { status: 401, .. }));
        assert!(session.is_authenticated().await);

        let err = session.current_user("/dashboard").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized { redirect: "/login" }));
        assert!(!session.is_authenticated().await);
    }
}
