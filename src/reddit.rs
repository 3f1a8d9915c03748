//! Reddit application-only OAuth.
//!
//! The bot authenticates with the client-credentials grant so yt-dlp can pull
//! media through `oauth.reddit.com`, which is far less aggressive about
//! blocking server traffic than the public site.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::{StatusCode, header};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::AuthError;

pub const REDDIT_BASE_URL: &str = "https://www.reddit.com/api/v1";
pub const REDDIT_DOMAIN: &str = "reddit.com";
pub const REDDIT_OAUTH_HOST: &str = "oauth.reddit.com";
pub const USER_AGENT: &str = "reddit-save-bot";

/// Source of "now" for expiry checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A bearer token together with the instant it stops being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    token_type: String,
    expires_in: i64,
    #[serde(default)]
    scope: String,
}

/// Anything that can hand the pipeline a Reddit bearer token.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self, cancel: &CancellationToken) -> Result<String, AuthError>;
}

/// Client-credentials token provider with a single cached token.
///
/// Reads go through a short `parking_lot` lock. Refreshes are serialized by an
/// async gate so a burst of requests arriving with an expired token results in
/// one exchange, not one per request.
pub struct TokenProvider {
    client_id: String,
    client_secret: String,
    base_url: String,
    http: reqwest::Client,
    clock: Clock,
    cached: Mutex<Option<AuthorizationToken>>,
    refresh: tokio::sync::Mutex<()>,
}

impl TokenProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            base_url: REDDIT_BASE_URL.to_string(),
            http,
            clock: Arc::new(Utc::now),
            cached: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the cached token while it is valid, otherwise performs a fresh
    /// exchange and replaces the cache slot.
    pub async fn get_token(&self, cancel: &CancellationToken) -> Result<String, AuthError> {
        self.check_credentials()?;

        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            gate = self.refresh.lock() => gate,
        };

        // Someone else may have refreshed while we waited on the gate.
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        if self.cached.lock().is_some() {
            info!("Refreshing Reddit access token");
        } else {
            info!("Fetching Reddit access token");
        }

        let grant = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            grant = self.exchange() => grant?,
        };

        let now = (self.clock)();
        let lifetime = TimeDelta::try_seconds(grant.expires_in).unwrap_or(TimeDelta::zero());
        let expires_at = now
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(
            token_type = %grant.token_type,
            scope = %grant.scope,
            expires_in = grant.expires_in,
            "Obtained Reddit access token"
        );

        *self.cached.lock() = Some(AuthorizationToken {
            token: grant.access_token.clone(),
            expires_at,
        });

        Ok(grant.access_token)
    }

    fn check_credentials(&self) -> Result<(), AuthError> {
        let mut missing = Vec::new();
        if self.client_id.is_empty() {
            missing.push("clientID");
        }
        if self.client_secret.is_empty() {
            missing.push("clientSecret");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AuthError::Configuration { missing })
        }
    }

    fn cached_token(&self) -> Option<String> {
        let now = (self.clock)();
        self.cached
            .lock()
            .as_ref()
            .filter(|token| token.is_valid_at(now))
            .map(|token| token.token.clone())
    }

    async fn exchange(&self) -> Result<TokenGrant, AuthError> {
        let response = self
            .http
            .post(format!("{}/access_token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(header::USER_AGENT, USER_AGENT)
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(AuthError::Network)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AuthError::Upstream {
                status: status.as_u16(),
            });
        }

        response.json::<TokenGrant>().await.map_err(|err| {
            if err.is_decode() {
                AuthError::Protocol(err)
            } else {
                AuthError::Network(err)
            }
        })
    }
}

#[async_trait]
impl AccessTokenSource for TokenProvider {
    async fn access_token(&self, cancel: &CancellationToken) -> Result<String, AuthError> {
        self.get_token(cancel).await
    }
}

/// True when the link points somewhere on Reddit.
pub fn is_reddit_url(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| host.contains(REDDIT_DOMAIN))
}

/// Points the link at the OAuth host when we hold a token. Without one the
/// original host is kept and the download is attempted anonymously.
pub fn authenticated_url(url: &Url, token: &str) -> Url {
    let mut rewritten = url.clone();
    if token.is_empty() || rewritten.set_host(Some(REDDIT_OAUTH_HOST)).is_err() {
        return url.clone();
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const GRANT: &str =
        r#"{"access_token":"tok-1","token_type":"bearer","expires_in":3600,"scope":"*"}"#;

    fn fixed_clock(start: DateTime<Utc>) -> (Arc<Mutex<DateTime<Utc>>>, Clock) {
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock());
        (now, clock)
    }

    fn provider(server: &mockito::Server) -> TokenProvider {
        TokenProvider::new("id", "secret", reqwest::Client::new()).with_base_url(server.url())
    }

    #[tokio::test]
    async fn cached_token_skips_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/access_token")
            .match_header("authorization", "Basic aWQ6c2VjcmV0")
            .match_header("user-agent", USER_AGENT)
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "client_credentials".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(GRANT)
            .expect(1)
            .create_async()
            .await;

        let provider = provider(&server);
        let cancel = CancellationToken::new();
        assert_eq!(provider.get_token(&cancel).await.unwrap(), "tok-1");
        assert_eq!(provider.get_token(&cancel).await.unwrap(), "tok-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn token_is_refreshed_at_expiry_instant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/access_token")
            .with_status(200)
            .with_body(GRANT)
            .expect(2)
            .create_async()
            .await;

        let start = Utc::now();
        let (now, clock) = fixed_clock(start);
        let provider = provider(&server).with_clock(clock);
        let cancel = CancellationToken::new();

        provider.get_token(&cancel).await.unwrap();
        *now.lock() = start + TimeDelta::seconds(3599);
        provider.get_token(&cancel).await.unwrap();
        *now.lock() = start + TimeDelta::seconds(3600);
        provider.get_token(&cancel).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/access_token")
            .with_status(200)
            .with_body(GRANT)
            .expect(1)
            .create_async()
            .await;

        let provider = provider(&server);
        let cancel = CancellationToken::new();
        let (a, b, c) = tokio::join!(
            provider.get_token(&cancel),
            provider.get_token(&cancel),
            provider.get_token(&cancel)
        );
        assert_eq!(a.unwrap(), "tok-1");
        assert_eq!(b.unwrap(), "tok-1");
        assert_eq!(c.unwrap(), "tok-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_credentials_are_reported_without_request() {
        let provider = TokenProvider::new("", "", reqwest::Client::new())
            .with_base_url("http://127.0.0.1:9");
        let err = provider
            .get_token(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AuthError::Configuration { missing } => {
                assert_eq!(missing, vec!["clientID", "clientSecret"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/access_token")
            .with_status(401)
            .create_async()
            .await;

        let err = provider(&server)
            .get_token(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Upstream { status: 401 }));
    }

    #[tokio::test]
    async fn garbage_body_is_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/access_token")
            .with_status(200)
            .with_body("<html>nope</html>")
            .create_async()
            .await;

        let err = provider(&server)
            .get_token(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let provider = TokenProvider::new("id", "secret", reqwest::Client::new())
            .with_base_url("http://127.0.0.1:9");
        let err = provider
            .get_token(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
    }

    #[tokio::test]
    async fn cancelled_request_gives_up() {
        let server = mockito::Server::new_async().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider(&server).get_token(&cancel).await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[test]
    fn rewrites_host_only_with_token() {
        let url = Url::parse("https://www.reddit.com/r/x/comments/abc/video/").unwrap();
        assert_eq!(
            authenticated_url(&url, "tok").as_str(),
            "https://oauth.reddit.com/r/x/comments/abc/video/"
        );
        assert_eq!(authenticated_url(&url, ""), url);
    }

    #[test]
    fn recognises_reddit_hosts() {
        assert!(is_reddit_url(&Url::parse("https://reddit.com/r/x/video123").unwrap()));
        assert!(is_reddit_url(&Url::parse("https://old.reddit.com/r/x").unwrap()));
        assert!(!is_reddit_url(&Url::parse("https://example.com/cats").unwrap()));
        assert!(!is_reddit_url(&Url::parse("mailto:someone@example.com").unwrap()));
    }
}
