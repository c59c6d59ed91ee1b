use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::cookies::{CookieJar, SetCookie};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity provider returned {0}")]
    Status(StatusCode),
}

/// Resolves the signed-in user from a request's cookies. Implementations may
/// refresh the session and write new token cookies into the jar.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self, jar: &mut CookieJar) -> Result<Option<User>, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenPair {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Talks to a Supabase-style REST auth API.
#[derive(Clone)]
pub struct HttpIdentityProvider {
    pub base_url: String,
    pub anon_key: Option<String>,
    pub cookie_prefix: String,
    client: reqwest::Client,
}

impl HttpIdentityProvider {
    pub fn new(
        base_url: impl Into<String>,
        anon_key: Option<String>,
        cookie_prefix: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key,
            cookie_prefix: cookie_prefix.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn access_cookie(&self) -> String {
        format!("{}-access-token", self.cookie_prefix)
    }

    pub fn refresh_cookie(&self) -> String {
        format!("{}-refresh-token", self.cookie_prefix)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn with_key(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.anon_key {
            Some(key) => rb.header("apikey", key),
            None => rb,
        }
    }

    async fn fetch_user(&self, access_token: &str) -> Result<Option<User>, AuthError> {
        let rb = self.client.get(self.url("/auth/v1/user")).bearer_auth(access_token);
        let resp = self.with_key(rb).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(Some(resp.json::<User>().await?)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            s => Err(AuthError::Status(s)),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Option<TokenPair>, AuthError> {
        let rb = self
            .client
            .post(self.url("/auth/v1/token?grant_type=refresh_token"))
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        let resp = self.with_key(rb).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(Some(resp.json::<TokenPair>().await?)),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => Ok(None),
            s => Err(AuthError::Status(s)),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn current_user(&self, jar: &mut CookieJar) -> Result<Option<User>, AuthError> {
        let token = |name: String| {
            jar.get(&name)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        let access = token(self.access_cookie());
        let refresh = token(self.refresh_cookie());

        if let Some(access) = &access {
            if let Some(user) = self.fetch_user(access).await? {
                return Ok(Some(user));
            }
        }
        let Some(refresh) = refresh else {
            return Ok(None);
        };

        match self.refresh(&refresh).await? {
            Some(pair) => {
                tracing::debug!("session tokens refreshed");
                let mut access_cookie =
                    SetCookie::new(self.access_cookie(), pair.access_token.clone());
                access_cookie.max_age = pair.expires_in;
                jar.set(access_cookie);
                jar.set(SetCookie::new(self.refresh_cookie(), pair.refresh_token));
                self.fetch_user(&pair.access_token).await
            }
            None => {
                jar.set(SetCookie::removal(self.access_cookie()));
                jar.set(SetCookie::removal(self.refresh_cookie()));
                Ok(None)
            }
        }
    }
}
