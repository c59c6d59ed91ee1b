//! Session gating for page requests.
//!
//! Every request that survives the [`RouteMatcher`] exclusion list goes through
//! [`guard`]: the identity provider resolves the user from the cookie jar, and
//! protected paths without a user are redirected to the sign-in page. Cookies
//! the provider writes (refreshed tokens) are mirrored onto the inbound request
//! and the outbound response.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use regex::Regex;

pub mod cookies;
pub mod provider;

use cookies::CookieJar;
use provider::{IdentityProvider, User};

pub const PROTECTED_PREFIXES: [&str; 2] = ["/protected", "/chat"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Protected,
    Public,
}

pub fn classify(path: &str) -> RouteClass {
    if PROTECTED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        RouteClass::Protected
    } else {
        RouteClass::Public
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MatcherVariant {
    Basic,
    #[default]
    Full,
}

const BASIC_EXCLUSIONS: &str =
    r"_next/static|_next/image|favicon\.ico|robots\.txt|.*\.(?:svg|png|jpg|jpeg|gif|webp)$";
const FULL_EXCLUSIONS: &str = r"api(?:/|$)|fonts/|sitemap\.xml|\.well-known/";

/// Decides which paths the guard runs for. Excluded paths skip it entirely.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    excluded: Regex,
}

impl RouteMatcher {
    pub fn new(variant: MatcherVariant) -> Result<Self, regex::Error> {
        let alternatives = match variant {
            MatcherVariant::Basic => BASIC_EXCLUSIONS.to_string(),
            MatcherVariant::Full => format!("{}|{}", BASIC_EXCLUSIONS, FULL_EXCLUSIONS),
        };
        let excluded = Regex::new(&format!("^/(?:{})", alternatives))?;
        Ok(Self { excluded })
    }

    pub fn applies(&self, path: &str) -> bool {
        !self.excluded.is_match(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Pass(Option<User>),
    Redirect(String),
}

/// Provider failures count as "no session": protected paths redirect, public
/// paths pass through.
pub async fn guard(
    provider: &dyn IdentityProvider,
    path: &str,
    jar: &mut CookieJar,
    sign_in_path: &str,
) -> GuardOutcome {
    let user = match provider.current_user(jar).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(path, error = %e, "identity provider failed, treating as signed out");
            None
        }
    };
    match (classify(path), user) {
        (RouteClass::Protected, None) => {
            tracing::debug!(path, "redirecting unauthenticated request");
            GuardOutcome::Redirect(sign_in_path.to_string())
        }
        (_, user) => GuardOutcome::Pass(user),
    }
}

#[derive(Clone)]
pub struct Gate {
    pub provider: Arc<dyn IdentityProvider>,
    pub matcher: RouteMatcher,
    pub sign_in_path: String,
}

pub async fn session_gate(State(gate): State<Gate>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_owned();
    if !gate.matcher.applies(&path) {
        return next.run(req).await;
    }
    let mut jar = CookieJar::from_headers(req.headers());
    let outcome = guard(gate.provider.as_ref(), &path, &mut jar, &gate.sign_in_path).await;
    if !jar.pending().is_empty() {
        tracing::debug!(path = %path, cookies = jar.pending().len(), "session cookies updated");
    }
    jar.write_request_headers(req.headers_mut());
    let mut resp = match outcome {
        GuardOutcome::Redirect(to) => Redirect::temporary(&to).into_response(),
        GuardOutcome::Pass(user) => {
            if let Some(user) = user {
                req.extensions_mut().insert(user);
            }
            next.run(req).await
        }
    };
    jar.write_response_headers(resp.headers_mut());
    resp
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::routing::get;
    use axum::{Router, middleware};
    use testing::StubProvider;
    use tower::ServiceExt;

    fn app(provider: Arc<StubProvider>, variant: MatcherVariant) -> Router {
        let gate = Gate {
            provider,
            matcher: RouteMatcher::new(variant).unwrap(),
            sign_in_path: "/sign-in".into(),
        };
        async fn echo_cookie(headers: HeaderMap) -> String {
            headers
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        }
        Router::new()
            .route("/", get(echo_cookie))
            .route("/chat/:id", get(echo_cookie))
            .route("/protected", get(echo_cookie))
            .route("/api/healthz", get(echo_cookie))
            .route("/favicon.ico", get(echo_cookie))
            .layer(middleware::from_fn_with_state(gate, session_gate))
    }

    fn request(path: &str, cookie: Option<&str>) -> Request {
        let mut b = axum::http::Request::builder().uri(path);
        if let Some(c) = cookie {
            b = b.header(header::COOKIE, c);
        }
        b.body(Body::empty()).unwrap()
    }

    #[test]
    fn classifies_protected_prefixes() {
        assert_eq!(classify("/chat"), RouteClass::Protected);
        assert_eq!(classify("/chat/123"), RouteClass::Protected);
        assert_eq!(classify("/protected/settings"), RouteClass::Protected);
        assert_eq!(classify("/"), RouteClass::Public);
        assert_eq!(classify("/sign-in"), RouteClass::Public);
        assert_eq!(classify("/about/chat"), RouteClass::Public);
    }

    #[test]
    fn matcher_excludes_static_and_well_known_paths() {
        let full = RouteMatcher::new(MatcherVariant::Full).unwrap();
        let excluded = [
            "/_next/static/app.js",
            "/_next/image",
            "/favicon.ico",
            "/robots.txt",
            "/img/logo.png",
            "/api/chat",
            "/api",
            "/fonts/inter.woff2",
            "/sitemap.xml",
            "/.well-known/security.txt",
        ];
        for p in excluded {
            assert!(!full.applies(p), "{} should be excluded", p);
        }
        for p in ["/", "/chat/1", "/protected", "/apiary", "/sign-in"] {
            assert!(full.applies(p), "{} should be guarded", p);
        }

        let basic = RouteMatcher::new(MatcherVariant::Basic).unwrap();
        assert!(!basic.applies("/favicon.ico"));
        assert!(basic.applies("/api/chat"));
        assert!(basic.applies("/fonts/inter.woff2"));
    }

    #[tokio::test]
    async fn unauthenticated_protected_request_redirects_to_sign_in() {
        let provider = Arc::new(StubProvider::default());
        for path in ["/chat/abc", "/protected"] {
            let resp = app(provider.clone(), MatcherVariant::Full)
                .oneshot(request(path, None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
            assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/sign-in");
        }
    }

    #[tokio::test]
    async fn authenticated_protected_request_passes() {
        let provider = Arc::new(StubProvider::default());
        let resp = app(provider, MatcherVariant::Full)
            .oneshot(request("/chat/abc", Some("session=ok")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn excluded_paths_never_call_the_provider() {
        let provider = Arc::new(StubProvider::default());
        for path in ["/api/healthz", "/favicon.ico"] {
            let resp = app(provider.clone(), MatcherVariant::Full)
                .oneshot(request(path, None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn provider_failure_fails_closed_for_protected_and_open_for_public() {
        let provider = Arc::new(StubProvider::default());
        let resp = app(provider.clone(), MatcherVariant::Full)
            .oneshot(request("/chat/1", Some("session=boom")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        let resp = app(provider, MatcherVariant::Full)
            .oneshot(request("/", Some("session=boom")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn refreshed_cookies_reach_handler_and_response() {
        let provider = Arc::new(StubProvider::default());
        let resp = app(provider, MatcherVariant::Full)
            .oneshot(request("/chat/1", Some("session=stale; theme=dark")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(set_cookie.starts_with("session=ok;"));
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        let seen = String::from_utf8(body.to_vec()).unwrap();
        assert!(seen.contains("session=ok"));
        assert!(seen.contains("theme=dark"));
    }
}
