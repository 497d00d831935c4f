//! Authentication gate applied to every route.
//!
//! Three policies are supported: `none`, HTTP Basic with constant-time
//! credential comparison, and bearer tokens looked up in a [`TokenStore`].
//! Tokens arrive either as a query parameter (moved into a cookie and
//! stripped from the URL by redirect) or as that cookie.

pub mod tokens;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;
use crate::state::SharedState;

pub use self::tokens::TokenStore;

const HSTS_VALUE: &str = "max-age=31536000";
const BASIC_CHALLENGE: &str = r#"Basic realm="restricted", charset="UTF-8""#;

enum Policy {
    None,
    Basic {
        user: String,
        password: SecretString,
    },
    Token {
        store: Arc<TokenStore>,
        name: String,
    },
}

/// Decides whether a request may proceed.
pub struct AuthGate {
    policy: Policy,
    state: Arc<SharedState>,
}

impl AuthGate {
    pub fn new(config: &AuthConfig, state: Arc<SharedState>) -> Self {
        let policy = match config {
            AuthConfig::None => Policy::None,
            AuthConfig::Basic { user, password } => Policy::Basic {
                user: user.clone(),
                password: password.clone(),
            },
            AuthConfig::Token { dir, name } => Policy::Token {
                store: Arc::new(TokenStore::new(dir.clone())),
                name: name.clone(),
            },
        };
        Self { policy, state }
    }

    /// Token gate over an existing store.
    pub fn with_token_store(store: Arc<TokenStore>, name: &str, state: Arc<SharedState>) -> Self {
        Self {
            policy: Policy::Token {
                store,
                name: name.to_string(),
            },
            state,
        }
    }

    /// The backing store when the token policy is active.
    pub fn token_store(&self) -> Option<Arc<TokenStore>> {
        match &self.policy {
            Policy::Token { store, .. } => Some(store.clone()),
            _ => None,
        }
    }

    /// Check a request. `Err` carries the response to send instead.
    ///
    /// On success the activity clock is bumped from a detached task so the
    /// response is never delayed by it.
    pub fn check(&self, parts: &Parts) -> Result<(), Response> {
        match &self.policy {
            Policy::None => {}
            Policy::Basic { user, password } => check_basic(&parts.headers, user, password)?,
            Policy::Token { store, name } => check_token(parts, store, name)?,
        }
        let state = self.state.clone();
        tokio::spawn(async move { state.activity.touch() });
        Ok(())
    }
}

fn check_basic(headers: &HeaderMap, user: &str, password: &SecretString) -> Result<(), Response> {
    let Some((given_user, given_pass)) = basic_credentials(headers) else {
        return Err(basic_challenge());
    };
    let user_ok = given_user.as_bytes().ct_eq(user.as_bytes());
    let pass_ok = given_pass
        .as_bytes()
        .ct_eq(password.expose_secret().as_bytes());
    if bool::from(user_ok & pass_ok) {
        Ok(())
    } else {
        Err(basic_challenge())
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn basic_challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, BASIC_CHALLENGE)],
        "Unauthorized",
    )
        .into_response()
}

fn check_token(parts: &Parts, store: &TokenStore, name: &str) -> Result<(), Response> {
    if let Some(token) = query_token(parts, name) {
        return Err(cookie_redirect(parts, name, &token));
    }
    let Some(token) = cookie_value(&parts.headers, name) else {
        return Err(token_form(name));
    };
    if token.is_empty() || !store.contains(&token) {
        tracing::debug!(path = %parts.uri.path(), "Rejected unknown token");
        return Err(token_form(name));
    }
    Ok(())
}

fn query_token(parts: &Parts, name: &str) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Move the token into a cookie and redirect to the same URL without it.
fn cookie_redirect(parts: &Parts, name: &str, token: &str) -> Response {
    if !is_cookie_safe(token) {
        return token_form(name);
    }
    let remaining: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .filter(|(key, _)| key != name)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    let mut location = parts.uri.path().to_string();
    if !remaining.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(remaining)
            .finish();
        location.push('?');
        location.push_str(&query);
    }

    let cookie = format!("{name}={token}; Path=/");
    let (Ok(cookie), Ok(location)) = (
        HeaderValue::from_str(&cookie),
        HeaderValue::from_str(&location),
    ) else {
        return token_form(name);
    };
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    response.headers_mut().insert(header::LOCATION, location);
    response
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

// RFC 6265 cookie-octet
fn is_cookie_safe(value: &str) -> bool {
    value.bytes().all(|b| {
        matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
    })
}

fn token_form(name: &str) -> Response {
    let body = format!(
        r#"<html><head><title>authenticate</title></head><body><form>Authentication Token: <input type=text name="{name}"><input type=Submit name="Login" value="Login"></form></body></html>"#
    );
    (StatusCode::UNAUTHORIZED, Html(body)).into_response()
}

/// Axum middleware running the gate and stamping HSTS on every response.
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let mut response = match gate.check(&parts) {
        Ok(()) => next.run(Request::from_parts(parts, body)).await,
        Err(response) => response,
    };
    response.headers_mut().insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static(HSTS_VALUE),
    );
    response
}
