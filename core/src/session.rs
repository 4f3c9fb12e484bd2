//! Per-client session state: cookie jar, cached tokens, login identity.

use std::collections::BTreeMap;

use cookie::time::OffsetDateTime;
use cookie::Cookie;
use tracing::warn;

use crate::config::MaxlagConfig;
use crate::http::HttpResponse;

/// Identity recorded after a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginInfo {
    pub user_id: u64,
    pub username: String,
    pub token: Option<String>,
    pub cookie_prefix: Option<String>,
    pub session_id: Option<String>,
}

/// Token families the API hands out through `meta=tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenKind {
    Csrf,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Csrf => "csrf",
        }
    }

    /// Key of this token inside `query.tokens`.
    pub fn response_key(self) -> &'static str {
        match self {
            TokenKind::Csrf => "csrftoken",
        }
    }
}

/// Cookies keyed by name. Attributes (path, expiry, domain) are dropped:
/// a client talks to one API endpoint.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Apply one `Set-Cookie` header value. A cookie with an empty value, a
    /// non-positive `Max-Age` or an `Expires` in the past is removed.
    pub fn apply_set_cookie(&mut self, header: &str) {
        let cookie = match Cookie::parse(header) {
            Ok(cookie) => cookie,
            Err(err) => {
                warn!(header, error = %err, "failed to parse Set-Cookie header");
                return;
            }
        };
        let expired = cookie.max_age().is_some_and(|age| !age.is_positive())
            || cookie
                .expires_datetime()
                .is_some_and(|at| at <= OffsetDateTime::now_utc());
        if cookie.value().is_empty() || expired {
            self.cookies.remove(cookie.name());
        } else {
            self.cookies
                .insert(cookie.name().to_string(), cookie.value().to_string());
        }
    }

    pub fn absorb(&mut self, response: &HttpResponse) {
        for header in response.header_values("set-cookie") {
            self.apply_set_cookie(header);
        }
    }

    /// Value for a `Cookie` request header, `None` when the jar is empty.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        Some(pairs.join("; "))
    }
}

/// Everything about a `Client` that changes between calls. Lives behind
/// the client's single mutex.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) maxlag: MaxlagConfig,
    pub(crate) cookies: CookieJar,
    pub(crate) tokens: BTreeMap<TokenKind, String>,
    pub(crate) login_token: Option<String>,
    pub(crate) login: Option<LoginInfo>,
}

impl SessionState {
    pub(crate) fn new(maxlag: MaxlagConfig) -> Self {
        Self {
            maxlag,
            ..Self::default()
        }
    }

    /// Seed `<prefix>_session` from a login response on servers that expect
    /// the client to set it.
    pub(crate) fn adopt_session_id(&mut self, cookie_prefix: &str, session_id: &str) {
        let name = format!("{cookie_prefix}_session");
        if self.cookies.get(&name).is_none() {
            self.cookies.insert(name, session_id);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.cookies.clear();
        self.tokens.clear();
        self.login_token = None;
        self.login = None;
    }
}
