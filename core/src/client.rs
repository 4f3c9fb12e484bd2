//! Request executor for the wiki API.
//!
//! # Design
//! `Client` owns the API URL, its configuration, a `Transport`, and one
//! mutex around everything that changes between calls (maxlag settings,
//! cookie jar, cached tokens, login identity). The mutex is taken only to
//! read or update that state and is never held across a transport call or
//! a retry sleep, so concurrent callers serialize on state, not on the
//! network.
//!
//! Every call goes through `execute`:
//! 1. set `format=json`, drop any caller-supplied `maxlag`, inject a CSRF
//!    token when asked, inject `maxlag` when enabled;
//! 2. send through the transport with the current cookies;
//! 3. with maxlag enabled, a response carrying both `X-Database-Lag` and
//!    `Retry-After` is "busy": sleep after every busy reply, resend until the
//!    attempt budget is spent, then fail with `Error::ApiBusy`;
//! 4. otherwise parse the body, turning a top-level `error` object into
//!    `Error::Api`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ClientConfig, MaxlagConfig};
use crate::error::{ApiError, Error, ResultCode};
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Transport, UreqTransport};
use crate::params::Params;
use crate::session::{LoginInfo, SessionState, TokenKind};

pub const LAG_HEADER: &str = "X-Database-Lag";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Error codes from the general API that this client knows by name.
const KNOWN_API_ERRORS: &[&str] = &[
    "maxlag",
    "badtoken",
    "notoken",
    "readonly",
    "ratelimited",
    "assertuserfailed",
    "assertbotfailed",
    "mustbeloggedin",
    "permissiondenied",
    "badvalue",
    "unknown_action",
];

/// Blocking client for one wiki API endpoint.
pub struct Client {
    api_url: Url,
    config: ClientConfig,
    transport: Box<dyn Transport>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("api_url", &self.api_url.as_str())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Client with default settings and the given `User-Agent`.
    pub fn new(api_url: &str, user_agent: &str) -> Result<Self, Error> {
        let config = ClientConfig {
            user_agent: user_agent.to_string(),
            ..ClientConfig::default()
        };
        Self::with_config(api_url, config)
    }

    pub fn with_config(api_url: &str, config: ClientConfig) -> Result<Self, Error> {
        let transport = UreqTransport::new(config.timeout());
        Self::with_transport(api_url, config, transport)
    }

    pub fn with_transport(
        api_url: &str,
        config: ClientConfig,
        transport: impl Transport + 'static,
    ) -> Result<Self, Error> {
        let parsed = Url::parse(api_url).map_err(|e| Error::InvalidUrl {
            url: api_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl {
                url: api_url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        Ok(Self {
            api_url: parsed,
            state: Mutex::new(SessionState::new(config.maxlag.clone())),
            config,
            transport: Box::new(transport),
        })
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_str()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn maxlag(&self) -> MaxlagConfig {
        self.lock().maxlag.clone()
    }

    /// Applies to every call issued after this returns.
    pub fn set_maxlag(&self, maxlag: MaxlagConfig) {
        self.lock().maxlag = maxlag;
    }

    pub fn update_maxlag(&self, f: impl FnOnce(&mut MaxlagConfig)) {
        f(&mut self.lock().maxlag);
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.lock().cookies.get(name).map(str::to_string)
    }

    pub fn login_info(&self) -> Option<LoginInfo> {
        self.lock().login.clone()
    }

    /// Last login token issued by the server, usable with
    /// `login_with_token`.
    pub fn login_token(&self) -> Option<String> {
        self.lock().login_token.clone()
    }

    /// POST `params`, injecting a CSRF token first when `requires_token`.
    pub fn call(&self, params: &Params, requires_token: bool) -> Result<Value, Error> {
        self.execute(HttpMethod::Post, params, requires_token)
    }

    pub fn get(&self, params: &Params) -> Result<Value, Error> {
        self.execute(HttpMethod::Get, params, false)
    }

    pub fn post(&self, params: &Params) -> Result<Value, Error> {
        self.execute(HttpMethod::Post, params, false)
    }

    /// Token of `kind`, fetched once and cached for the session.
    pub fn token(&self, kind: TokenKind) -> Result<String, Error> {
        if let Some(token) = self.lock().tokens.get(&kind) {
            return Ok(token.clone());
        }

        let params = Params::from([("action", "query"), ("meta", "tokens"), ("type", kind.as_str())]);
        let response = self.execute(HttpMethod::Get, &params, false)?;
        let token = response
            .pointer(&format!("/query/tokens/{}", kind.response_key()))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::MalformedResponse(format!("no {} in token response", kind.response_key()))
            })?
            .to_string();

        self.lock().tokens.insert(kind, token.clone());
        Ok(token)
    }

    /// End the server session and forget cookies, tokens and identity.
    pub fn logout(&self) -> Result<(), Error> {
        self.call(&Params::from([("action", "logout")]), true)?;
        self.lock().reset();
        info!("logged out");
        Ok(())
    }

    fn execute(
        &self,
        method: HttpMethod,
        params: &Params,
        requires_token: bool,
    ) -> Result<Value, Error> {
        let mut params = params.clone();
        if params.remove("maxlag").is_some() {
            warn!("discarding caller-supplied maxlag parameter");
        }
        params.set("format", "json");
        if requires_token && !params.contains("token") {
            let token = self.token(TokenKind::Csrf)?;
            params.set("token", token);
        }

        let maxlag = self.maxlag();
        if maxlag.on {
            params.set("maxlag", maxlag.threshold_secs.to_string());
        }

        let deadline = self
            .config
            .call_deadline()
            .and_then(|d| Instant::now().checked_add(d));
        let max_attempts = maxlag.retries.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let response = self.send(method, &params)?;

            if maxlag.on {
                if let Some((lag, retry_after)) = busy_signal(&response) {
                    let exhausted = attempt >= max_attempts;
                    let delay = maxlag.delay(attempt, retry_after);
                    if passes_deadline(deadline, delay) {
                        warn!(attempts = attempt, ?delay, "retry would pass call deadline");
                        return Err(if exhausted {
                            Error::ApiBusy { attempts: attempt }
                        } else {
                            Error::DeadlineExceeded { attempts: attempt }
                        });
                    }
                    info!(attempt, lag, ?delay, "server lagged, waiting");
                    thread::sleep(delay);
                    if exhausted {
                        warn!(attempts = attempt, lag, "server still lagged, giving up");
                        return Err(Error::ApiBusy { attempts: attempt });
                    }
                    continue;
                }
            }

            let result = parse_body(&response);
            if let Err(Error::Api(err)) = &result {
                if err.code == "badtoken" {
                    self.lock().tokens.clear();
                }
            }
            return result;
        }
    }

    fn send(&self, method: HttpMethod, params: &Params) -> Result<HttpResponse, Error> {
        let mut headers = vec![("user-agent".to_string(), self.config.user_agent.clone())];
        let cookie = self.lock().cookies.header_value();
        if let Some(cookie) = cookie {
            headers.push(("cookie".to_string(), cookie));
        }

        let request = match method {
            HttpMethod::Get => {
                let mut url = self.api_url.clone();
                url.query_pairs_mut().extend_pairs(params.iter());
                HttpRequest {
                    method,
                    url: url.to_string(),
                    headers,
                    body: None,
                }
            }
            HttpMethod::Post => {
                headers.push((
                    "content-type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ));
                HttpRequest {
                    method,
                    url: self.api_url.to_string(),
                    headers,
                    body: Some(params.encode()),
                }
            }
        };

        debug!(?method, action = params.get("action").unwrap_or(""), "sending API request");
        let response = self.transport.execute(&request)?;
        self.lock().cookies.absorb(&response);
        Ok(response)
    }
}

/// `(lag, retry_after)` when the response carries both busy headers.
fn busy_signal(response: &HttpResponse) -> Option<(&str, &str)> {
    let lag = response.header(LAG_HEADER)?;
    let retry_after = response.header(RETRY_AFTER_HEADER)?;
    Some((lag, retry_after))
}

/// Whether sleeping `delay` from now would end past `deadline`. A wait too
/// long to represent as an `Instant` always does.
fn passes_deadline(deadline: Option<Instant>, delay: Duration) -> bool {
    deadline.is_some_and(|deadline| {
        Instant::now()
            .checked_add(delay)
            .map_or(true, |end| end > deadline)
    })
}

fn parse_body(response: &HttpResponse) -> Result<Value, Error> {
    let value: Value = serde_json::from_str(&response.body)
        .map_err(|e| Error::MalformedResponse(format!("HTTP {}: {e}", response.status)))?;
    if !value.is_object() {
        return Err(Error::MalformedResponse(format!(
            "HTTP {}: expected a JSON object",
            response.status
        )));
    }

    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_str).unwrap_or("");
        let code = ResultCode::new(code, KNOWN_API_ERRORS.contains(&code)).ok_or_else(|| {
            Error::MalformedResponse("error object without a code".to_string())
        })?;
        let message = error.get("info").and_then(Value::as_str).map(str::to_string);
        return Err(Error::Api(ApiError::new(code, message)));
    }

    if let Some(warnings) = value.get("warnings") {
        warn!(%warnings, "API returned warnings");
    }
    Ok(value)
}
