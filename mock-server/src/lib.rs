use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "mockwiki_session";
pub const COOKIE_PREFIX: &str = "mockwiki";

/// One request as the server saw it.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub params: HashMap<String, String>,
    pub cookie: Option<String>,
}

#[derive(Debug)]
struct Inner {
    users: HashMap<String, String>,
    login_token: String,
    csrf_token: String,
    session_id: String,
    /// Responses still to be answered with lag headers.
    lagged_responses: usize,
    retry_after: u64,
    requests: Vec<RecordedRequest>,
}

/// Shared state of a mock wiki. Cloning yields another handle to the same
/// wiki, so tests keep one to inspect what the router recorded.
#[derive(Clone, Debug)]
pub struct MockWiki {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockWiki {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWiki {
    pub fn new() -> Self {
        let inner = Inner {
            users: HashMap::new(),
            login_token: Uuid::new_v4().simple().to_string(),
            csrf_token: format!("{}+\\", Uuid::new_v4().simple()),
            session_id: Uuid::new_v4().simple().to_string(),
            lagged_responses: 0,
            retry_after: 1,
            requests: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn with_user(self, name: &str, password: &str) -> Self {
        self.lock()
            .users
            .insert(name.to_string(), password.to_string());
        self
    }

    /// Answer the next `responses` requests carrying `maxlag` with
    /// `X-Database-Lag` and `Retry-After: <retry_after>`.
    pub fn with_lag(self, responses: usize, retry_after: u64) -> Self {
        {
            let mut inner = self.lock();
            inner.lagged_responses = responses;
            inner.retry_after = retry_after;
        }
        self
    }

    pub fn login_token(&self) -> String {
        self.lock().login_token.clone()
    }

    pub fn csrf_token(&self) -> String {
        self.lock().csrf_token.clone()
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn app(wiki: MockWiki) -> Router {
    Router::new()
        .route("/api.php", get(api).post(api))
        .with_state(wiki)
}

pub async fn run(listener: TcpListener, wiki: MockWiki) -> Result<(), std::io::Error> {
    axum::serve(listener, app(wiki)).await
}

/// Serve `wiki` on a random local port from a background thread with its
/// own runtime. Returns the API URL.
pub fn spawn(wiki: MockWiki) -> Result<String, std::io::Error> {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr: SocketAddr = std_listener.local_addr()?;
    std_listener.set_nonblocking(true)?;

    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e, "mock wiki runtime failed to start");
                return;
            }
        };
        let served = rt.block_on(async move {
            let listener = TcpListener::from_std(std_listener)?;
            run(listener, wiki).await
        });
        if let Err(e) = served {
            tracing::error!(error = %e, "mock wiki stopped");
        }
    });

    Ok(format!("http://{addr}/api.php"))
}

async fn api(
    State(wiki): State<MockWiki>,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let has_session = cookie
        .as_deref()
        .is_some_and(|c| c.contains(&format!("{SESSION_COOKIE}=")));

    let mut inner = wiki.lock();
    inner.requests.push(RecordedRequest {
        params: params.clone(),
        cookie,
    });
    tracing::debug!(action = params.get("action").map(String::as_str).unwrap_or(""), "api request");

    let mut response = if params.contains_key("maxlag") && inner.lagged_responses > 0 {
        inner.lagged_responses -= 1;
        let retry_after = inner.retry_after.to_string();
        let mut response = Json(json!({
            "error": {"code": "maxlag", "info": "Waiting for db1: 10 seconds lagged"}
        }))
        .into_response();
        let headers = response.headers_mut();
        headers.insert("x-database-lag", HeaderValue::from_static("10"));
        if let Ok(value) = HeaderValue::from_str(&retry_after) {
            headers.insert(header::RETRY_AFTER, value);
        }
        response
    } else {
        Json(dispatch(&inner, &params)).into_response()
    };

    if !has_session {
        let cookie = format!("{SESSION_COOKIE}={}; path=/; HttpOnly", inner.session_id);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

fn dispatch(inner: &Inner, params: &HashMap<String, String>) -> Value {
    let param = |key: &str| params.get(key).map(String::as_str).unwrap_or("");
    match param("action") {
        "login" => login(inner, param("lgname"), param("lgpassword"), param("lgtoken")),
        "query" if param("meta") == "tokens" => {
            json!({"batchcomplete": "", "query": {"tokens": {"csrftoken": inner.csrf_token}}})
        }
        "query" if param("meta") == "siteinfo" => {
            json!({"batchcomplete": "", "query": {"general": {"sitename": "Mock Wiki", "lang": "en"}}})
        }
        "edit" if param("token") != inner.csrf_token => {
            json!({"error": {"code": "badtoken", "info": "Invalid CSRF token."}})
        }
        "edit" => json!({"edit": {"result": "Success", "title": param("title")}}),
        "logout" => json!({}),
        other => json!({
            "error": {"code": "badvalue", "info": format!("Unrecognized value for parameter \"action\": {other}.")}
        }),
    }
}

/// Legacy two-round login: round one hands out a token, round two checks
/// token, password and user in that order.
fn login(inner: &Inner, name: &str, password: &str, token: &str) -> Value {
    if name.is_empty() {
        return json!({"login": {"result": "NoName"}});
    }
    if token.is_empty() {
        return json!({"login": {
            "result": "NeedToken",
            "token": inner.login_token,
            "cookieprefix": COOKIE_PREFIX,
            "sessionid": inner.session_id,
        }});
    }
    if token != inner.login_token {
        return json!({"login": {"result": "WrongToken"}});
    }
    if password.is_empty() {
        return json!({"login": {"result": "EmptyPass"}});
    }
    match inner.users.get(name) {
        Some(expected) if expected == password => json!({"login": {
            "result": "Success",
            "lguserid": 1,
            "lgusername": name,
            "lgtoken": inner.login_token,
            "cookieprefix": COOKIE_PREFIX,
            "sessionid": inner.session_id,
        }}),
        Some(_) => json!({"login": {"result": "WrongPass"}}),
        None => json!({"login": {"result": "NotExists"}}),
    }
}
