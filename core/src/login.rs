//! Two-round login handshake.
//!
//! # Design
//! `LoginSession` is an explicit state machine:
//!
//! ```text
//! Start ──request──▶ AwaitingToken ──NeedToken──▶ Submitting ──Success──▶ Success
//!                          │                          │
//!                          └──────── other ───────────┴──── other ──────▶ Failed
//! ```
//!
//! The token-resume entry point builds the session directly in
//! `Submitting`, so both paths share the round-two transitions. The session
//! only interprets responses; `Client::login` drives it through the request
//! executor and records the outcome in the client's session state.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::client::Client;
use crate::error::{ApiError, Error, ResultCode};
use crate::params::Params;
use crate::session::LoginInfo;

/// Result strings of `action=login`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginCode {
    Success,
    NeedToken,
    NoName,
    Illegal,
    NotExists,
    EmptyPass,
    WrongPass,
    WrongPluginPass,
    CreateBlocked,
    Throttled,
    Blocked,
    WrongToken,
    /// A code this client does not know, kept verbatim.
    Other(String),
}

impl LoginCode {
    pub fn as_str(&self) -> &str {
        match self {
            LoginCode::Success => "Success",
            LoginCode::NeedToken => "NeedToken",
            LoginCode::NoName => "NoName",
            LoginCode::Illegal => "Illegal",
            LoginCode::NotExists => "NotExists",
            LoginCode::EmptyPass => "EmptyPass",
            LoginCode::WrongPass => "WrongPass",
            LoginCode::WrongPluginPass => "WrongPluginPass",
            LoginCode::CreateBlocked => "CreateBlocked",
            LoginCode::Throttled => "Throttled",
            LoginCode::Blocked => "Blocked",
            LoginCode::WrongToken => "WrongToken",
            LoginCode::Other(raw) => raw,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, LoginCode::Other(_))
    }

    fn to_result_code(&self) -> Option<ResultCode> {
        ResultCode::new(self.as_str(), self.is_recognized())
    }
}

impl From<&str> for LoginCode {
    fn from(raw: &str) -> Self {
        match raw {
            "Success" => LoginCode::Success,
            "NeedToken" => LoginCode::NeedToken,
            "NoName" => LoginCode::NoName,
            "Illegal" => LoginCode::Illegal,
            "NotExists" => LoginCode::NotExists,
            "EmptyPass" => LoginCode::EmptyPass,
            "WrongPass" => LoginCode::WrongPass,
            "WrongPluginPass" => LoginCode::WrongPluginPass,
            "CreateBlocked" => LoginCode::CreateBlocked,
            "Throttled" => LoginCode::Throttled,
            "Blocked" => LoginCode::Blocked,
            "WrongToken" => LoginCode::WrongToken,
            other => LoginCode::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    login: Option<LoginReply>,
}

#[derive(Debug, Default, Deserialize)]
struct LoginReply {
    #[serde(default)]
    result: String,
    token: Option<String>,
    lguserid: Option<u64>,
    lgusername: Option<String>,
    lgtoken: Option<String>,
    cookieprefix: Option<String>,
    sessionid: Option<String>,
    reason: Option<String>,
    wait: Option<u64>,
}

impl LoginReply {
    fn parse(response: &Value) -> Result<Self, Error> {
        let envelope = LoginEnvelope::deserialize(response)
            .map_err(|e| Error::MalformedResponse(format!("login response: {e}")))?;
        let reply = envelope
            .login
            .ok_or_else(|| Error::MalformedResponse("response has no login object".to_string()))?;
        if reply.result.is_empty() {
            return Err(Error::MalformedResponse(
                "login object has no result".to_string(),
            ));
        }
        Ok(reply)
    }

    fn failure(&self, code: &LoginCode) -> Result<ApiError, Error> {
        let code = code
            .to_result_code()
            .ok_or_else(|| Error::MalformedResponse("empty login result".to_string()))?;
        let message = match (&self.reason, self.wait) {
            (Some(reason), _) => Some(reason.clone()),
            (None, Some(wait)) => Some(format!("wait {wait} seconds before retrying")),
            (None, None) => None,
        };
        Ok(ApiError::new(code, message))
    }

    fn into_info(self, fallback_username: &str, used_token: Option<&str>) -> LoginInfo {
        LoginInfo {
            user_id: self.lguserid.unwrap_or_default(),
            username: self
                .lgusername
                .unwrap_or_else(|| fallback_username.to_string()),
            token: self.lgtoken.or_else(|| used_token.map(str::to_string)),
            cookie_prefix: self.cookieprefix,
            session_id: self.sessionid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Start,
    AwaitingToken,
    Submitting { token: String },
    Success(LoginInfo),
    Failed(ApiError),
}

/// One run of the login handshake. Discarded once it reaches a terminal
/// state.
#[derive(Debug)]
pub struct LoginSession {
    username: String,
    password: String,
    state: LoginState,
    session_cookie: Option<(String, String)>,
}

impl LoginSession {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            state: LoginState::Start,
            session_cookie: None,
        }
    }

    /// Skip round one with a token obtained earlier.
    pub fn resume(username: &str, password: &str, token: &str) -> Self {
        Self {
            state: LoginState::Submitting {
                token: token.to_string(),
            },
            ..Self::new(username, password)
        }
    }

    pub fn state(&self) -> &LoginState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, LoginState::Success(_) | LoginState::Failed(_))
    }

    /// `(cookieprefix, sessionid)` from the latest reply that carried both.
    pub fn session_cookie(&self) -> Option<(&str, &str)> {
        self.session_cookie
            .as_ref()
            .map(|(prefix, id)| (prefix.as_str(), id.as_str()))
    }

    /// Parameters for the next round, or `None` when no request is due.
    pub fn request(&mut self) -> Option<Params> {
        if matches!(self.state, LoginState::Start) {
            self.state = LoginState::AwaitingToken;
            return Some(Params::from([("action", "login"), ("lgname", &*self.username)]));
        }
        match &self.state {
            LoginState::Submitting { token } => Some(Params::from([
                ("action", "login"),
                ("lgname", &*self.username),
                ("lgpassword", &*self.password),
                ("lgtoken", token.as_str()),
            ])),
            _ => None,
        }
    }

    /// Apply the server's answer to the round in flight. A reply with no
    /// round in flight is rejected and leaves the session unchanged.
    pub fn advance(&mut self, response: &Value) -> Result<(), Error> {
        let reply = LoginReply::parse(response)?;
        let session_cookie = reply.cookieprefix.clone().zip(reply.sessionid.clone());
        let code = LoginCode::from(reply.result.as_str());

        let next = match (&self.state, code) {
            (LoginState::AwaitingToken, LoginCode::NeedToken) => {
                let token = reply.token.clone().filter(|t| !t.is_empty()).ok_or_else(|| {
                    Error::MalformedResponse("NeedToken without a token".to_string())
                })?;
                LoginState::Submitting { token }
            }
            (LoginState::AwaitingToken, LoginCode::Success) => {
                LoginState::Success(reply.into_info(&self.username, None))
            }
            (LoginState::Submitting { token }, LoginCode::Success) => {
                let token = token.clone();
                LoginState::Success(reply.into_info(&self.username, Some(&token)))
            }
            (LoginState::AwaitingToken | LoginState::Submitting { .. }, code) => {
                LoginState::Failed(reply.failure(&code)?)
            }
            (_, code) => {
                return Err(Error::UnexpectedLoginReply {
                    code: code.as_str().to_string(),
                });
            }
        };
        if session_cookie.is_some() {
            self.session_cookie = session_cookie;
        }
        self.state = next;
        Ok(())
    }

    /// Terminal outcome; `None` while the handshake is still running.
    pub fn outcome(self) -> Option<Result<LoginInfo, ApiError>> {
        match self.state {
            LoginState::Success(info) => Some(Ok(info)),
            LoginState::Failed(err) => Some(Err(err)),
            _ => None,
        }
    }
}

impl Client {
    /// Log in with the full two-round handshake.
    pub fn login(&self, username: &str, password: &str) -> Result<LoginInfo, Error> {
        self.run_login(LoginSession::new(username, password))
    }

    /// Log in with a token from an earlier round one, skipping the fetch.
    pub fn login_with_token(
        &self,
        username: &str,
        password: &str,
        token: &str,
    ) -> Result<LoginInfo, Error> {
        self.run_login(LoginSession::resume(username, password, token))
    }

    fn run_login(&self, mut session: LoginSession) -> Result<LoginInfo, Error> {
        while let Some(params) = session.request() {
            let response = self.call(&params, false)?;
            session.advance(&response)?;

            let mut state = self.lock();
            if let Some((prefix, id)) = session.session_cookie() {
                state.adopt_session_id(prefix, id);
            }
            if let LoginState::Submitting { token } = session.state() {
                state.login_token = Some(token.clone());
            }
        }

        match session.outcome() {
            Some(Ok(info)) => {
                info!(user = %info.username, user_id = info.user_id, "logged in");
                let mut state = self.lock();
                if let Some(token) = &info.token {
                    state.login_token = Some(token.clone());
                }
                state.tokens.clear();
                state.login = Some(info.clone());
                Ok(info)
            }
            Some(Err(err)) => {
                debug!(code = %err.code, "login failed");
                Err(Error::Api(err))
            }
            None => Err(Error::MalformedResponse(
                "login handshake stopped before completing".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::tests::{client, ScriptedTransport};

    #[test]
    fn known_codes_are_recognized() {
        for raw in [
            "Success",
            "NeedToken",
            "NoName",
            "Illegal",
            "NotExists",
            "EmptyPass",
            "WrongPass",
            "WrongPluginPass",
            "CreateBlocked",
            "Throttled",
            "Blocked",
            "WrongToken",
        ] {
            let code = LoginCode::from(raw);
            assert!(code.is_recognized(), "{raw}");
            assert_eq!(code.as_str(), raw);
        }
        let other = LoginCode::from("Aborted");
        assert!(!other.is_recognized());
        assert_eq!(other.as_str(), "Aborted");
    }

    #[test]
    fn full_handshake_threads_token_into_round_two() {
        let mut session = LoginSession::new("username", "password");
        let first = session.request().unwrap();
        assert_eq!(first.get("lgname"), Some("username"));
        assert!(!first.contains("lgpassword"));
        assert!(!first.contains("lgtoken"));
        assert_eq!(session.state(), &LoginState::AwaitingToken);
        assert!(session.request().is_none());

        session
            .advance(&json!({"login":{"result":"NeedToken","token":"abc123"}}))
            .unwrap();
        let second = session.request().unwrap();
        assert_eq!(second.get("lgtoken"), Some("abc123"));
        assert_eq!(second.get("lgpassword"), Some("password"));

        session
            .advance(&json!({"login":{"result":"Success","lguserid":7,"lgusername":"username"}}))
            .unwrap();
        assert!(session.is_terminal());
        let info = session.outcome().unwrap().unwrap();
        assert_eq!(info.user_id, 7);
        assert_eq!(info.token.as_deref(), Some("abc123"));
    }

    #[test]
    fn resume_starts_at_round_two() {
        let mut session = LoginSession::resume("username", "password", "tok");
        let params = session.request().unwrap();
        assert_eq!(params.get("lgtoken"), Some("tok"));
        assert_eq!(params.get("lgpassword"), Some("password"));
    }

    #[test]
    fn no_name_fails_in_round_one() {
        let mut session = LoginSession::new("", "");
        session.request().unwrap();
        session
            .advance(&json!({"login":{"result":"NoName"}}))
            .unwrap();
        let err = session.outcome().unwrap().unwrap_err();
        assert_eq!(err.code, "NoName");
        assert!(err.code.is_recognized());
    }

    #[test]
    fn second_need_token_is_terminal() {
        let mut session = LoginSession::resume("u", "p", "stale");
        session.request().unwrap();
        session
            .advance(&json!({"login":{"result":"NeedToken","token":"fresh"}}))
            .unwrap();
        let err = session.outcome().unwrap().unwrap_err();
        assert_eq!(err.code, "NeedToken");
    }

    #[test]
    fn unknown_code_is_preserved() {
        let mut session = LoginSession::resume("u", "p", "t");
        session.request().unwrap();
        session
            .advance(&json!({"login":{"result":"Aborted","reason":"hook said no"}}))
            .unwrap();
        let err = session.outcome().unwrap().unwrap_err();
        assert_eq!(err.code, "Aborted");
        assert!(!err.code.is_recognized());
        assert_eq!(err.message.as_deref(), Some("hook said no"));
    }

    #[test]
    fn throttled_reports_wait() {
        let mut session = LoginSession::resume("u", "p", "t");
        session.request().unwrap();
        session
            .advance(&json!({"login":{"result":"Throttled","wait":60}}))
            .unwrap();
        let err = session.outcome().unwrap().unwrap_err();
        assert_eq!(err.message.as_deref(), Some("wait 60 seconds before retrying"));
    }

    #[test]
    fn missing_login_object_is_malformed() {
        let mut session = LoginSession::new("u", "p");
        session.request().unwrap();
        let err = session.advance(&json!({"query":{}})).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));

        let err = session.advance(&json!({"login":{}})).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn need_token_without_token_is_malformed() {
        let mut session = LoginSession::new("u", "p");
        session.request().unwrap();
        let err = session
            .advance(&json!({"login":{"result":"NeedToken"}}))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn client_login_records_session_state() {
        let transport = ScriptedTransport::default();
        transport
            .reply(r#"{"login":{"result":"NeedToken","token":"7aaaf636","cookieprefix":"dawiki","sessionid":"e9bffbfa"}}"#)
            .reply(r#"{"login":{"result":"Success","lguserid":1,"lgusername":"username","lgtoken":"7aaaf636"}}"#);
        let client = client(&transport);

        let info = client.login("username", "password").unwrap();
        assert_eq!(info.user_id, 1);
        assert_eq!(client.login_info(), Some(info));
        assert_eq!(client.login_token().as_deref(), Some("7aaaf636"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].param("lgtoken").as_deref(), Some("7aaaf636"));
        assert_eq!(sent[1].header("cookie"), Some("dawiki_session=e9bffbfa"));
    }

    #[test]
    fn client_login_failure_keeps_no_identity() {
        let transport = ScriptedTransport::default();
        transport
            .reply(r#"{"login":{"result":"NeedToken","token":"t"}}"#)
            .reply(r#"{"login":{"result":"WrongPass"}}"#);
        let client = client(&transport);

        let err = client.login("username", "nope").unwrap_err();
        assert_eq!(err.api_code(), Some("WrongPass"));
        assert!(client.login_info().is_none());
        assert_eq!(client.login_token().as_deref(), Some("t"));
    }

    #[test]
    fn session_cookie_is_captured() {
        let mut session = LoginSession::new("u", "p");
        session.request().unwrap();
        session
            .advance(&json!({"login":{"result":"NeedToken","token":"t","cookieprefix":"dawiki","sessionid":"s1"}}))
            .unwrap();
        assert_eq!(session.session_cookie(), Some(("dawiki", "s1")));
    }

    #[test]
    fn reply_without_round_in_flight_is_rejected() {
        let mut session = LoginSession::new("u", "p");
        let err = session
            .advance(&json!({"login":{"result":"Success","lguserid":1,"lgusername":"u"}}))
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedLoginReply { ref code } if code == "Success"));
        assert_eq!(session.state(), &LoginState::Start);

        session.request().unwrap();
        session
            .advance(&json!({"login":{"result":"Success","lguserid":1,"lgusername":"u"}}))
            .unwrap();
        let err = session
            .advance(&json!({"login":{"result":"WrongPass","cookieprefix":"dawiki","sessionid":"s2"}}))
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedLoginReply { .. }));
        assert!(matches!(session.state(), LoginState::Success(_)));
        assert!(session.session_cookie().is_none());
    }
}
