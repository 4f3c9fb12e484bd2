//! Blocking client core for the MediaWiki action API.
//!
//! # Overview
//! Sends API calls through a pluggable `Transport`, keeps the session
//! (cookies, tokens, login identity) between calls, negotiates replication
//! lag with `maxlag`, and drives the two-round login handshake.
//!
//! # Design
//! - `Client` is long-lived and `Send + Sync`; its mutable state sits behind
//!   one mutex that is never held across network I/O or retry sleeps.
//! - Every call goes through one executor that owns the `maxlag` parameter
//!   and the busy-retry loop, so login and ordinary calls behave alike.
//! - Server result strings become typed codes (`LoginCode`, `ResultCode`)
//!   that keep the raw string for codes this crate does not know.
//! - Requests and responses are plain data, so tests script the server
//!   with an in-memory transport or talk to the `mock-wiki` crate over HTTP.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod login;
pub mod params;
pub mod session;

pub use client::Client;
pub use config::{Backoff, ClientConfig, MaxlagConfig};
pub use error::{ApiError, Error, ResultCode};
pub use http::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportError, UreqTransport};
pub use login::{LoginCode, LoginSession, LoginState};
pub use params::Params;
pub use session::{CookieJar, LoginInfo, TokenKind};
