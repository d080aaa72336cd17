//! Remote service client used by the sync engine.
//!
//! Actions are POSTed as JSON to the `actions` endpoint below a repository's
//! base URL. The response status decides whether an action is done,
//! retried or dropped, see [`Outcome`].

pub mod client;

pub use client::HttpRemote;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::RemoteError;

/// Anything that can deliver an action payload and report the response.
///
/// Transport failures (timeouts, refused connections) are `Err`; any
/// response the server sent, whatever its status, is `Ok`.
pub trait RemoteService: Send + Sync {
    fn post_action<'a>(&'a self, payload: &'a Value)
        -> BoxFuture<'a, Result<RemoteResponse, RemoteError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

/// How a response status is handled by the flush loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx: the action is done.
    Success,
    /// 4xx: the action is dropped and reported.
    ClientError,
    /// 5xx: the action is requeued.
    ServerError,
    /// Anything else: requeued like a server error.
    Unexpected,
}

impl RemoteResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn classify(&self) -> Outcome {
        match self.status {
            200..=299 => Outcome::Success,
            400..=499 => Outcome::ClientError,
            500..=599 => Outcome::ServerError,
            _ => Outcome::Unexpected,
        }
    }
}
