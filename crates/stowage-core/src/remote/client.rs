//! HTTP implementation of [`RemoteService`] on top of reqwest.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::debug;

use super::{RemoteResponse, RemoteService};
use crate::error::RemoteError;

/// Path below the repository base URL that receives queued actions
const ACTIONS_PATH: &str = "actions";

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Build a shared HTTP client. Clones share the connection pool.
pub fn build_client(timeout: Duration) -> Result<Client, RemoteError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Resolve `endpoint` against `api_root`, always ending in `/` so that
/// relative joins land below the endpoint rather than replacing it.
pub fn resolve_base_url(api_root: &str, endpoint: &str) -> Result<Url, RemoteError> {
    let root = Url::parse(&with_trailing_slash(api_root))
        .map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", api_root, e)))?;
    let base = root
        .join(&with_trailing_slash(endpoint.trim_start_matches('/')))
        .map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
    Ok(base)
}

fn with_trailing_slash(s: &str) -> String {
    if s.ends_with('/') {
        s.to_string()
    } else {
        format!("{}/", s)
    }
}

#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    actions_url: Url,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(client: Client, base_url: Url, token: Option<String>) -> Result<Self, RemoteError> {
        let actions_url = base_url
            .join(ACTIONS_PATH)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        Ok(Self {
            client,
            actions_url,
            token,
        })
    }

    /// Convenience constructor with its own client and the default timeout.
    pub fn for_endpoint(
        api_root: &str,
        endpoint: &str,
        token: Option<String>,
    ) -> Result<Self, RemoteError> {
        let client = build_client(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))?;
        Self::new(client, resolve_base_url(api_root, endpoint)?, token)
    }

    pub fn actions_url(&self) -> &Url {
        &self.actions_url
    }

    async fn send(&self, payload: &Value) -> Result<RemoteResponse, RemoteError> {
        let mut request = self.client.post(self.actions_url.clone()).json(payload);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        // A body that fails to arrive still leaves a usable status
        let body = response.text().await.unwrap_or_default();
        debug!(url = %self.actions_url, status, "Action posted");

        Ok(RemoteResponse { status, body })
    }
}

impl RemoteService for HttpRemote {
    fn post_action<'a>(
        &'a self,
        payload: &'a Value,
    ) -> BoxFuture<'a, Result<RemoteResponse, RemoteError>> {
        Box::pin(self.send(payload))
    }
}
