//! API token storage in the OS keychain.

use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "stowage";

/// Tokens are keyed by API root so several remotes can coexist.
pub struct TokenStore;

impl TokenStore {
    /// Store the token for an API root in the OS keychain
    pub fn store(api_root: &str, token: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, api_root).context("Failed to create keyring entry")?;
        entry
            .set_password(token)
            .context("Failed to store token in keychain")?;
        Ok(())
    }

    /// Retrieve the token for an API root, `None` if nothing is stored
    pub fn get(api_root: &str) -> Result<Option<String>> {
        let entry = Entry::new(SERVICE_NAME, api_root).context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    pub fn delete(api_root: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, api_root).context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }

    /// Token from configuration if present, otherwise from the keychain.
    /// Keychain failures are treated as "no token".
    pub fn resolve(api_root: &str, configured: Option<String>) -> Option<String> {
        configured.or_else(|| match Self::get(api_root) {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!(error = %e, "Keychain unavailable, continuing without token");
                None
            }
        })
    }
}
