//! Process-wide factory for repositories, one per remote endpoint.
//!
//! A [`Registry`] is created once by the host and passed by reference to
//! whatever needs repositories. It never forgets an endpoint.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncSettings};
use crate::error::RegistryError;
use crate::notify::Notifier;
use crate::remote::client::{build_client, resolve_base_url};
use crate::remote::HttpRemote;
use crate::repository::{Entity, Repository};
use crate::store::KeyValueStore;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub api_root: String,
    pub token: Option<String>,
    pub sync: SyncSettings,
    /// Start each repository's sync timer when it is first created.
    pub autostart_sync: bool,
}

impl RegistrySettings {
    pub fn new(api_root: impl Into<String>) -> Self {
        Self {
            api_root: api_root.into(),
            token: None,
            sync: SyncSettings::default(),
            autostart_sync: true,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_sync(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_autostart(mut self, autostart_sync: bool) -> Self {
        self.autostart_sync = autostart_sync;
        self
    }
}

impl From<&Config> for RegistrySettings {
    fn from(config: &Config) -> Self {
        Self::new(config.api_root.clone())
            .with_token(config.token.clone())
            .with_sync(config.sync.clone())
    }
}

type AnyRepository = Arc<dyn Any + Send + Sync>;

/// Repository shutdown hook kept alongside the type-erased instance.
type Shutdown = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Registered {
    repository: AnyRepository,
    shutdown: Shutdown,
}

pub struct Registry {
    settings: RegistrySettings,
    store: Arc<dyn KeyValueStore>,
    notifier: Notifier,
    /// Shared by every remote; clones share the connection pool.
    client: Client,
    repositories: Mutex<HashMap<String, Registered>>,
}

impl Registry {
    pub fn new(settings: RegistrySettings, store: Arc<dyn KeyValueStore>) -> Result<Self, RegistryError> {
        let client = build_client(settings.sync.request_timeout())?;
        Ok(Self {
            settings,
            store,
            notifier: Notifier::new(),
            client,
            repositories: Mutex::new(HashMap::new()),
        })
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Return the repository for `endpoint`, creating it on first use.
    ///
    /// The endpoint is both the URL path below the API root and the
    /// cache-key prefix in the store.
    pub fn get_repository<T: Entity>(&self, endpoint: &str) -> Result<Arc<Repository<T>>, RegistryError> {
        let mut repositories = self.repositories.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(registered) = repositories.get(endpoint) {
            return registered
                .repository
                .clone()
                .downcast::<Repository<T>>()
                .map_err(|_| RegistryError::TypeMismatch {
                    endpoint: endpoint.to_string(),
                    requested: type_name::<T>(),
                });
        }

        let base_url = resolve_base_url(&self.settings.api_root, endpoint)?;
        let remote = HttpRemote::new(self.client.clone(), base_url, self.settings.token.clone())?;
        debug!(endpoint, url = %remote.actions_url(), "Creating repository");

        let repository = Arc::new(Repository::<T>::new(
            endpoint,
            self.store.clone(),
            Arc::new(remote),
            self.notifier.clone(),
            self.settings.sync.clone(),
        ));

        if self.settings.autostart_sync {
            repository.start_sync()?;
        }

        let hook = repository.clone();
        let shutdown: Shutdown = Box::new(move || {
            let repository = hook.clone();
            async move {
                if let Err(e) = repository.shutdown().await {
                    warn!(endpoint = %repository.endpoint(), error = %e, "Failed to persist on shutdown");
                }
            }
            .boxed()
        });

        repositories.insert(
            endpoint.to_string(),
            Registered {
                repository: repository.clone(),
                shutdown,
            },
        );
        info!(endpoint, "Repository registered");
        Ok(repository)
    }

    /// Stop every repository's sync timer and persist its state.
    pub async fn shutdown(&self) {
        let hooks: Vec<_> = {
            let repositories = self.repositories.lock().unwrap_or_else(PoisonError::into_inner);
            repositories.values().map(|registered| (registered.shutdown)()).collect()
        };
        futures::future::join_all(hooks).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::store::{FileStore, MemoryStore};
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Plan {
        #[serde(default)]
        id: String,
        title: String,
    }

    impl Entity for Plan {
        fn id(&self) -> &str {
            &self.id
        }

        fn set_id(&mut self, id: String) {
            self.id = id;
        }
    }

    fn registry() -> Registry {
        let settings = RegistrySettings::new("http://localhost:9090/").with_autostart(false);
        Registry::new(settings, Arc::new(MemoryStore::new())).expect("registry")
    }

    #[test]
    fn test_same_endpoint_returns_same_instance() {
        let registry = registry();
        let first = registry.get_repository::<Plan>("plan").expect("repo");
        let second = registry.get_repository::<Plan>("plan").expect("repo");
        assert!(Arc::ptr_eq(&first, &second));

        first.create(Plan {
            id: String::new(),
            title: "spring".to_string(),
        });
        assert_eq!(second.find_all().len(), 1);
    }

    #[test]
    fn test_distinct_endpoints_are_isolated() {
        let registry = registry();
        let plans = registry.get_repository::<Plan>("plan").expect("repo");
        let scenarios = registry.get_repository::<Plan>("scenario").expect("repo");
        assert!(!Arc::ptr_eq(&plans, &scenarios));

        plans.create(Plan {
            id: String::new(),
            title: "a".to_string(),
        });
        assert!(scenarios.find_all().is_empty());
        assert_eq!(scenarios.endpoint(), "scenario");
    }

    #[test]
    fn test_type_mismatch() {
        let registry = registry();
        registry.get_repository::<Plan>("plan").expect("repo");
        let result = registry.get_repository::<serde_json::Value>("plan");
        assert!(matches!(result, Err(RegistryError::TypeMismatch { .. })));
    }

    #[test]
    fn test_invalid_api_root() {
        let settings = RegistrySettings::new("not a url").with_autostart(false);
        let registry = Registry::new(settings, Arc::new(MemoryStore::new())).expect("registry");
        assert!(matches!(
            registry.get_repository::<Plan>("plan"),
            Err(RegistryError::Remote(_))
        ));
        // Nothing was memoized, so a second call fails the same way
        assert!(matches!(
            registry.get_repository::<Plan>("plan"),
            Err(RegistryError::Remote(_))
        ));
    }

    #[test]
    fn test_autostart_needs_runtime() {
        let settings = RegistrySettings::new("http://localhost:9090/");
        let registry = Registry::new(settings, Arc::new(MemoryStore::new())).expect("registry");
        assert!(matches!(
            registry.get_repository::<Plan>("plan"),
            Err(RegistryError::Sync(SyncError::NoRuntime))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_persists_every_repository() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(FileStore::new(dir.path()).expect("store"));
        let settings = RegistrySettings::new("http://127.0.0.1:1/");
        let registry = Registry::new(settings, store.clone()).expect("registry");

        let plans = registry.get_repository::<Plan>("plan").expect("repo");
        assert!(plans.is_syncing());
        plans.create(Plan {
            id: String::new(),
            title: "summer".to_string(),
        });
        registry.get_repository::<Plan>("scenario").expect("repo");

        registry.shutdown().await;
        assert!(!plans.is_syncing());
        assert!(store.load("plan.cache").expect("load").is_some());
        assert!(store.load("plan.queue").expect("load").is_some());
        assert!(store.load("scenario.cache").expect("load").is_some());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.token = Some("t".to_string());
        let settings = RegistrySettings::from(&config);
        assert_eq!(settings.api_root, config.api_root);
        assert_eq!(settings.token.as_deref(), Some("t"));
        assert!(settings.autostart_sync);
    }
}
