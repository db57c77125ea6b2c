//! Turns a possibly damaged connection descriptor into a working store.
//!
//! Strategies are tried in order. The first that connects wins and the process
//! enters durable mode. If none do (or the descriptor is absent) the resolver
//! either opens the embedded SQLite file, when fallback is allowed, or fails
//! with a configuration error. Successful resolutions are cached by sanitized
//! descriptor, so repeated calls share one pool.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flipr_core::StorageMode;
use sqlx::postgres::PgSslMode;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    sanitize_descriptor, ConnectionDescriptor, FailoverStore, PoolSettings,
    PostgresPropertyStore, PropertyStore, SqlitePropertyStore, StorageError, StorageState,
};

pub type StorageHandle = Arc<FailoverStore>;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub env_var_name: String,
    pub allow_fallback: bool,
    pub fallback_path: PathBuf,
    pub pool: PoolSettings,
    pub ssl_mode: PgSslMode,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            env_var_name: "DATABASE_URL".to_string(),
            allow_fallback: true,
            fallback_path: PathBuf::from("./properties.db"),
            pool: PoolSettings::default(),
            ssl_mode: PgSslMode::Prefer,
        }
    }
}

#[async_trait]
pub trait ConnectStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        cleaned: &str,
        config: &ResolverConfig,
    ) -> Result<Arc<dyn PropertyStore>, StorageError>;
}

/// Hand the sanitized descriptor straight to the driver.
pub struct DirectUrlStrategy;

#[async_trait]
impl ConnectStrategy for DirectUrlStrategy {
    fn name(&self) -> &'static str {
        "direct-url"
    }

    async fn connect(
        &self,
        cleaned: &str,
        config: &ResolverConfig,
    ) -> Result<Arc<dyn PropertyStore>, StorageError> {
        let store = PostgresPropertyStore::connect_url(cleaned, config.pool).await?;
        Ok(Arc::new(store))
    }
}

/// Parse the descriptor ourselves and build connect options from its parts.
pub struct ParsedDescriptorStrategy;

#[async_trait]
impl ConnectStrategy for ParsedDescriptorStrategy {
    fn name(&self) -> &'static str {
        "parsed-descriptor"
    }

    async fn connect(
        &self,
        cleaned: &str,
        config: &ResolverConfig,
    ) -> Result<Arc<dyn PropertyStore>, StorageError> {
        let descriptor = ConnectionDescriptor::parse(cleaned)?;
        if !descriptor.is_usable() {
            return Err(StorageError::Configuration(format!(
                "descriptor {descriptor} is missing a recognized scheme or database"
            )));
        }
        let opts = descriptor.to_connect_options(config.ssl_mode);
        let store = PostgresPropertyStore::connect_with(opts, config.pool).await?;
        Ok(Arc::new(store))
    }
}

pub struct ConnectionResolver {
    config: ResolverConfig,
    strategies: Vec<Box<dyn ConnectStrategy>>,
    state: Arc<StorageState>,
    resolved: Mutex<Option<(String, StorageHandle)>>,
}

impl ConnectionResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_strategies(
            config,
            vec![Box::new(DirectUrlStrategy), Box::new(ParsedDescriptorStrategy)],
        )
    }

    pub fn with_strategies(
        config: ResolverConfig,
        strategies: Vec<Box<dyn ConnectStrategy>>,
    ) -> Self {
        Self {
            config,
            strategies,
            state: Arc::new(StorageState::new()),
            resolved: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<StorageState> {
        &self.state
    }

    /// Masked, parsed view of a raw descriptor for diagnostics.
    pub fn describe(&self, raw: &str) -> Result<ConnectionDescriptor, StorageError> {
        ConnectionDescriptor::parse(&sanitize_descriptor(raw, &self.config.env_var_name))
    }

    pub async fn resolve_from_env(&self) -> Result<StorageHandle, StorageError> {
        let raw = std::env::var(&self.config.env_var_name).ok();
        self.resolve(raw.as_deref()).await
    }

    pub async fn resolve(&self, raw: Option<&str>) -> Result<StorageHandle, StorageError> {
        let cleaned = raw
            .map(|r| sanitize_descriptor(r, &self.config.env_var_name))
            .unwrap_or_default();

        let mut resolved = self.resolved.lock().await;
        if let Some((key, handle)) = resolved.as_ref() {
            if *key == cleaned {
                return Ok(handle.clone());
            }
        }
        let handle = self.establish(&cleaned).await?;
        *resolved = Some((cleaned, handle.clone()));
        Ok(handle)
    }

    /// Drop the cached handle and resolve again.
    pub async fn reconnect(&self, raw: Option<&str>) -> Result<StorageHandle, StorageError> {
        self.resolved.lock().await.take();
        self.resolve(raw).await
    }

    async fn establish(&self, cleaned: &str) -> Result<StorageHandle, StorageError> {
        let failure = if cleaned.is_empty() {
            format!("{} is not set", self.config.env_var_name)
        } else {
            let mut failures = Vec::with_capacity(self.strategies.len());
            for strategy in &self.strategies {
                match strategy.connect(cleaned, &self.config).await {
                    Ok(store) => {
                        self.state.transition(StorageMode::Durable, store.backend_name());
                        self.state.record_success();
                        info!(strategy = strategy.name(), "durable store connected");
                        let fallback = self
                            .config
                            .allow_fallback
                            .then(|| self.config.fallback_path.clone());
                        return Ok(Arc::new(FailoverStore::new(
                            store,
                            fallback,
                            self.state.clone(),
                        )));
                    }
                    Err(err) => {
                        warn!(strategy = strategy.name(), error = %err, "connection strategy failed");
                        failures.push(format!("{}: {err}", strategy.name()));
                    }
                }
            }
            failures.join("; ")
        };

        if !self.config.allow_fallback {
            self.state.record_failure(failure.clone());
            error!(reason = %failure, "no durable store and embedded fallback is disabled");
            return Err(StorageError::Configuration(format!(
                "durable store unavailable and fallback disabled ({failure})"
            )));
        }

        warn!(
            reason = %failure,
            path = %self.config.fallback_path.display(),
            "using embedded fallback store"
        );
        let store = SqlitePropertyStore::open(&self.config.fallback_path).await?;
        self.state.transition(StorageMode::Fallback, store.backend_name());
        self.state.record_degraded(failure);
        Ok(Arc::new(FailoverStore::new(
            Arc::new(store),
            None,
            self.state.clone(),
        )))
    }
}
