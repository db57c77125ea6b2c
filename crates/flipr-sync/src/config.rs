use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use flipr_adapters::{
    Preset, PresetAdapter, ProviderAdapter, ProviderLimits, WALK_SCORE_CREDENTIAL_ENV,
    WALK_SCORE_PROVIDER,
};
use flipr_storage::{clamp_page_size, ResolverConfig, DEFAULT_PAGE_SIZE};
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};

use crate::dedup::{DEFAULT_CACHE_CAPACITY, DEFAULT_COORDINATE_PRECISION};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub allow_fallback: bool,
    pub fallback_db: PathBuf,
    pub page_size: u32,
    pub dedup_cache_capacity: usize,
    pub coordinate_precision: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub providers_file: PathBuf,
    pub progress_file: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub shutdown_grace_secs: u64,
    pub web_port: u16,
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim(),
        "1" | "true" | "TRUE" | "True" | "yes" | "YES" | "Yes"
    )
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).map(|v| truthy(&v)).unwrap_or(false);
        let path = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        Self {
            database_url: lookup("DATABASE_URL"),
            allow_fallback: !(flag("FLIPR_PRODUCTION_STRICT") || flag("DISABLE_SQLITE_FALLBACK")),
            fallback_db: path("FLIPR_FALLBACK_DB", "./properties.db"),
            page_size: clamp_page_size(
                lookup("FLIPR_PAGE_SIZE")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(DEFAULT_PAGE_SIZE),
            ),
            dedup_cache_capacity: lookup("FLIPR_DEDUP_CACHE_CAPACITY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_CACHE_CAPACITY),
            coordinate_precision: lookup("FLIPR_COORD_PRECISION")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_COORDINATE_PRECISION),
            http_timeout_secs: lookup("FLIPR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30),
            user_agent: lookup("FLIPR_USER_AGENT")
                .unwrap_or_else(|| format!("flipr-bot/{}", env!("CARGO_PKG_VERSION"))),
            providers_file: path("FLIPR_PROVIDERS_FILE", "./providers.yaml"),
            progress_file: path("FLIPR_PROGRESS_FILE", "./crawl_progress.json"),
            reports_dir: path("FLIPR_REPORTS_DIR", "./reports"),
            scheduler_enabled: flag("FLIPR_SCHEDULER_ENABLED"),
            sync_cron: lookup("FLIPR_SYNC_CRON").unwrap_or_else(|| "0 */15 * * * *".to_string()),
            shutdown_grace_secs: lookup("FLIPR_SHUTDOWN_GRACE_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30),
            web_port: lookup("FLIPR_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5005),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            allow_fallback: self.allow_fallback,
            fallback_path: self.fallback_db.clone(),
            ..ResolverConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_per_second: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub preset: Preset,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable names holding credentials; the preset's defaults when absent.
    #[serde(default)]
    pub credential_env: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_provider_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages_per_cycle: u32,
    #[serde(default)]
    pub queries: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    2
}

fn default_provider_page_size() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    3
}

impl ProviderConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.provider_id)
    }

    pub fn credential_env(&self) -> Vec<String> {
        match &self.credential_env {
            Some(names) => names.clone(),
            None => self
                .preset
                .default_credential_env()
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }

    pub fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            provider_id: self.provider_id.clone(),
            capacity: self.rate_limit.capacity,
            refill_per_second: self.rate_limit.refill_per_second.max(0.0),
            max_concurrency: self.max_concurrency,
        }
    }
}

/// Optional walkability lookup run on new and changed properties.
#[derive(Debug, Clone, Deserialize)]
pub struct WalkScoreConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_walk_score_env")]
    pub credential_env: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_walk_score_env() -> String {
    WALK_SCORE_CREDENTIAL_ENV.to_string()
}

impl WalkScoreConfig {
    pub fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            provider_id: WALK_SCORE_PROVIDER.to_string(),
            capacity: self.rate_limit.capacity,
            refill_per_second: self.rate_limit.refill_per_second.max(0.0),
            max_concurrency: self.max_concurrency,
        }
    }

    /// The API key, when enrichment is enabled and the key is set.
    pub fn api_key(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        if !self.enabled {
            info!("walk score enrichment disabled in registry");
            return None;
        }
        let key = lookup(&self.credential_env).filter(|k| !k.trim().is_empty());
        if key.is_none() {
            warn!(env = %self.credential_env, "walk score key missing; enrichment disabled");
        }
        key
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderRegistry {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub walkscore: Option<WalkScoreConfig>,
}

/// A provider that passed configuration checks and is ready to crawl.
#[derive(Clone)]
pub struct ActiveProvider {
    pub config: ProviderConfig,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl ProviderRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for provider in &registry.providers {
            if !seen.insert(provider.provider_id.as_str()) {
                anyhow::bail!("provider {} is listed twice", provider.provider_id);
            }
            if registry.walkscore.is_some() && provider.provider_id == WALK_SCORE_PROVIDER {
                anyhow::bail!("provider id {WALK_SCORE_PROVIDER} is reserved for enrichment");
            }
        }
        Ok(registry)
    }

    /// Enabled providers whose credentials are present in the environment.
    pub fn activate(&self, lookup: impl Fn(&str) -> Option<String>) -> Vec<ActiveProvider> {
        let mut active = Vec::new();
        for config in &self.providers {
            if !config.enabled {
                info!(provider = %config.provider_id, "provider disabled in registry");
                continue;
            }
            let names = config.credential_env();
            let values: Vec<String> = names
                .iter()
                .map(|name| lookup(name).unwrap_or_default())
                .collect();
            let Some(credentials) = config.preset.credentials_from(&values) else {
                warn!(
                    provider = %config.provider_id,
                    env = ?names,
                    "credentials missing; provider disabled"
                );
                continue;
            };
            let adapter = PresetAdapter::new(
                config.provider_id.clone(),
                config.preset,
                config.endpoint.clone(),
                credentials,
            );
            active.push(ActiveProvider {
                config: config.clone(),
                adapter: Arc::new(adapter),
            });
        }
        active
    }
}
