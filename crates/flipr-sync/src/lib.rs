//! Ingestion cycles for Flipr: crawl every enabled provider, normalize each
//! page, deduplicate the drafts against storage, and report what happened.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flipr_adapters::{
    FetchClient, FetchClientConfig, RateLimiterRegistry, ReqwestTransport, WalkScoreClient,
};
use flipr_core::{DedupOutcome, HealthStatus, Property};
use flipr_storage::{StorageError, StorageHandle};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod enrich;
pub mod progress;
pub mod schedule;

pub use config::{
    ActiveProvider, EngineConfig, ProviderConfig, ProviderRegistry, RateLimitConfig,
    WalkScoreConfig,
};
pub use dedup::{DedupCache, Deduplicator, Fingerprinter, Resolution};
pub use enrich::{EnrichError, Enricher};
pub use progress::{CrawlProgress, ProgressTracker};
pub use schedule::{
    build_scheduler, run_until, shutdown_channel, CycleRunner, ShutdownSignal, ShutdownTrigger,
};

pub const CRATE_NAME: &str = "flipr-sync";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub provider_id: String,
    pub queries_attempted: usize,
    pub pages_fetched: usize,
    pub malformed_pages: usize,
    pub records_seen: usize,
    pub records_skipped: usize,
    pub new: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub storage_errors: usize,
    #[serde(default)]
    pub enriched: usize,
    #[serde(default)]
    pub enrichment_failures: usize,
    /// Why the provider stopped early, if it did.
    pub skipped_reason: Option<String>,
    pub interrupted: bool,
}

impl ProviderSummary {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: DedupOutcome) {
        match outcome {
            DedupOutcome::New => self.new += 1,
            DedupOutcome::Updated => self.updated += 1,
            DedupOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub interrupted: bool,
    pub storage: Option<HealthStatus>,
    pub providers: Vec<ProviderSummary>,
}

impl CycleSummary {
    pub fn provider(&self, provider_id: &str) -> Option<&ProviderSummary> {
        self.providers.iter().find(|p| p.provider_id == provider_id)
    }

    pub fn total_new(&self) -> usize {
        self.providers.iter().map(|p| p.new).sum()
    }

    pub fn total_updated(&self) -> usize {
        self.providers.iter().map(|p| p.updated).sum()
    }

    pub fn total_duplicates(&self) -> usize {
        self.providers.iter().map(|p| p.duplicates).sum()
    }

    pub fn total_enriched(&self) -> usize {
        self.providers.iter().map(|p| p.enriched).sum()
    }

    pub fn render_brief(&self) -> String {
        let storage = self
            .storage
            .as_ref()
            .map(|h| format!("{} ({})", h.storage_mode.as_str(), h.backend))
            .unwrap_or_else(|| "unknown".to_string());
        let rows = self
            .providers
            .iter()
            .map(|p| {
                format!(
                    "| {} | {} | {} | {} | {} | {} | {} | {} |",
                    p.provider_id,
                    p.pages_fetched,
                    p.new,
                    p.updated,
                    p.duplicates,
                    p.invalid + p.records_skipped,
                    p.storage_errors,
                    p.skipped_reason.as_deref().unwrap_or("-"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "# Flipr Ingestion Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Storage: {}\n- Interrupted: {}\n- New: {} / Updated: {} / Duplicates: {}\n- Walk scores added: {}\n\n## Providers\n| Provider | Pages | New | Updated | Duplicates | Skipped | Storage errors | Stopped early |\n|---|---|---|---|---|---|---|---|\n{}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            storage,
            self.interrupted,
            self.total_new(),
            self.total_updated(),
            self.total_duplicates(),
            self.total_enriched(),
            rows,
        )
    }
}

/// Writes `<reports_dir>/<run_id>/cycle_summary.json` and `cycle_brief.md`.
pub async fn write_reports(reports_dir: &Path, summary: &CycleSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing cycle summary")?;
    let json_path = dir.join("cycle_summary.json");
    fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let brief_path = dir.join("cycle_brief.md");
    fs::write(&brief_path, summary.render_brief())
        .await
        .with_context(|| format!("writing {}", brief_path.display()))?;
    Ok(dir)
}

pub struct IngestionOrchestrator {
    providers: Vec<ActiveProvider>,
    fetch: Arc<FetchClient>,
    dedup: Arc<Deduplicator>,
    progress: Arc<ProgressTracker>,
    enricher: Option<Arc<Enricher>>,
    storage: Option<StorageHandle>,
    reports_dir: Option<PathBuf>,
}

impl IngestionOrchestrator {
    pub fn new(
        providers: Vec<ActiveProvider>,
        fetch: Arc<FetchClient>,
        dedup: Arc<Deduplicator>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            providers,
            fetch,
            dedup,
            progress,
            enricher: None,
            storage: None,
            reports_dir: None,
        }
    }

    /// New and changed properties without a walk score get one looked up.
    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = Some(Arc::new(enricher));
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Storage health is attached to every cycle summary.
    pub fn with_storage(mut self, storage: StorageHandle) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Wire the production stack: registry from disk, credentials from the
    /// process environment, reqwest transport, on-disk crawl progress.
    pub async fn from_config(config: &EngineConfig, storage: StorageHandle) -> Result<Self> {
        let registry = ProviderRegistry::load(&config.providers_file).await?;
        let providers = registry.activate(|name| std::env::var(name).ok());
        if providers.is_empty() {
            warn!(
                path = %config.providers_file.display(),
                "no providers are enabled with credentials; cycles will be empty"
            );
        }

        let walk_score = registry
            .walkscore
            .as_ref()
            .and_then(|walk| Some((walk, walk.api_key(|name| std::env::var(name).ok())?)));

        let mut limits: Vec<_> = providers.iter().map(|p| p.config.limits()).collect();
        if let Some((walk, _)) = &walk_score {
            limits.push(walk.limits());
        }
        let timeout = Duration::from_secs(config.http_timeout_secs.max(1));
        let transport = ReqwestTransport::new(timeout, Some(config.user_agent.as_str()))?;
        let fetch = FetchClient::new(
            Arc::new(transport),
            RateLimiterRegistry::new(&limits),
            FetchClientConfig {
                attempt_timeout: timeout,
                ..FetchClientConfig::default()
            },
        );
        let dedup = Deduplicator::new(
            storage.clone(),
            Fingerprinter::new(config.coordinate_precision),
            config.dedup_cache_capacity,
        );
        let progress = ProgressTracker::load(&config.progress_file).await?;
        let fetch = Arc::new(fetch);

        let mut orchestrator = Self::new(
            providers,
            fetch.clone(),
            Arc::new(dedup),
            Arc::new(progress),
        )
        .with_reports_dir(&config.reports_dir)
        .with_storage(storage.clone());
        if let Some((walk, key)) = walk_score {
            let client = WalkScoreClient::new(fetch, key, walk.endpoint.clone());
            orchestrator = orchestrator.with_enricher(Enricher::new(client, storage));
        }
        Ok(orchestrator)
    }

    /// Crawl every provider concurrently. A failing provider is skipped and
    /// reported; the others carry on.
    pub async fn run_cycle(&self, shutdown: &ShutdownSignal) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, providers = self.providers.len(), "ingestion cycle starting");

        let mut tasks = JoinSet::new();
        for provider in &self.providers {
            let crawl = ProviderCrawl {
                provider: provider.clone(),
                fetch: self.fetch.clone(),
                dedup: self.dedup.clone(),
                progress: self.progress.clone(),
                enricher: self.enricher.clone(),
                shutdown: shutdown.clone(),
            };
            let span = info_span!("provider_crawl", %run_id, provider = %provider.config.provider_id);
            tasks.spawn(crawl.run().instrument(span));
        }

        let mut providers = Vec::with_capacity(self.providers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => providers.push(summary),
                Err(err) => error!(%run_id, error = %err, "provider task ended abnormally"),
            }
        }
        providers.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            interrupted: shutdown.is_triggered() || providers.iter().any(|p| p.interrupted),
            storage: self.storage.as_ref().map(|s| s.health()),
            providers,
        };

        if let Some(dir) = &self.reports_dir {
            let path = write_reports(dir, &summary).await?;
            debug!(%run_id, path = %path.display(), "cycle reports written");
        }
        info!(
            %run_id,
            new = summary.total_new(),
            updated = summary.total_updated(),
            duplicates = summary.total_duplicates(),
            enriched = summary.total_enriched(),
            interrupted = summary.interrupted,
            "ingestion cycle finished"
        );
        Ok(summary)
    }
}

struct ProviderCrawl {
    provider: ActiveProvider,
    fetch: Arc<FetchClient>,
    dedup: Arc<Deduplicator>,
    progress: Arc<ProgressTracker>,
    enricher: Option<Arc<Enricher>>,
    shutdown: ShutdownSignal,
}

impl ProviderCrawl {
    async fn run(self) -> ProviderSummary {
        let provider_id = self.provider.config.provider_id.clone();
        let mut summary = ProviderSummary::new(&provider_id);

        for query in &self.provider.config.queries {
            if self.shutdown.is_triggered() {
                summary.interrupted = true;
                break;
            }
            summary.queries_attempted += 1;
            if let Err(reason) = self.crawl_query(query, &mut summary).await {
                warn!(
                    provider = %provider_id,
                    query = %query,
                    reason = %reason,
                    "provider skipped for the rest of this cycle"
                );
                summary.skipped_reason = Some(reason);
                break;
            }
            if summary.interrupted {
                break;
            }
        }
        summary
    }

    /// `Err` carries the reason the whole provider is abandoned for this cycle.
    async fn crawl_query(&self, query: &str, summary: &mut ProviderSummary) -> Result<(), String> {
        let adapter = &self.provider.adapter;
        let config = &self.provider.config;
        let provider_id = config.provider_id.as_str();
        let page_limit = adapter.page_limit();

        let mut page = self.progress.next_page(provider_id, query).await;
        if page_limit.is_some_and(|limit| page > limit) {
            page = progress::FIRST_PAGE;
        }

        for _ in 0..config.max_pages_per_cycle.max(1) {
            if self.shutdown.is_triggered() {
                summary.interrupted = true;
                return Ok(());
            }

            let request = adapter
                .build_request(query, page, config.page_size)
                .map_err(|err| err.to_string())?;
            let payload = self
                .fetch
                .fetch(provider_id, &request)
                .await
                .map_err(|err| err.to_string())?;
            summary.pages_fetched += 1;

            let normalized = match adapter.normalize(&payload.body, Utc::now()) {
                Ok(normalized) => normalized,
                Err(err) => {
                    warn!(provider = provider_id, query, page, error = %err, "unparseable page; moving to next query");
                    summary.malformed_pages += 1;
                    return Ok(());
                }
            };
            summary.records_seen += normalized.record_count;
            summary.records_skipped += normalized.skipped;

            if normalized.record_count == 0 {
                info!(provider = provider_id, query, page, "no more listings; query restarts next cycle");
                self.save(provider_id, query, progress::FIRST_PAGE).await;
                return Ok(());
            }

            for draft in normalized.drafts {
                if self.shutdown.is_triggered() {
                    summary.interrupted = true;
                    return Ok(());
                }
                match self.dedup.resolve(draft).await {
                    Ok(resolution) => {
                        summary.record(resolution.outcome);
                        if resolution.outcome != DedupOutcome::Duplicate {
                            self.enrich(&resolution.property, summary).await;
                        }
                    }
                    Err(StorageError::Validation(err)) => {
                        summary.invalid += 1;
                        debug!(provider = provider_id, error = %err, "invalid draft skipped");
                    }
                    Err(err) => {
                        summary.storage_errors += 1;
                        warn!(provider = provider_id, error = %err, "failed to persist property");
                    }
                }
            }

            let next = page + 1;
            if page_limit.is_some_and(|limit| next > limit) {
                self.save(provider_id, query, progress::FIRST_PAGE).await;
                return Ok(());
            }
            self.save(provider_id, query, next).await;
            page = next;
        }
        Ok(())
    }

    /// Enrichment failures are counted and logged; the listing itself is already stored.
    async fn enrich(&self, property: &Property, summary: &mut ProviderSummary) {
        let Some(enricher) = &self.enricher else {
            return;
        };
        match enricher.enrich(property).await {
            Ok(Some(_)) => summary.enriched += 1,
            Ok(None) => {}
            Err(err) => {
                summary.enrichment_failures += 1;
                warn!(id = property.id, error = %err, "walk score enrichment failed");
            }
        }
    }

    async fn save(&self, provider_id: &str, query: &str, next_page: u32) {
        if let Err(err) = self.progress.advance(provider_id, query, next_page).await {
            warn!(provider = provider_id, query, error = %err, "failed to persist crawl progress");
        }
    }
}


#[cfg(test)]
mod tests {
    use flipr_storage::PropertyStore;

    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn shutdown_before_start_fetches_nothing() {
        let transport = Arc::new(HangingTransport::default());
        let orchestrator = orchestrator(ATTOM_ONLY, transport.clone()).await;
        let (trigger, signal) = shutdown_channel();
        trigger.trigger();

        let summary = orchestrator.run_cycle(&signal).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.provider("attom").unwrap().pages_fetched, 0);
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permanent_provider_error_is_reported_as_skip() {
        let transport = Arc::new(FixedTransport { status: 401, body: "{}" });
        let orchestrator = orchestrator(ATTOM_ONLY, transport).await;

        let summary = orchestrator.run_cycle(&ShutdownSignal::never()).await.unwrap();
        let attom = summary.provider("attom").unwrap();
        assert!(attom.skipped_reason.as_deref().unwrap().contains("401"), "{attom:?}");
        assert_eq!(attom.pages_fetched, 0);
        assert!(!summary.interrupted);
    }

    #[tokio::test]
    async fn malformed_payload_moves_on_without_skipping_provider() {
        let transport = Arc::new(FixedTransport { status: 200, body: "<html>" });
        let orchestrator = orchestrator(ATTOM_ONLY, transport).await;

        let summary = orchestrator.run_cycle(&ShutdownSignal::never()).await.unwrap();
        let attom = summary.provider("attom").unwrap();
        assert_eq!(attom.malformed_pages, 1);
        assert!(attom.skipped_reason.is_none());
    }

    #[tokio::test]
    async fn reports_land_under_the_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FixedTransport { status: 200, body: r#"{"property":[]}"# });
        let orchestrator = orchestrator(ATTOM_ONLY, transport)
            .await
            .with_reports_dir(dir.path());

        let summary = orchestrator.run_cycle(&ShutdownSignal::never()).await.unwrap();
        let run_dir = dir.path().join(summary.run_id.to_string());

        let json = tokio::fs::read(run_dir.join("cycle_summary.json")).await.unwrap();
        let parsed: CycleSummary = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.run_id, summary.run_id);
        assert_eq!(parsed.providers, summary.providers);

        let brief = tokio::fs::read_to_string(run_dir.join("cycle_brief.md")).await.unwrap();
        assert!(brief.contains(&summary.run_id.to_string()));
        assert!(brief.contains("| attom | 1 | 0 | 0 | 0 | 0 | 0 | - |"), "{brief}");
    }

    #[tokio::test]
    async fn new_listings_get_a_walk_score_once() {
        let transport = Arc::new(SplitTransport {
            listings: ATTOM_PAGE,
            walk: r#"{"status": 1, "walkscore": 77, "description": "Very Walkable"}"#,
        });
        let (orchestrator, store) = orchestrator_with_store(ATTOM_ONLY, transport, true).await;

        let summary = orchestrator.run_cycle(&ShutdownSignal::never()).await.unwrap();
        let attom = summary.provider("attom").unwrap();
        assert_eq!(attom.new, 2);
        assert_eq!(attom.duplicates, 4, "{attom:?}");
        assert_eq!(attom.enriched, 2);
        assert_eq!(attom.enrichment_failures, 0);

        let page = store.list_page(None, 10).await.unwrap();
        assert!(page.items.iter().all(|p| p.walk_score == Some(77)));
        assert_eq!(page.items[0].raw_payload["identifier"]["attomId"], 1);
        assert!(summary.render_brief().contains("- Walk scores added: 2"));
    }

    #[tokio::test]
    async fn failed_walk_score_lookup_keeps_the_listing() {
        let transport = Arc::new(SplitTransport {
            listings: ATTOM_PAGE,
            walk: r#"{"status": 40}"#,
        });
        let (orchestrator, store) = orchestrator_with_store(ATTOM_ONLY, transport, true).await;

        let summary = orchestrator.run_cycle(&ShutdownSignal::never()).await.unwrap();
        let attom = summary.provider("attom").unwrap();
        assert_eq!(attom.new, 2);
        assert_eq!(attom.enriched, 0);
        assert_eq!(attom.enrichment_failures, 2);
        assert_eq!(attom.storage_errors, 0);

        let page = store.list_page(None, 10).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|p| p.walk_score.is_none()));
    }
}
