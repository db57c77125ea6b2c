//! Per-provider, per-query crawl position persisted between cycles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const FIRST_PAGE: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProgress {
    pub next_page: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlProgress {
    #[serde(default)]
    pub providers: BTreeMap<String, BTreeMap<String, QueryProgress>>,
}

impl CrawlProgress {
    pub fn next_page(&self, provider: &str, query: &str) -> u32 {
        self.providers
            .get(provider)
            .and_then(|queries| queries.get(query))
            .map(|p| p.next_page.max(FIRST_PAGE))
            .unwrap_or(FIRST_PAGE)
    }

    pub fn set_next_page(&mut self, provider: &str, query: &str, next_page: u32, at: DateTime<Utc>) {
        self.providers.entry(provider.to_string()).or_default().insert(
            query.to_string(),
            QueryProgress {
                next_page: next_page.max(FIRST_PAGE),
                updated_at: at,
            },
        );
    }
}

/// Progress file plus the in-memory copy every provider task updates.
pub struct ProgressTracker {
    path: Option<PathBuf>,
    state: Mutex<CrawlProgress>,
}

impl ProgressTracker {
    /// Not persisted; progress lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(CrawlProgress::default()),
        }
    }

    /// A missing or unreadable file starts every query from the first page.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CrawlProgress>(&bytes) {
                Ok(progress) => progress,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "progress file unreadable; starting over");
                    CrawlProgress::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CrawlProgress::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn snapshot(&self) -> CrawlProgress {
        self.state.lock().await.clone()
    }

    pub async fn next_page(&self, provider: &str, query: &str) -> u32 {
        self.state.lock().await.next_page(provider, query)
    }

    pub async fn advance(&self, provider: &str, query: &str, next_page: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.set_next_page(provider, query, next_page, Utc::now());
        self.persist(&state).await
    }

    /// Start `query` from the first page next cycle.
    pub async fn reset(&self, provider: &str, query: &str) -> Result<()> {
        self.advance(provider, query, FIRST_PAGE).await
    }

    async fn persist(&self, progress: &CrawlProgress) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(progress).context("serializing crawl progress")?;
        write_atomically(path, &bytes).await
    }
}

/// Write through a sibling temp file and rename over `path`.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}
