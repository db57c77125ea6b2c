use chrono::{DateTime, Utc};
use flipr_core::{HealthStatus, StorageMode};
use parking_lot::RwLock;
use tracing::info;

/// Process-wide storage mode, owned by whoever builds the resolver and shared by handle.
#[derive(Debug)]
pub struct StorageState {
    inner: RwLock<StateInner>,
}

#[derive(Debug, Clone)]
struct StateInner {
    mode: StorageMode,
    backend: &'static str,
    last_connection_ok: bool,
    last_error: Option<String>,
    changed_at: DateTime<Utc>,
    generation: u64,
}

impl Default for StorageState {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner {
                mode: StorageMode::Unresolved,
                backend: "none",
                last_connection_ok: false,
                last_error: None,
                changed_at: Utc::now(),
                generation: 0,
            }),
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.inner.read().mode
    }

    /// Number of backend switches so far. Anything keyed by row id must be
    /// discarded when this changes.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Switch mode. Returns false (and changes nothing) when already in `mode` on `backend`.
    pub fn transition(&self, mode: StorageMode, backend: &'static str) -> bool {
        let mut inner = self.inner.write();
        if inner.mode == mode && inner.backend == backend {
            return false;
        }
        info!(from = inner.mode.as_str(), to = mode.as_str(), backend, "storage mode transition");
        inner.mode = mode;
        inner.backend = backend;
        inner.changed_at = Utc::now();
        inner.generation += 1;
        true
    }

    pub fn record_success(&self) {
        if self.inner.read().last_connection_ok {
            return;
        }
        self.inner.write().last_connection_ok = true;
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.last_connection_ok = false;
        inner.last_error = Some(error.into());
    }

    /// Keep the failure text for diagnostics while the active backend is healthy.
    pub fn record_degraded(&self, reason: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.last_connection_ok = true;
        inner.last_error = Some(reason.into());
    }

    pub fn health(&self) -> HealthStatus {
        let inner = self.inner.read().clone();
        HealthStatus {
            storage_mode: inner.mode,
            backend: inner.backend.to_string(),
            last_connection_ok: inner.last_connection_ok,
            last_error: inner.last_error,
            changed_at: inner.changed_at,
        }
    }
}
