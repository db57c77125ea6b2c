//! Runtime failover from the durable store to the embedded one.
//!
//! A [`FailoverStore`] wraps whichever backend the resolver settled on. When a
//! call fails with a connection error and fallback is permitted, the embedded
//! SQLite file is opened once, swapped in, and the call is retried against it.
//! Every later caller sees the swapped store; the mode change is recorded on the
//! shared [`StorageState`] exactly once.
//!
//! A pool acquire timeout alone is load, not an outage: the store is pinged on
//! a fresh connection and only an unreachable server triggers the switch.
//!
//! Row ids are only meaningful within one backend, so pagination cursors carry
//! the state generation and are refused once the backend has been replaced.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flipr_core::{
    Cursor, Fingerprint, HealthStatus, Property, PropertyDraft, PropertyId, PropertyPage,
    ScoreUpdate, StatusCounts, StorageMode, WalkScore,
};
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{PropertyStore, SqlitePropertyStore, StorageError, StorageState};

macro_rules! with_failover {
    ($self:ident, |$store:ident| $call:expr) => {{
        let $store = $self.current();
        match $call.await {
            Err(err) if err.may_be_outage() => {
                if !confirm_outage(&$store, &err).await {
                    return Err(err);
                }
                let $store = $self.fail_over(&$store, err).await?;
                let result = $call.await;
                $self.observe(&result);
                result
            }
            result => {
                $self.observe(&result);
                result
            }
        }
    }};
}

pub struct FailoverStore {
    active: RwLock<Arc<dyn PropertyStore>>,
    fallback_path: Option<PathBuf>,
    opened: OnceCell<Arc<dyn PropertyStore>>,
    state: Arc<StorageState>,
}

impl FailoverStore {
    /// `fallback_path` of `None` disables runtime failover (strict mode, or already embedded).
    pub fn new(
        primary: Arc<dyn PropertyStore>,
        fallback_path: Option<PathBuf>,
        state: Arc<StorageState>,
    ) -> Self {
        Self {
            active: RwLock::new(primary),
            fallback_path,
            opened: OnceCell::new(),
            state,
        }
    }

    pub fn state(&self) -> &Arc<StorageState> {
        &self.state
    }

    pub fn health(&self) -> HealthStatus {
        self.state.health()
    }

    pub fn current(&self) -> Arc<dyn PropertyStore> {
        self.active.read().clone()
    }

    async fn fail_over(
        &self,
        failed: &Arc<dyn PropertyStore>,
        err: StorageError,
    ) -> Result<Arc<dyn PropertyStore>, StorageError> {
        let current = self.current();
        if !same_store(&current, failed) {
            // Another caller already swapped stores.
            return Ok(current);
        }
        let Some(path) = self.fallback_path.as_ref() else {
            self.state.record_failure(err.to_string());
            return Err(err);
        };
        if self.state.mode() == StorageMode::Fallback {
            self.state.record_failure(err.to_string());
            return Err(err);
        }

        let fallback = self
            .opened
            .get_or_try_init(|| async {
                let store = SqlitePropertyStore::open(path).await?;
                Ok::<_, StorageError>(Arc::new(store) as Arc<dyn PropertyStore>)
            })
            .await?
            .clone();

        {
            let mut active = self.active.write();
            if same_store(&active, failed) {
                *active = fallback.clone();
            }
        }
        if self.state.transition(StorageMode::Fallback, fallback.backend_name()) {
            warn!(
                error = %err,
                path = %path.display(),
                "durable store unreachable; continuing on embedded fallback"
            );
        }
        self.state.record_degraded(err.to_string());
        Ok(self.current())
    }

    fn observe<T>(&self, result: &Result<T, StorageError>) {
        match result {
            Ok(_) => self.state.record_success(),
            Err(err) if err.is_connection() => self.state.record_failure(err.to_string()),
            Err(_) => {}
        }
    }
}

async fn confirm_outage(store: &Arc<dyn PropertyStore>, err: &StorageError) -> bool {
    if err.is_connection() {
        return true;
    }
    match store.ping().await {
        Ok(()) => {
            warn!(error = %err, "connection pool exhausted; durable store still reachable");
            false
        }
        Err(ping_err) => {
            debug!(error = %ping_err, "ping after pool exhaustion failed");
            ping_err.is_connection()
        }
    }
}

fn stale_cursor(cursor: Cursor) -> StorageError {
    StorageError::InvalidCursor(format!(
        "cursor {cursor} was issued before the storage backend changed; restart from the first page"
    ))
}

fn same_store(a: &Arc<dyn PropertyStore>, b: &Arc<dyn PropertyStore>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[async_trait]
impl PropertyStore for FailoverStore {
    fn backend_name(&self) -> &'static str {
        self.current().backend_name()
    }

    fn generation(&self) -> u64 {
        self.state.generation()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.current().ping().await
    }

    async fn create_or_update(
        &self,
        fingerprint: &Fingerprint,
        draft: &PropertyDraft,
    ) -> Result<PropertyId, StorageError> {
        with_failover!(self, |store| store.create_or_update(fingerprint, draft))
    }

    async fn list_page(
        &self,
        cursor: Option<Cursor>,
        page_size: u32,
    ) -> Result<PropertyPage, StorageError> {
        let generation = self.generation();
        if let Some(cursor) = cursor.filter(|c| c.generation() != generation) {
            return Err(stale_cursor(cursor));
        }
        let mut page = with_failover!(self, |store| store.list_page(cursor, page_size))?;
        let current = self.generation();
        if let Some(cursor) = cursor.filter(|_| current != generation) {
            return Err(stale_cursor(cursor));
        }
        page.next_cursor = page.next_cursor.map(|next| next.issued_by(current));
        Ok(page)
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Property>, StorageError> {
        with_failover!(self, |store| store.find_by_fingerprint(fingerprint))
    }

    async fn get(&self, id: PropertyId) -> Result<Option<Property>, StorageError> {
        with_failover!(self, |store| store.get(id))
    }

    async fn update_score(
        &self,
        id: PropertyId,
        update: &ScoreUpdate,
    ) -> Result<Property, StorageError> {
        with_failover!(self, |store| store.update_score(id, update))
    }

    async fn update_walk_score(
        &self,
        id: PropertyId,
        walk: &WalkScore,
    ) -> Result<Property, StorageError> {
        with_failover!(self, |store| store.update_walk_score(id, walk))
    }

    async fn status_counts(&self) -> Result<StatusCounts, StorageError> {
        with_failover!(self, |store| store.status_counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft, fingerprint, UnreachableStore};

    /// Durable store whose pool is fully checked out; `reachable` decides the ping.
    struct SaturatedStore {
        reachable: bool,
    }

    fn exhausted() -> StorageError {
        StorageError::PoolExhausted("pool timed out while waiting for an open connection".into())
    }

    #[async_trait]
    impl PropertyStore for SaturatedStore {
        fn backend_name(&self) -> &'static str {
            "postgres"
        }

        async fn ping(&self) -> Result<(), StorageError> {
            if self.reachable {
                Ok(())
            } else {
                Err(StorageError::Connection("connection refused".into()))
            }
        }

        async fn create_or_update(
            &self,
            _: &Fingerprint,
            _: &PropertyDraft,
        ) -> Result<PropertyId, StorageError> {
            Err(exhausted())
        }

        async fn list_page(&self, _: Option<Cursor>, _: u32) -> Result<PropertyPage, StorageError> {
            Err(exhausted())
        }

        async fn find_by_fingerprint(
            &self,
            _: &Fingerprint,
        ) -> Result<Option<Property>, StorageError> {
            Err(exhausted())
        }

        async fn get(&self, _: PropertyId) -> Result<Option<Property>, StorageError> {
            Err(exhausted())
        }

        async fn update_score(
            &self,
            _: PropertyId,
            _: &ScoreUpdate,
        ) -> Result<Property, StorageError> {
            Err(exhausted())
        }

        async fn update_walk_score(
            &self,
            _: PropertyId,
            _: &WalkScore,
        ) -> Result<Property, StorageError> {
            Err(exhausted())
        }

        async fn status_counts(&self) -> Result<StatusCounts, StorageError> {
            Err(exhausted())
        }
    }

    fn durable_state() -> Arc<StorageState> {
        let state = Arc::new(StorageState::new());
        state.transition(StorageMode::Durable, "postgres");
        state.record_success();
        state
    }

    #[tokio::test]
    async fn connection_loss_switches_to_embedded_store_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let state = durable_state();
        let store = FailoverStore::new(
            Arc::new(UnreachableStore),
            Some(dir.path().join("fallback.db")),
            state.clone(),
        );

        let fp = fingerprint("3 Maple Dr");
        let id = store
            .create_or_update(&fp, &draft("3 Maple Dr", 199_000.0))
            .await
            .expect("write lands on the fallback store");

        let health = store.health();
        assert_eq!(health.storage_mode, StorageMode::Fallback);
        assert_eq!(health.backend, "sqlite");
        assert!(health.last_connection_ok);
        assert!(health.last_error.unwrap().contains("connection refused"));
        assert_eq!(store.backend_name(), "sqlite");

        let stored = store.find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert_eq!(stored.id, id);
    }

    #[tokio::test]
    async fn strict_mode_surfaces_connection_errors() {
        let state = durable_state();
        let store = FailoverStore::new(Arc::new(UnreachableStore), None, state.clone());

        let err = store.list_page(None, 10).await.unwrap_err();
        assert!(err.is_connection());

        let health = state.health();
        assert_eq!(health.storage_mode, StorageMode::Durable);
        assert!(!health.last_connection_ok);
    }

    #[tokio::test]
    async fn non_connection_errors_do_not_trigger_failover() {
        let dir = tempfile::tempdir().unwrap();
        let state = durable_state();
        let primary = Arc::new(SqlitePropertyStore::open_in_memory().await.unwrap());
        let store = FailoverStore::new(primary, Some(dir.path().join("fb.db")), state.clone());

        let err = store
            .update_score(404, &ScoreUpdate { score: 0.3, reasoning: None })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(404)));
        assert_eq!(state.mode(), StorageMode::Durable);
        assert!(!dir.path().join("fb.db").exists());
    }

    #[tokio::test]
    async fn busy_pool_on_a_reachable_server_keeps_durable_mode() {
        let dir = tempfile::tempdir().unwrap();
        let state = durable_state();
        let generation = state.generation();
        let store = FailoverStore::new(
            Arc::new(SaturatedStore { reachable: true }),
            Some(dir.path().join("fallback.db")),
            state.clone(),
        );

        let err = store
            .create_or_update(&fingerprint("4 Aspen Way"), &draft("4 Aspen Way", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PoolExhausted(_)));

        let health = state.health();
        assert_eq!(health.storage_mode, StorageMode::Durable);
        assert_eq!(health.backend, "postgres");
        assert!(health.last_connection_ok);
        assert_eq!(state.generation(), generation);
        assert!(!dir.path().join("fallback.db").exists());
    }

    #[tokio::test]
    async fn busy_pool_with_a_dead_server_fails_over() {
        let dir = tempfile::tempdir().unwrap();
        let state = durable_state();
        let store = FailoverStore::new(
            Arc::new(SaturatedStore { reachable: false }),
            Some(dir.path().join("fallback.db")),
            state.clone(),
        );

        store
            .create_or_update(&fingerprint("4 Aspen Way"), &draft("4 Aspen Way", 1.0))
            .await
            .expect("write lands on the fallback store");
        assert_eq!(state.mode(), StorageMode::Fallback);
        assert!(dir.path().join("fallback.db").exists());
    }

    #[tokio::test]
    async fn cursors_issued_before_a_backend_switch_are_refused() {
        let state = durable_state();
        let primary = Arc::new(SqlitePropertyStore::open_in_memory().await.unwrap());
        let store = FailoverStore::new(primary, None, state.clone());
        for i in 0..3 {
            let street = format!("{i} Spruce St");
            store.create_or_update(&fingerprint(&street), &draft(&street, 1.0)).await.unwrap();
        }

        let first = store.list_page(None, 2).await.unwrap();
        let cursor = first.next_cursor.unwrap();
        assert_eq!(cursor.generation(), state.generation());
        let second = store.list_page(Some(cursor), 2).await.unwrap();
        assert_eq!(second.items.len(), 1);

        state.transition(StorageMode::Fallback, "sqlite");
        let err = store.list_page(Some(cursor), 2).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidCursor(_)));

        let restarted = store.list_page(None, 2).await.unwrap();
        assert_eq!(restarted.next_cursor.unwrap().generation(), state.generation());
    }
}
