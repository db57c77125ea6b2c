//! Embedded SQLite backend, used for local development and as the degraded fallback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flipr_core::{
    Cursor, Fingerprint, Property, PropertyDraft, PropertyId, PropertyPage, ScoreUpdate,
    StatusCounts, WalkScore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::{debug, info};

use crate::{
    beds_column, clamp_page_size, counts_from_rows, cursor_start, page_from_rows,
    square_feet_column, walk_score_column, PropertyRow, PropertyStore, StorageError,
    MAX_UPSERT_ATTEMPTS,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS properties (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint      TEXT NOT NULL UNIQUE,
        provider         TEXT NOT NULL,
        external_id      TEXT NOT NULL,
        street           TEXT NOT NULL,
        city             TEXT NOT NULL,
        state            TEXT NOT NULL,
        postal_code      TEXT,
        latitude         REAL NOT NULL,
        longitude        REAL NOT NULL,
        price            REAL,
        beds             INTEGER,
        baths            REAL,
        square_feet      INTEGER,
        raw_payload_hash TEXT NOT NULL,
        first_seen_at    TEXT NOT NULL,
        last_updated_at  TEXT NOT NULL,
        score            REAL,
        deal_rating      TEXT,
        score_reasoning  TEXT,
        scored_at        TEXT,
        property_data    TEXT,
        walk_score       INTEGER,
        walk_description TEXT,
        walk_scored_at   TEXT
    )
"#;

const SELECT_COLUMNS: &str = "id, fingerprint, provider, external_id, street, city, state, \
     postal_code, latitude, longitude, price, beds, baths, square_feet, raw_payload_hash, \
     property_data, first_seen_at, last_updated_at, score, deal_rating, score_reasoning, \
     walk_score, walk_description";

pub struct SqlitePropertyStore {
    pool: SqlitePool,
    location: Option<PathBuf>,
}

impl SqlitePropertyStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(opts)
            .await?;
        let store = Self {
            pool,
            location: Some(path.to_path_buf()),
        };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Private in-memory database. One connection, so every query sees the same data.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = Self {
            pool,
            location: None,
        };
        store.bootstrap().await?;
        Ok(store)
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    async fn bootstrap(&self) -> Result<(), StorageError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        info!(location = ?self.location, "sqlite properties table ready");
        Ok(())
    }

    async fn insert(
        &self,
        fingerprint: &Fingerprint,
        draft: &PropertyDraft,
    ) -> Result<PropertyId, StorageError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO properties (fingerprint, provider, external_id, street, city, state,
                                    postal_code, latitude, longitude, price, beds, baths,
                                    square_feet, raw_payload_hash, property_data,
                                    first_seen_at, last_updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?16,
                    ?15, ?15)
            RETURNING id
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(&draft.provider)
        .bind(&draft.external_id)
        .bind(&draft.address.street)
        .bind(&draft.address.city)
        .bind(&draft.address.state)
        .bind(&draft.address.postal_code)
        .bind(draft.latitude)
        .bind(draft.longitude)
        .bind(draft.price)
        .bind(beds_column(draft))
        .bind(draft.baths)
        .bind(square_feet_column(draft))
        .bind(&draft.raw_payload_hash)
        .bind(draft.fetched_at)
        .bind(Json(&draft.raw_payload))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_listing(
        &self,
        fingerprint: &Fingerprint,
        draft: &PropertyDraft,
    ) -> Result<Option<PropertyId>, StorageError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE properties
               SET price = ?2,
                   beds = ?3,
                   baths = ?4,
                   square_feet = ?5,
                   raw_payload_hash = ?6,
                   last_updated_at = ?7,
                   property_data = ?8
             WHERE fingerprint = ?1
            RETURNING id
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(draft.price)
        .bind(beds_column(draft))
        .bind(draft.baths)
        .bind(square_feet_column(draft))
        .bind(&draft.raw_payload_hash)
        .bind(draft.fetched_at)
        .bind(Json(&draft.raw_payload))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl PropertyStore for SqlitePropertyStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_or_update(
        &self,
        fingerprint: &Fingerprint,
        draft: &PropertyDraft,
    ) -> Result<PropertyId, StorageError> {
        let mut last_conflict = None;
        for _ in 0..MAX_UPSERT_ATTEMPTS {
            match self.insert(fingerprint, draft).await {
                Ok(id) => return Ok(id),
                Err(StorageError::DuplicateConflict(detail)) => {
                    debug!(%fingerprint, "fingerprint already stored; updating listing fields");
                    if let Some(id) = self.update_listing(fingerprint, draft).await? {
                        return Ok(id);
                    }
                    last_conflict = Some(detail);
                }
                Err(err) => return Err(err),
            }
        }
        Err(StorageError::DuplicateConflict(last_conflict.unwrap_or_else(|| {
            format!("fingerprint {fingerprint} kept conflicting")
        })))
    }

    async fn list_page(
        &self,
        cursor: Option<Cursor>,
        page_size: u32,
    ) -> Result<PropertyPage, StorageError> {
        let page_size = clamp_page_size(page_size);
        let rows = sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM properties WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        ))
        .bind(cursor_start(cursor))
        .bind(i64::from(page_size) + 1)
        .fetch_all(&self.pool)
        .await?;
        page_from_rows(rows, page_size)
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Property>, StorageError> {
        sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM properties WHERE fingerprint = ?1"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Property::try_from)
        .transpose()
    }

    async fn get(&self, id: PropertyId) -> Result<Option<Property>, StorageError> {
        sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM properties WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Property::try_from)
        .transpose()
    }

    async fn update_score(
        &self,
        id: PropertyId,
        update: &ScoreUpdate,
    ) -> Result<Property, StorageError> {
        update.validate()?;
        let row = sqlx::query_as::<_, PropertyRow>(&format!(
            r#"
            UPDATE properties
               SET score = ?2,
                   deal_rating = ?3,
                   score_reasoning = ?4,
                   scored_at = ?5
             WHERE id = ?1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.score)
        .bind(update.rating().as_str())
        .bind(&update.reasoning)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Property::try_from)
            .transpose()?
            .ok_or(StorageError::NotFound(id))
    }

    async fn update_walk_score(
        &self,
        id: PropertyId,
        walk: &WalkScore,
    ) -> Result<Property, StorageError> {
        let row = sqlx::query_as::<_, PropertyRow>(&format!(
            r#"
            UPDATE properties
               SET walk_score = ?2,
                   walk_description = ?3,
                   walk_scored_at = ?4
             WHERE id = ?1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(walk_score_column(walk))
        .bind(&walk.description)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Property::try_from)
            .transpose()?
            .ok_or(StorageError::NotFound(id))
    }

    async fn status_counts(&self) -> Result<StatusCounts, StorageError> {
        let rows = sqlx::query_as::<_, (Option<String>, i64)>(
            "SELECT deal_rating, COUNT(*) FROM properties GROUP BY deal_rating",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts_from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft, fingerprint};
    use flipr_core::DealRating;

    #[tokio::test]
    async fn upsert_is_idempotent_per_fingerprint() {
        let store = SqlitePropertyStore::open_in_memory().await.unwrap();
        let fp = fingerprint("5 Pine Rd");

        let first = store.create_or_update(&fp, &draft("5 Pine Rd", 300_000.0)).await.unwrap();
        let again = store.create_or_update(&fp, &draft("5 Pine Rd", 300_000.0)).await.unwrap();
        let repriced = store.create_or_update(&fp, &draft("5 Pine Rd", 315_000.0)).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(first, repriced);
        let stored = store.get(first).await.unwrap().unwrap();
        assert_eq!(stored.price, Some(315_000.0));
        assert_eq!(stored.beds, Some(3));
        assert_eq!(store.status_counts().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn keyset_pagination_returns_every_row_exactly_once() {
        let store = SqlitePropertyStore::open_in_memory().await.unwrap();
        for i in 0..10 {
            let street = format!("{i} Cedar Ln");
            store
                .create_or_update(&fingerprint(&street), &draft(&street, 100.0 + i as f64))
                .await
                .unwrap();
        }

        let mut cursor = None;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = store.list_page(cursor, 4).await.unwrap();
            pages += 1;
            seen.extend(page.items.iter().map(|p| p.id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn exact_multiple_page_has_no_trailing_cursor() {
        let store = SqlitePropertyStore::open_in_memory().await.unwrap();
        for i in 0..4 {
            let street = format!("{i} Birch Ct");
            store.create_or_update(&fingerprint(&street), &draft(&street, 1.0)).await.unwrap();
        }
        let first = store.list_page(None, 2).await.unwrap();
        let second = store.list_page(first.next_cursor, 2).await.unwrap();
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.next_cursor, None);

        let empty = store.list_page(None, 50).await.unwrap();
        assert_eq!(empty.items.len(), 4);
        assert!(empty.next_cursor.is_none());
    }

    #[tokio::test]
    async fn score_update_leaves_listing_fields_alone() {
        let store = SqlitePropertyStore::open_in_memory().await.unwrap();
        let fp = fingerprint("9 Walnut St");
        let id = store.create_or_update(&fp, &draft("9 Walnut St", 250_000.0)).await.unwrap();
        let before = store.get(id).await.unwrap().unwrap();

        let scored = store
            .update_score(
                id,
                &ScoreUpdate {
                    score: 0.85,
                    reasoning: Some("below comps".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(scored.deal_rating, Some(DealRating::Hot));
        assert_eq!(scored.score_reasoning.as_deref(), Some("below comps"));
        assert_eq!(scored.price, before.price);
        assert_eq!(scored.last_updated_at, before.last_updated_at);

        // Re-ingesting the listing keeps the score.
        store.create_or_update(&fp, &draft("9 Walnut St", 260_000.0)).await.unwrap();
        let after = store.get(id).await.unwrap().unwrap();
        assert_eq!(after.score, Some(0.85));
        assert_eq!(store.status_counts().await.unwrap().hot, 1);
    }

    #[tokio::test]
    async fn score_update_rejects_unknown_ids_and_bad_scores() {
        let store = SqlitePropertyStore::open_in_memory().await.unwrap();
        let missing = store
            .update_score(77, &ScoreUpdate { score: 0.5, reasoning: None })
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound(77))));

        let invalid = store
            .update_score(1, &ScoreUpdate { score: 1.5, reasoning: None })
            .await;
        assert!(matches!(invalid, Err(StorageError::Validation(_))));
    }

    #[tokio::test]
    async fn file_backed_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("properties.db");
        let store = SqlitePropertyStore::open(&path).await.unwrap();
        store
            .create_or_update(&fingerprint("1 A St"), &draft("1 A St", 1.0))
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(store.location(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn raw_payload_is_stored_and_refreshed_with_the_listing() {
        let store = SqlitePropertyStore::open_in_memory().await.unwrap();
        let fp = fingerprint("2 Poplar Pl");
        let id = store.create_or_update(&fp, &draft("2 Poplar Pl", 1.0)).await.unwrap();
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.raw_payload["attomId"], "attom-2 Poplar Pl");

        let mut relisted = draft("2 Poplar Pl", 2.0);
        relisted.raw_payload = serde_json::json!({"attomId": "attom-2", "status": "relisted"});
        store.create_or_update(&fp, &relisted).await.unwrap();
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.raw_payload["status"], "relisted");
    }

    #[tokio::test]
    async fn walk_score_update_touches_only_walkability_fields() {
        let store = SqlitePropertyStore::open_in_memory().await.unwrap();
        let fp = fingerprint("8 Linden Ave");
        let id = store.create_or_update(&fp, &draft("8 Linden Ave", 410_000.0)).await.unwrap();
        let before = store.get(id).await.unwrap().unwrap();
        assert_eq!(before.walk_score, None);

        let walk = WalkScore {
            score: 88,
            description: Some("Very Walkable".into()),
        };
        let after = store.update_walk_score(id, &walk).await.unwrap();
        assert_eq!(after.walk_score, Some(88));
        assert_eq!(after.walk_description.as_deref(), Some("Very Walkable"));
        assert_eq!(after.price, before.price);
        assert_eq!(after.last_updated_at, before.last_updated_at);

        let missing = store.update_walk_score(999, &walk).await;
        assert!(matches!(missing, Err(StorageError::NotFound(999))));
    }

    #[tokio::test]
    async fn pagination_during_concurrent_inserts_never_repeats_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            std::sync::Arc::new(SqlitePropertyStore::open(dir.path().join("live.db")).await.unwrap());
        for i in 0..20 {
            let street = format!("{i} Existing Rd");
            store.create_or_update(&fingerprint(&street), &draft(&street, 1.0)).await.unwrap();
        }

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let street = format!("{i} Incoming Rd");
                    store
                        .create_or_update(&fingerprint(&street), &draft(&street, 1.0))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut cursor = None;
        let mut seen = Vec::new();
        loop {
            let page = store.list_page(cursor, 3).await.unwrap();
            seen.extend(page.items.iter().map(|p| p.id));
            tokio::task::yield_now().await;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        writer.await.unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]), "ids repeated or reordered: {seen:?}");
        for id in 1..=20 {
            assert!(seen.contains(&id), "pre-existing row {id} skipped");
        }
    }
}
