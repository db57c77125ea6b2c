//! Durable PostgreSQL backend.

use async_trait::async_trait;
use flipr_core::{
    Cursor, Fingerprint, Property, PropertyDraft, PropertyId, PropertyPage, ScoreUpdate,
    StatusCounts, WalkScore,
};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Connection;
use tracing::{debug, info};

use crate::{
    beds_column, clamp_page_size, counts_from_rows, cursor_start, page_from_rows,
    square_feet_column, walk_score_column, PoolSettings, PropertyRow, PropertyStore, StorageError,
    MAX_UPSERT_ATTEMPTS,
};

const SCHEMA: [&str; 1] = [r#"
    CREATE TABLE IF NOT EXISTS properties (
        id               BIGSERIAL PRIMARY KEY,
        fingerprint      TEXT NOT NULL,
        provider         TEXT NOT NULL,
        external_id      TEXT NOT NULL,
        street           TEXT NOT NULL,
        city             TEXT NOT NULL,
        state            TEXT NOT NULL,
        postal_code      TEXT,
        latitude         DOUBLE PRECISION NOT NULL,
        longitude        DOUBLE PRECISION NOT NULL,
        price            DOUBLE PRECISION,
        beds             INTEGER,
        baths            DOUBLE PRECISION,
        square_feet      BIGINT,
        raw_payload_hash TEXT NOT NULL,
        first_seen_at    TIMESTAMPTZ NOT NULL,
        last_updated_at  TIMESTAMPTZ NOT NULL,
        score            DOUBLE PRECISION,
        deal_rating      TEXT,
        score_reasoning  TEXT,
        scored_at        TIMESTAMPTZ,
        property_data    JSONB,
        walk_score       INTEGER,
        walk_description TEXT,
        walk_scored_at   TIMESTAMPTZ,
        CONSTRAINT properties_fingerprint_key UNIQUE (fingerprint)
    )
    "#];

const SELECT_COLUMNS: &str = "id, fingerprint, provider, external_id, street, city, state, \
     postal_code, latitude, longitude, price, beds, baths, square_feet, raw_payload_hash, \
     property_data, first_seen_at, last_updated_at, score, deal_rating, score_reasoning, \
     walk_score, walk_description";

pub struct PostgresPropertyStore {
    pool: PgPool,
}

impl PostgresPropertyStore {
    /// Connect with the raw descriptor, letting the driver parse it.
    pub async fn connect_url(url: &str, settings: PoolSettings) -> Result<Self, StorageError> {
        let pool = pool_options(settings).connect(url).await?;
        Self::from_pool(pool).await
    }

    pub async fn connect_with(
        opts: PgConnectOptions,
        settings: PoolSettings,
    ) -> Result<Self, StorageError> {
        let pool = pool_options(settings).connect_with(opts).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self, StorageError> {
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bootstrap(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("postgres properties table ready");
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $16,
                    $15, $15)
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
               SET price = $2,
                   beds = $3,
                   baths = $4,
                   square_feet = $5,
                   raw_payload_hash = $6,
                   last_updated_at = $7,
                   property_data = $8
             WHERE fingerprint = $1
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

fn pool_options(settings: PoolSettings) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(settings.acquire_timeout)
}

#[async_trait]
impl PropertyStore for PostgresPropertyStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let opts = self.pool.connect_options();
        let limit = self.pool.options().get_acquire_timeout();
        let conn = tokio::time::timeout(limit, PgConnection::connect_with(&opts))
            .await
            .map_err(|_| StorageError::Connection(format!("ping timed out after {limit:?}")))??;
        conn.close().await?;
        Ok(())
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
                    debug!(%fingerprint, "insert raced an existing row; updating instead");
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
            "SELECT {SELECT_COLUMNS} FROM properties WHERE id > $1 ORDER BY id ASC LIMIT $2"
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
            "SELECT {SELECT_COLUMNS} FROM properties WHERE fingerprint = $1"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Property::try_from)
        .transpose()
    }

    async fn get(&self, id: PropertyId) -> Result<Option<Property>, StorageError> {
        sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM properties WHERE id = $1"
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
               SET score = $2,
                   deal_rating = $3,
                   score_reasoning = $4,
                   scored_at = NOW()
             WHERE id = $1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.score)
        .bind(update.rating().as_str())
        .bind(&update.reasoning)
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
               SET walk_score = $2,
                   walk_description = $3,
                   walk_scored_at = NOW()
             WHERE id = $1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(walk_score_column(walk))
        .bind(&walk.description)
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
    //! Runs only when `FLIPR_TEST_DATABASE_URL` points at a disposable database.

    use super::*;
    use crate::test_support::{draft, fingerprint};

    async fn store() -> Option<PostgresPropertyStore> {
        let url = std::env::var("FLIPR_TEST_DATABASE_URL").ok()?;
        let store = PostgresPropertyStore::connect_url(&url, PoolSettings::default())
            .await
            .expect("connect test database");
        sqlx::query("TRUNCATE properties RESTART IDENTITY")
            .execute(store.pool())
            .await
            .expect("truncate");
        Some(store)
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_fingerprint() {
        let Some(store) = store().await else { return };
        let fp = fingerprint("1 Elm St");
        let first = store.create_or_update(&fp, &draft("1 Elm St", 100.0)).await.unwrap();
        let second = store.create_or_update(&fp, &draft("1 Elm St", 120.0)).await.unwrap();
        assert_eq!(first, second);
        let stored = store.find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert_eq!(stored.price, Some(120.0));
        assert_eq!(store.status_counts().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn keyset_pages_cover_every_row_once() {
        let Some(store) = store().await else { return };
        for i in 0..7 {
            let street = format!("{i} Oak Ave");
            store
                .create_or_update(&fingerprint(&street), &draft(&street, 1.0))
                .await
                .unwrap();
        }
        let mut cursor = None;
        let mut seen = Vec::new();
        loop {
            let page = store.list_page(cursor, 3).await.unwrap();
            seen.extend(page.items.iter().map(|p| p.id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, (1..=7).collect::<Vec<_>>());
    }
}
