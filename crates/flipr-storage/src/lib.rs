//! Durable + embedded property storage and connection resolution for Flipr.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flipr_core::{
    Address, Cursor, DealRating, Fingerprint, Property, PropertyDraft, PropertyId, PropertyPage,
    ScoreUpdate, StatusCounts, ValidationError, WalkScore,
};
use sqlx::types::Json;
use thiserror::Error;

pub mod descriptor;
pub mod failover;
pub mod postgres;
pub mod resolver;
pub mod sqlite;
pub mod state;

pub use descriptor::{sanitize_descriptor, ConnectionDescriptor};
pub use failover::FailoverStore;
pub use postgres::PostgresPropertyStore;
pub use resolver::{
    ConnectStrategy, ConnectionResolver, DirectUrlStrategy, ParsedDescriptorStrategy,
    ResolverConfig, StorageHandle,
};
pub use sqlite::SqlitePropertyStore;
pub use state::StorageState;

pub const CRATE_NAME: &str = "flipr-storage";

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection error: {0}")]
    Connection(String),
    /// Every pooled connection stayed busy past the acquire timeout.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("duplicate fingerprint conflict: {0}")]
    DuplicateConflict(String),
    #[error("property {0} not found")]
    NotFound(PropertyId),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Transient failure reaching the store, eligible for fallback.
    pub fn is_connection(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }

    /// Either an outage or a saturated pool; only a failed ping tells them apart.
    pub fn may_be_outage(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::PoolExhausted(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => return StorageError::Connection(err.to_string()),
            sqlx::Error::PoolTimedOut => return StorageError::PoolExhausted(err.to_string()),
            sqlx::Error::Configuration(_) => return StorageError::Configuration(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                return StorageError::DuplicateConflict(db.message().to_string())
            }
            // SQLSTATE class 08 (connection exception) and admin shutdown.
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| code.starts_with("08") || code == "57P01") =>
            {
                return StorageError::Connection(err.to_string())
            }
            _ => {}
        }
        StorageError::Query(err)
    }
}

/// Pool sizing shared by both backends. Exhaustion queues callers up to `acquire_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Backend-agnostic paginated property storage.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Bumped whenever the backing store is replaced. Ids and cursors from an
    /// older generation refer to rows the current store may not have.
    fn generation(&self) -> u64 {
        0
    }

    /// Cheap reachability check that bypasses any connection pool.
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Insert when the fingerprint is unseen, else update the listing fields of the existing row.
    async fn create_or_update(
        &self,
        fingerprint: &Fingerprint,
        draft: &PropertyDraft,
    ) -> Result<PropertyId, StorageError>;

    async fn list_page(
        &self,
        cursor: Option<Cursor>,
        page_size: u32,
    ) -> Result<PropertyPage, StorageError>;

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Property>, StorageError>;

    async fn get(&self, id: PropertyId) -> Result<Option<Property>, StorageError>;

    /// Partial update of the score fields only.
    async fn update_score(
        &self,
        id: PropertyId,
        update: &ScoreUpdate,
    ) -> Result<Property, StorageError>;

    /// Partial update of the walkability fields only.
    async fn update_walk_score(
        &self,
        id: PropertyId,
        walk: &WalkScore,
    ) -> Result<Property, StorageError>;

    async fn status_counts(&self) -> Result<StatusCounts, StorageError>;
}

pub fn clamp_page_size(page_size: u32) -> u32 {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

/// Insert-then-update rounds before a fingerprint conflict is surfaced.
pub(crate) const MAX_UPSERT_ATTEMPTS: usize = 3;

/// Column shape shared by the Postgres and SQLite `properties` tables.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PropertyRow {
    id: i64,
    fingerprint: String,
    provider: String,
    external_id: String,
    street: String,
    city: String,
    state: String,
    postal_code: Option<String>,
    latitude: f64,
    longitude: f64,
    price: Option<f64>,
    beds: Option<i32>,
    baths: Option<f64>,
    square_feet: Option<i64>,
    raw_payload_hash: String,
    property_data: Option<Json<serde_json::Value>>,
    first_seen_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    score: Option<f64>,
    deal_rating: Option<String>,
    score_reasoning: Option<String>,
    walk_score: Option<i32>,
    walk_description: Option<String>,
}

impl TryFrom<PropertyRow> for Property {
    type Error = StorageError;

    fn try_from(row: PropertyRow) -> Result<Self, Self::Error> {
        let beds = row
            .beds
            .map(u32::try_from)
            .transpose()
            .map_err(|_| StorageError::InvalidRow(format!("row {} has negative beds", row.id)))?;
        let square_feet = row
            .square_feet
            .map(u32::try_from)
            .transpose()
            .map_err(|_| {
                StorageError::InvalidRow(format!("row {} has out-of-range square_feet", row.id))
            })?;
        let deal_rating = row
            .deal_rating
            .as_deref()
            .map(str::parse::<DealRating>)
            .transpose()
            .map_err(StorageError::InvalidRow)?;
        let walk_score = row
            .walk_score
            .map(u32::try_from)
            .transpose()
            .map_err(|_| {
                StorageError::InvalidRow(format!("row {} has negative walk_score", row.id))
            })?;

        Ok(Property {
            id: row.id,
            fingerprint: Fingerprint::new(row.fingerprint),
            provider: row.provider,
            external_id: row.external_id,
            address: Address {
                street: row.street,
                city: row.city,
                state: row.state,
                postal_code: row.postal_code,
            },
            latitude: row.latitude,
            longitude: row.longitude,
            price: row.price,
            beds,
            baths: row.baths,
            square_feet,
            raw_payload_hash: row.raw_payload_hash,
            raw_payload: row.property_data.map(|Json(value)| value).unwrap_or_default(),
            first_seen_at: row.first_seen_at,
            last_updated_at: row.last_updated_at,
            score: row.score,
            deal_rating,
            score_reasoning: row.score_reasoning,
            walk_score,
            walk_description: row.walk_description,
        })
    }
}

/// Rows were fetched with `LIMIT page_size + 1`; the extra row only signals continuation.
pub(crate) fn page_from_rows(
    mut rows: Vec<PropertyRow>,
    page_size: u32,
) -> Result<PropertyPage, StorageError> {
    let page_size = page_size as usize;
    let has_more = rows.len() > page_size;
    rows.truncate(page_size);
    let items = rows
        .into_iter()
        .map(Property::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let next_cursor = if has_more {
        items.last().map(|p| Cursor::after(p.id))
    } else {
        None
    };
    Ok(PropertyPage { items, next_cursor })
}

pub(crate) fn counts_from_rows(rows: Vec<(Option<String>, i64)>) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for (rating, n) in rows {
        let rating = rating.as_deref().and_then(|r| r.parse::<DealRating>().ok());
        counts.record(rating, n.max(0) as u64);
    }
    counts
}

pub(crate) fn cursor_start(cursor: Option<Cursor>) -> i64 {
    cursor.map(|c| c.last_id()).unwrap_or(0)
}

pub(crate) fn beds_column(draft: &PropertyDraft) -> Option<i32> {
    draft.beds.map(|b| i32::try_from(b).unwrap_or(i32::MAX))
}

pub(crate) fn square_feet_column(draft: &PropertyDraft) -> Option<i64> {
    draft.square_feet.map(i64::from)
}

pub(crate) fn walk_score_column(walk: &WalkScore) -> i32 {
    i32::try_from(walk.score).unwrap_or(i32::MAX)
}
