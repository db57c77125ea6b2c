//! Cross-provider deduplication.
//!
//! Every draft is reduced to a [`Fingerprint`] built from its normalized
//! street, city, state and rounded coordinates. The fingerprint decides whether
//! a listing is new, a changed sighting of a stored property, or an exact
//! duplicate. A bounded LRU cache short-circuits store lookups for recently
//! seen properties; the store stays the source of truth after eviction. The
//! cache is emptied whenever the store reports a new generation, since cached
//! rows then describe a backend that is no longer active.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flipr_core::{DedupOutcome, Fingerprint, Property, PropertyDraft, PropertyId};
use flipr_storage::{PropertyStore, StorageError};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

pub const DEFAULT_COORDINATE_PRECISION: u32 = 4;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
const MAX_COORDINATE_PRECISION: u32 = 8;
const LOCK_STRIPES: usize = 64;

/// Tokens that introduce a unit designator; both are dropped from the street.
const UNIT_QUALIFIERS: &[&str] = &[
    "apt", "apartment", "unit", "suite", "ste", "#", "fl", "floor", "rm", "room", "bldg",
];

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("street", "st"),
    ("avenue", "ave"),
    ("av", "ave"),
    ("boulevard", "blvd"),
    ("road", "rd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("court", "ct"),
    ("place", "pl"),
    ("terrace", "ter"),
    ("parkway", "pkwy"),
    ("highway", "hwy"),
    ("circle", "cir"),
    ("square", "sq"),
    ("trail", "trl"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
    ("northeast", "ne"),
    ("northwest", "nw"),
    ("southeast", "se"),
    ("southwest", "sw"),
];

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Street normalization: unit designators removed, suffixes and directions abbreviated.
pub fn normalize_street(input: &str) -> String {
    let mut spaced = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '#' => spaced.push_str(" # "),
            c if c.is_ascii_alphanumeric() => spaced.push(c.to_ascii_lowercase()),
            _ => spaced.push(' '),
        }
    }

    let mut out = Vec::new();
    let mut tokens = spaced.split_whitespace();
    while let Some(token) = tokens.next() {
        if UNIT_QUALIFIERS.contains(&token) {
            tokens.next();
            continue;
        }
        let token = ABBREVIATIONS
            .iter()
            .find(|(long, _)| *long == token)
            .map(|(_, short)| *short)
            .unwrap_or(token);
        out.push(token);
    }
    out.join(" ")
}

#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    coordinate_precision: u32,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_COORDINATE_PRECISION)
    }
}

impl Fingerprinter {
    pub fn new(coordinate_precision: u32) -> Self {
        Self {
            coordinate_precision: coordinate_precision.min(MAX_COORDINATE_PRECISION),
        }
    }

    pub fn coordinate_precision(&self) -> u32 {
        self.coordinate_precision
    }

    pub fn identity(&self, draft: &PropertyDraft) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            normalize_street(&draft.address.street),
            normalize_key_fragment(&draft.address.city),
            normalize_key_fragment(&draft.address.state),
            self.round(draft.latitude),
            self.round(draft.longitude),
        )
    }

    pub fn fingerprint(&self, draft: &PropertyDraft) -> Fingerprint {
        let digest = Sha256::digest(self.identity(draft).as_bytes());
        Fingerprint::new(hex::encode(digest))
    }

    fn round(&self, value: f64) -> String {
        let scale = 10f64.powi(self.coordinate_precision as i32);
        let mut rounded = (value * scale).round() / scale;
        if rounded == 0.0 {
            // No "-0.0000" component.
            rounded = 0.0;
        }
        format!("{:.*}", self.coordinate_precision as usize, rounded)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    property: Arc<Property>,
    last_seen: DateTime<Utc>,
}

/// Bounded fingerprint → canonical property map, evicting the least recently seen.
pub struct DedupCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    generation: AtomicU64,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
        }
    }

    /// Drop every entry if `generation` differs from the one the cache was filled under.
    /// Returns true when entries were discarded.
    pub fn sync_generation(&self, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.swap(generation, Ordering::AcqRel) == generation {
            return false;
        }
        let dropped = !entries.is_empty();
        entries.clear();
        dropped
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache hit promotes the entry.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Property>> {
        self.entries
            .lock()
            .get(fingerprint)
            .map(|entry| entry.property.clone())
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.lock().contains(fingerprint)
    }

    pub fn last_seen(&self, fingerprint: &Fingerprint) -> Option<DateTime<Utc>> {
        self.entries.lock().peek(fingerprint).map(|e| e.last_seen)
    }

    pub fn put(&self, property: Arc<Property>, seen_at: DateTime<Utc>) {
        let fingerprint = property.fingerprint.clone();
        self.entries.lock().put(
            fingerprint,
            CacheEntry {
                property,
                last_seen: seen_at,
            },
        );
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: DedupOutcome,
    pub property: Arc<Property>,
}

pub struct Deduplicator {
    store: Arc<dyn PropertyStore>,
    fingerprinter: Fingerprinter,
    cache: DedupCache,
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl Deduplicator {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        fingerprinter: Fingerprinter,
        cache_capacity: usize,
    ) -> Self {
        Self {
            store,
            fingerprinter,
            cache: DedupCache::new(cache_capacity),
            stripes: (0..LOCK_STRIPES).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    /// Classify `draft` against what is already stored and persist the result.
    ///
    /// Concurrent calls for the same fingerprint are serialized, so exactly one
    /// of them observes `New`.
    pub async fn resolve(&self, draft: PropertyDraft) -> Result<Resolution, StorageError> {
        draft.validate()?;
        let fingerprint = self.fingerprinter.fingerprint(&draft);
        let _guard = self.stripe(&fingerprint).lock().await;

        let generation = self.store.generation();
        if self.cache.sync_generation(generation) {
            debug!(generation, "storage backend changed; dedup cache cleared");
        }

        let known = match self.cache.get(&fingerprint) {
            Some(property) => Some(property),
            None => self
                .store
                .find_by_fingerprint(&fingerprint)
                .await?
                .map(Arc::new),
        };

        let resolution = match known {
            None => {
                let id = self.store.create_or_update(&fingerprint, &draft).await?;
                Resolution {
                    outcome: DedupOutcome::New,
                    property: self.reload(id).await?,
                }
            }
            Some(current) if current.listing_differs(&draft) => {
                let id = self.store.create_or_update(&fingerprint, &draft).await?;
                Resolution {
                    outcome: DedupOutcome::Updated,
                    property: self.reload(id).await?,
                }
            }
            Some(current) => Resolution {
                outcome: DedupOutcome::Duplicate,
                property: current,
            },
        };

        debug!(
            fingerprint = %fingerprint,
            provider = %draft.provider,
            outcome = ?resolution.outcome,
            "resolved draft"
        );
        if self.store.generation() == generation {
            self.cache.put(resolution.property.clone(), draft.fetched_at);
        }
        Ok(resolution)
    }

    async fn reload(&self, id: PropertyId) -> Result<Arc<Property>, StorageError> {
        self.store
            .get(id)
            .await?
            .map(Arc::new)
            .ok_or(StorageError::NotFound(id))
    }

    fn stripe(&self, fingerprint: &Fingerprint) -> &tokio::sync::Mutex<()> {
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}
