//! Post-dedup enrichment: attach a walk score to properties that lack one.

use std::sync::Arc;

use flipr_adapters::{EnrichmentError, WalkScoreClient};
use flipr_core::Property;
use flipr_storage::{PropertyStore, StorageError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Lookup(#[from] EnrichmentError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct Enricher {
    walk_score: WalkScoreClient,
    store: Arc<dyn PropertyStore>,
}

impl Enricher {
    pub fn new(walk_score: WalkScoreClient, store: Arc<dyn PropertyStore>) -> Self {
        Self { walk_score, store }
    }

    /// Look up and persist a walk score. `Ok(None)` when the property already has one.
    pub async fn enrich(&self, property: &Property) -> Result<Option<Property>, EnrichError> {
        if property.walk_score.is_some() {
            return Ok(None);
        }
        let walk = self.walk_score.lookup(property).await?;
        debug!(id = property.id, score = walk.score, "walk score attached");
        let updated = self.store.update_walk_score(property.id, &walk).await?;
        Ok(Some(updated))
    }
}
