//! Walk Score lookups used to enrich freshly ingested properties.
//!
//! Calls go through the shared [`FetchClient`] under their own provider id, so
//! they get the same token bucket, retry and concurrency treatment as listing
//! crawls.

use std::sync::Arc;

use flipr_core::{Property, WalkScore};
use serde::Deserialize;
use thiserror::Error;

use crate::{FetchClient, FetchError, HttpMethod, ProviderRequest};

pub const WALK_SCORE_PROVIDER: &str = "walkscore";
pub const DEFAULT_WALK_SCORE_ENDPOINT: &str = "https://api.walkscore.com/score";
pub const WALK_SCORE_CREDENTIAL_ENV: &str = "WALK_SCORE_API_KEY";

/// Walk Score's "score available" status code.
const STATUS_OK: i64 = 1;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("walk score payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("walk score unavailable (status {0})")]
    Unavailable(i64),
    #[error("walk score response carried no score")]
    MissingScore,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    walkscore: Option<f64>,
    #[serde(default)]
    description: Option<String>,
}

pub struct WalkScoreClient {
    fetch: Arc<FetchClient>,
    endpoint: String,
    api_key: String,
}

impl WalkScoreClient {
    pub fn new(fetch: Arc<FetchClient>, api_key: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            fetch,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_WALK_SCORE_ENDPOINT.to_string()),
            api_key: api_key.into(),
        }
    }

    pub fn build_request(&self, property: &Property) -> ProviderRequest {
        ProviderRequest::new(HttpMethod::Get, &self.endpoint)
            .param("format", "json")
            .param("address", property.address.one_line())
            .param("lat", property.latitude)
            .param("lon", property.longitude)
            .param("wsapikey", &self.api_key)
    }

    pub async fn lookup(&self, property: &Property) -> Result<WalkScore, EnrichmentError> {
        let request = self.build_request(property);
        let payload = self.fetch.fetch(WALK_SCORE_PROVIDER, &request).await?;
        parse_walk_score(&payload.body)
    }
}

pub fn parse_walk_score(body: &[u8]) -> Result<WalkScore, EnrichmentError> {
    let response: ScoreResponse = serde_json::from_slice(body)?;
    if let Some(status) = response.status.filter(|s| *s != STATUS_OK) {
        return Err(EnrichmentError::Unavailable(status));
    }
    let score = response
        .walkscore
        .filter(|s| s.is_finite())
        .ok_or(EnrichmentError::MissingScore)?;
    Ok(WalkScore {
        score: score.round().clamp(0.0, 100.0) as u32,
        description: response.description.filter(|d| !d.trim().is_empty()),
    })
}
