//! Core domain model for the Flipr property ingestion engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "flipr-core";

/// System-generated row identifier. Also the stable pagination key.
pub type PropertyId = i64;

/// Stable, provider-independent identity of a physical property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: Option<String>,
}

impl Address {
    pub fn one_line(&self) -> String {
        let mut line = self.street.trim().to_string();
        for part in [self.city.trim(), self.state.trim()] {
            if !part.is_empty() {
                if !line.is_empty() {
                    line.push_str(", ");
                }
                line.push_str(part);
            }
        }
        if let Some(postal) = self.postal_code.as_deref().map(str::trim) {
            if !postal.is_empty() {
                line.push(' ');
                line.push_str(postal);
            }
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("coordinates ({latitude}, {longitude}) are not finite in-range degrees")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error("listing has no street address")]
    MissingStreet,
    #[error("listing has no provider name")]
    MissingProvider,
    #[error("score {0} outside [0, 1]")]
    ScoreOutOfRange(f64),
}

/// Normalized handoff contract from provider adapters into deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDraft {
    pub provider: String,
    pub external_id: String,
    pub address: Address,
    pub latitude: f64,
    pub longitude: f64,
    pub price: Option<f64>,
    pub beds: Option<u32>,
    pub baths: Option<f64>,
    pub square_feet: Option<u32>,
    pub raw_payload_hash: String,
    /// Provider record as received, persisted alongside the normalized fields.
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl PropertyDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.provider.trim().is_empty() {
            return Err(ValidationError::MissingProvider);
        }
        if self.address.street.trim().is_empty() {
            return Err(ValidationError::MissingStreet);
        }
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lng_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if !(lat_ok && lng_ok) {
            return Err(ValidationError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }
        Ok(())
    }
}

/// Canonical persisted property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub fingerprint: Fingerprint,
    pub provider: String,
    pub external_id: String,
    pub address: Address,
    pub latitude: f64,
    pub longitude: f64,
    pub price: Option<f64>,
    pub beds: Option<u32>,
    pub baths: Option<f64>,
    pub square_feet: Option<u32>,
    pub raw_payload_hash: String,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub score: Option<f64>,
    pub deal_rating: Option<DealRating>,
    pub score_reasoning: Option<String>,
    pub walk_score: Option<u32>,
    pub walk_description: Option<String>,
}

const FIELD_EPSILON: f64 = 1e-6;

fn float_field_changed(stored: Option<f64>, incoming: Option<f64>) -> bool {
    match (stored, incoming) {
        (Some(a), Some(b)) => (a - b).abs() > FIELD_EPSILON,
        (None, None) => false,
        _ => true,
    }
}

impl Property {
    /// True when any mutable listing field of `draft` differs from the stored row.
    pub fn listing_differs(&self, draft: &PropertyDraft) -> bool {
        float_field_changed(self.price, draft.price)
            || float_field_changed(self.baths, draft.baths)
            || self.beds != draft.beds
            || self.square_feet != draft.square_feet
    }
}

/// Deal quality band derived from an AI score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealRating {
    Hot,
    Good,
    Average,
    BelowAverage,
    Weak,
}

impl DealRating {
    pub const ALL: [DealRating; 5] = [
        DealRating::Hot,
        DealRating::Good,
        DealRating::Average,
        DealRating::BelowAverage,
        DealRating::Weak,
    ];

    pub fn from_score(score: f64) -> Self {
        if score > 0.8 {
            DealRating::Hot
        } else if score > 0.6 {
            DealRating::Good
        } else if score > 0.4 {
            DealRating::Average
        } else if score > 0.2 {
            DealRating::BelowAverage
        } else {
            DealRating::Weak
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DealRating::Hot => "hot",
            DealRating::Good => "good",
            DealRating::Average => "average",
            DealRating::BelowAverage => "below_average",
            DealRating::Weak => "weak",
        }
    }
}

impl FromStr for DealRating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DealRating::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown deal rating {s:?}"))
    }
}

/// Partial write-back from the scoring collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub score: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl ScoreUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.score.is_finite() && (0.0..=1.0).contains(&self.score) {
            Ok(())
        } else {
            Err(ValidationError::ScoreOutOfRange(self.score))
        }
    }

    pub fn rating(&self) -> DealRating {
        DealRating::from_score(self.score)
    }
}

/// Walkability result attached to a property after ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkScore {
    pub score: u32,
    #[serde(default)]
    pub description: Option<String>,
}

/// Continuation token for keyset pagination: the last id already returned,
/// tagged with the storage generation that issued it. Rendered as `id` for
/// generation zero and `generation.id` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cursor {
    generation: u64,
    last_id: PropertyId,
}

impl Cursor {
    pub fn after(id: PropertyId) -> Self {
        Self {
            generation: 0,
            last_id: id,
        }
    }

    pub fn issued_by(self, generation: u64) -> Self {
        Self { generation, ..self }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_id(&self) -> PropertyId {
        self.last_id
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "{}", self.last_id)
        } else {
            write!(f, "{}.{}", self.generation, self.last_id)
        }
    }
}

impl FromStr for Cursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid cursor {s:?}");
        let (generation, id) = match s.trim().split_once('.') {
            Some((generation, id)) => (generation.parse::<u64>().map_err(|_| invalid())?, id),
            None => (0, s.trim()),
        };
        match id.parse::<PropertyId>() {
            Ok(last_id) if last_id >= 0 => Ok(Self {
                generation,
                last_id,
            }),
            _ => Err(invalid()),
        }
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.to_string()
    }
}

impl TryFrom<String> for Cursor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyPage {
    pub items: Vec<Property>,
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Unresolved,
    Durable,
    Fallback,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Unresolved => "unresolved",
            StorageMode::Durable => "durable",
            StorageMode::Fallback => "fallback",
        }
    }
}

/// Payload for the health-check endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub storage_mode: StorageMode,
    pub backend: String,
    pub last_connection_ok: bool,
    pub last_error: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupOutcome {
    New,
    Updated,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub hot: u64,
    pub good: u64,
    pub average: u64,
    pub below_average: u64,
    pub weak: u64,
    pub unscored: u64,
}

impl StatusCounts {
    pub fn record(&mut self, rating: Option<DealRating>, count: u64) {
        self.total += count;
        let slot = match rating {
            Some(DealRating::Hot) => &mut self.hot,
            Some(DealRating::Good) => &mut self.good,
            Some(DealRating::Average) => &mut self.average,
            Some(DealRating::BelowAverage) => &mut self.below_average,
            Some(DealRating::Weak) => &mut self.weak,
            None => &mut self.unscored,
        };
        *slot += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> PropertyDraft {
        PropertyDraft {
            provider: "rentcast".into(),
            external_id: "rc-1".into(),
            address: Address {
                street: "12 Main St".into(),
                city: "Austin".into(),
                state: "TX".into(),
                postal_code: Some("78701".into()),
            },
            latitude: 30.2672,
            longitude: -97.7431,
            price: Some(450_000.0),
            beds: Some(3),
            baths: Some(2.0),
            square_feet: Some(1_800),
            raw_payload_hash: "abc".into(),
            raw_payload: serde_json::json!({"id": "rc-1"}),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn drafts_reject_non_finite_coordinates() {
        let mut d = draft();
        assert!(d.validate().is_ok());
        d.latitude = f64::NAN;
        assert!(matches!(d.validate(), Err(ValidationError::InvalidCoordinates { .. })));
        d.latitude = 91.0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn deal_rating_bands_match_score_thresholds() {
        assert_eq!(DealRating::from_score(0.95), DealRating::Hot);
        assert_eq!(DealRating::from_score(0.8), DealRating::Good);
        assert_eq!(DealRating::from_score(0.5), DealRating::Average);
        assert_eq!(DealRating::from_score(0.3), DealRating::BelowAverage);
        assert_eq!(DealRating::from_score(0.0), DealRating::Weak);
        assert_eq!("below_average".parse::<DealRating>(), Ok(DealRating::BelowAverage));
    }

    #[test]
    fn cursor_round_trips_through_its_token() {
        let cursor = Cursor::after(42);
        assert_eq!(cursor.to_string().parse::<Cursor>(), Ok(cursor));
        assert!("-3".parse::<Cursor>().is_err());
        assert!("abc".parse::<Cursor>().is_err());
    }

    #[test]
    fn cursor_carries_the_issuing_generation() {
        let cursor = Cursor::after(42).issued_by(3);
        assert_eq!(cursor.to_string(), "3.42");
        let parsed: Cursor = "3.42".parse().unwrap();
        assert_eq!(parsed.generation(), 3);
        assert_eq!(parsed.last_id(), 42);
        assert_eq!("42".parse::<Cursor>().unwrap().generation(), 0);
        assert!("x.42".parse::<Cursor>().is_err());
        assert!("3.-1".parse::<Cursor>().is_err());

        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(json, "\"3.42\"");
        assert_eq!(serde_json::from_str::<Cursor>(&json).unwrap(), cursor);
    }

    #[test]
    fn drafts_without_a_raw_payload_still_deserialize() {
        let mut value = serde_json::to_value(draft()).unwrap();
        value.as_object_mut().unwrap().remove("raw_payload");
        let parsed: PropertyDraft = serde_json::from_value(value).unwrap();
        assert!(parsed.raw_payload.is_null());
    }

    #[test]
    fn one_line_address_skips_missing_parts() {
        let mut address = draft().address;
        assert_eq!(address.one_line(), "12 Main St, Austin, TX 78701");
        address.postal_code = None;
        address.state.clear();
        assert_eq!(address.one_line(), "12 Main St, Austin");
    }
}
