//! Provider adapter contracts, preset normalization rules, and the rate-limited fetch client.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use flipr_core::{Address, PropertyDraft};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod fetch;
pub mod walkscore;

pub use fetch::{
    BackoffPolicy, BackoffState, FetchClient, FetchClientConfig, FetchError, FetchedPayload,
    ProviderLimiter, ProviderLimits, ProviderTransport, RateLimiterRegistry, ReqwestTransport,
    RetryDisposition, TokenBucket, TransportError, TransportResponse,
};
pub use reqwest::StatusCode;
pub use walkscore::{
    parse_walk_score, EnrichmentError, WalkScoreClient, DEFAULT_WALK_SCORE_ENDPOINT,
    WALK_SCORE_CREDENTIAL_ENV, WALK_SCORE_PROVIDER,
};

pub const CRATE_NAME: &str = "flipr-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("provider {provider} is missing credentials: {detail}")]
    MissingCredentials { provider: String, detail: String },
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("unknown preset {0:?}")]
    UnknownPreset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    ApiKey(String),
    Basic { username: String, password: String },
    Bearer(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::ApiKey(_) => f.write_str("ApiKey(*****)"),
            Credentials::Basic { username, .. } => write!(f, "Basic({username}:*****)"),
            Credentials::Bearer(_) => f.write_str("Bearer(*****)"),
        }
    }
}

/// One outbound provider call, fully described so any transport can send it.
#[derive(Clone)]
pub struct ProviderRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub json_body: Option<JsonValue>,
}

impl ProviderRequest {
    fn new(method: HttpMethod, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            query: Vec::new(),
            basic_auth: None,
            json_body: None,
        }
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn param(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }
}

impl fmt::Debug for ProviderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        let query: Vec<(&str, &str)> = self
            .query
            .iter()
            .map(|(k, v)| {
                let secret = k.to_ascii_lowercase().contains("key");
                (k.as_str(), if secret { "*****" } else { v.as_str() })
            })
            .collect();
        f.debug_struct("ProviderRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &header_names)
            .field("query", &query)
            .field("basic_auth", &self.basic_auth.as_ref().map(|(user, _)| user))
            .field("json_body", &self.json_body)
            .finish()
    }
}

/// Normalized result of one provider page.
#[derive(Debug, Clone, Default)]
pub struct NormalizedPage {
    pub drafts: Vec<PropertyDraft>,
    /// Raw records present in the payload; zero means the provider has no more data.
    pub record_count: usize,
    /// Records dropped for lacking a street or coordinates.
    pub skipped: usize,
}

pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Highest page the provider can serve for one query, if it paginates at all.
    fn page_limit(&self) -> Option<u32> {
        None
    }

    fn build_request(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<ProviderRequest, AdapterError>;

    fn normalize(
        &self,
        payload: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<NormalizedPage, AdapterError>;
}

/// Built-in request shape and field mapping for a known provider API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Attom,
    Rentcast,
    #[serde(alias = "oxylabs")]
    Redfin,
    Datafiniti,
}

/// JSON pointers tried in order for each field of a provider record.
#[derive(Debug)]
pub struct NormalizationRules {
    pub records: &'static [&'static str],
    pub external_id: &'static [&'static str],
    pub street: &'static [&'static str],
    pub city: &'static [&'static str],
    pub state: &'static [&'static str],
    pub postal_code: &'static [&'static str],
    pub latitude: &'static [&'static str],
    pub longitude: &'static [&'static str],
    pub price: &'static [&'static str],
    pub beds: &'static [&'static str],
    pub baths: &'static [&'static str],
    pub square_feet: &'static [&'static str],
}

const ATTOM_RULES: NormalizationRules = NormalizationRules {
    records: &["/property"],
    external_id: &["/identifier/attomId", "/identifier/Id"],
    street: &["/address/line1", "/address/oneLine"],
    city: &["/address/locality"],
    state: &["/address/countrySubd"],
    postal_code: &["/address/postal1"],
    latitude: &["/location/latitude", "/latitude", "/lat"],
    longitude: &["/location/longitude", "/longitude", "/lng"],
    price: &["/sale/amount/saleamt", "/assessment/market/mktttlvalue"],
    beds: &["/building/rooms/beds"],
    baths: &["/building/rooms/bathstotal"],
    square_feet: &["/building/size/universalsize", "/building/size/livingsize"],
};

const RENTCAST_RULES: NormalizationRules = NormalizationRules {
    records: &["/properties", ""],
    external_id: &["/id"],
    street: &["/addressLine1", "/formattedAddress"],
    city: &["/city"],
    state: &["/state"],
    postal_code: &["/zipCode"],
    latitude: &["/latitude", "/lat"],
    longitude: &["/longitude", "/lng"],
    price: &["/lastSalePrice", "/price"],
    beds: &["/bedrooms"],
    baths: &["/bathrooms"],
    square_feet: &["/squareFootage"],
};

const REDFIN_RULES: NormalizationRules = NormalizationRules {
    records: &["/results"],
    external_id: &["/id", "/property_id", "/url"],
    street: &["/address/street", "/address/streetAddress", "/address"],
    city: &["/address/city", "/city"],
    state: &["/address/state", "/state"],
    postal_code: &["/address/zip", "/zip"],
    latitude: &["/latitude", "/lat", "/location/latitude"],
    longitude: &["/longitude", "/lng", "/location/longitude"],
    price: &["/price", "/listPrice"],
    beds: &["/beds"],
    baths: &["/baths"],
    square_feet: &["/sqft", "/sqFt"],
};

const DATAFINITI_RULES: NormalizationRules = NormalizationRules {
    records: &["/records"],
    external_id: &["/id"],
    street: &["/address"],
    city: &["/city"],
    state: &["/province"],
    postal_code: &["/postalCode"],
    latitude: &["/latitude"],
    longitude: &["/longitude"],
    price: &["/mostRecentPriceAmount", "/prices/0/amountMax"],
    beds: &["/numBedroom"],
    baths: &["/numBathroom"],
    square_feet: &["/floorSizeValue"],
};

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Attom => "attom",
            Preset::Rentcast => "rentcast",
            Preset::Redfin => "redfin",
            Preset::Datafiniti => "datafiniti",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Preset::Attom => {
                "https://api.gateway.attomdata.com/propertyapi/v1.0.0/property/address"
            }
            Preset::Rentcast => "https://api.rentcast.io/v1/properties",
            Preset::Redfin => "https://realtime.oxylabs.io/v1/queries",
            Preset::Datafiniti => "https://api.datafiniti.co/v4/properties/search",
        }
    }

    /// Environment variables holding credentials, in the order `credentials_from` expects.
    pub fn default_credential_env(&self) -> &'static [&'static str] {
        match self {
            Preset::Attom => &["ATTOM_API_KEY"],
            Preset::Rentcast => &["RENTCAST_API_KEY"],
            Preset::Redfin => &["OXYLABS_USER", "OXYLABS_PASS"],
            Preset::Datafiniti => &["DATAFINITI_API_KEY"],
        }
    }

    pub fn credentials_from(&self, values: &[String]) -> Option<Credentials> {
        let non_empty = |i: usize| values.get(i).map(|v| v.trim()).filter(|v| !v.is_empty());
        match self {
            Preset::Attom | Preset::Rentcast => non_empty(0).map(|k| Credentials::ApiKey(k.into())),
            Preset::Redfin => Some(Credentials::Basic {
                username: non_empty(0)?.into(),
                password: non_empty(1)?.into(),
            }),
            Preset::Datafiniti => non_empty(0).map(|t| Credentials::Bearer(t.into())),
        }
    }

    pub fn rules(&self) -> &'static NormalizationRules {
        match self {
            Preset::Attom => &ATTOM_RULES,
            Preset::Rentcast => &RENTCAST_RULES,
            Preset::Redfin => &REDFIN_RULES,
            Preset::Datafiniti => &DATAFINITI_RULES,
        }
    }
}

impl FromStr for Preset {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attom" => Ok(Preset::Attom),
            "rentcast" => Ok(Preset::Rentcast),
            "redfin" | "oxylabs" => Ok(Preset::Redfin),
            "datafiniti" => Ok(Preset::Datafiniti),
            other => Err(AdapterError::UnknownPreset(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresetAdapter {
    provider_id: String,
    preset: Preset,
    endpoint: String,
    credentials: Credentials,
}

impl PresetAdapter {
    pub fn new(
        provider_id: impl Into<String>,
        preset: Preset,
        endpoint: Option<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            preset,
            endpoint: endpoint.unwrap_or_else(|| preset.default_endpoint().to_string()),
            credentials,
        }
    }

    fn missing(&self, detail: &str) -> AdapterError {
        AdapterError::MissingCredentials {
            provider: self.provider_id.clone(),
            detail: detail.to_string(),
        }
    }
}

impl ProviderAdapter for PresetAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn page_limit(&self) -> Option<u32> {
        // Datafiniti search has no paging; every page would repeat the first.
        (self.preset == Preset::Datafiniti).then_some(1)
    }

    fn build_request(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<ProviderRequest, AdapterError> {
        let page = page.max(1);
        let request = match (self.preset, &self.credentials) {
            (Preset::Attom, Credentials::ApiKey(key)) => {
                ProviderRequest::new(HttpMethod::Get, &self.endpoint)
                    .header("apikey", key)
                    .header("Accept", "application/json")
                    .param("address", query)
                    .param("page", page)
                    .param("pageSize", page_size)
            }
            (Preset::Rentcast, Credentials::ApiKey(key)) => {
                ProviderRequest::new(HttpMethod::Get, &self.endpoint)
                    .header("X-Api-Key", key)
                    .param("address", query)
                    .param("limit", page_size)
                    .param("offset", u64::from(page - 1) * u64::from(page_size))
            }
            (Preset::Redfin, Credentials::Basic { username, password }) => {
                let mut request = ProviderRequest::new(HttpMethod::Post, &self.endpoint);
                request.basic_auth = Some((username.clone(), password.clone()));
                request.json_body = Some(json!({
                    "source": "redfin",
                    "query": query,
                    "geo_location": query,
                    "parse": true,
                    "page": page,
                }));
                request
            }
            (Preset::Datafiniti, Credentials::Bearer(token)) => {
                let city = query.split(',').next().unwrap_or(query).trim();
                let mut request = ProviderRequest::new(HttpMethod::Post, &self.endpoint)
                    .header("Authorization", &format!("Bearer {token}"))
                    .header("Content-Type", "application/json");
                request.json_body = Some(json!({
                    "query": format!("city:\"{city}\""),
                    "format": "JSON",
                    "num_records": page_size,
                }));
                request
            }
            (preset, _) => {
                return Err(self.missing(&format!(
                    "{} expects {}",
                    preset.as_str(),
                    preset.default_credential_env().join(" + ")
                )))
            }
        };
        Ok(request)
    }

    fn normalize(
        &self,
        payload: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<NormalizedPage, AdapterError> {
        let value: JsonValue = serde_json::from_slice(payload)?;
        let rules = self.preset.rules();
        let records = rules
            .records
            .iter()
            .filter_map(|pointer| value.pointer(pointer))
            .find_map(JsonValue::as_array);
        let Some(records) = records else {
            return Ok(NormalizedPage::default());
        };

        let mut page = NormalizedPage {
            record_count: records.len(),
            ..NormalizedPage::default()
        };
        for record in records {
            match draft_from_record(&self.provider_id, rules, record, fetched_at) {
                Some(draft) => page.drafts.push(draft),
                None => page.skipped += 1,
            }
        }
        Ok(page)
    }
}

fn draft_from_record(
    provider: &str,
    rules: &NormalizationRules,
    record: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Option<PropertyDraft> {
    let street = text_at(record, rules.street)?;
    let latitude = number_at(record, rules.latitude)?;
    let longitude = number_at(record, rules.longitude)?;
    let raw_payload_hash = payload_hash(record);
    let external_id = text_at(record, rules.external_id)
        .unwrap_or_else(|| format!("{provider}-{}", &raw_payload_hash[..16]));

    Some(PropertyDraft {
        provider: provider.to_string(),
        external_id,
        address: Address {
            street,
            city: text_at(record, rules.city).unwrap_or_default(),
            state: text_at(record, rules.state).unwrap_or_default(),
            postal_code: text_at(record, rules.postal_code),
        },
        latitude,
        longitude,
        price: number_at(record, rules.price),
        beds: count_at(record, rules.beds),
        baths: number_at(record, rules.baths),
        square_feet: count_at(record, rules.square_feet),
        raw_payload_hash,
        raw_payload: record.clone(),
        fetched_at,
    })
}

/// SHA-256 of the record's canonical JSON encoding.
pub fn payload_hash(record: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn text_at(record: &JsonValue, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|pointer| match record.pointer(pointer)? {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn number_at(record: &JsonValue, pointers: &[&str]) -> Option<f64> {
    pointers.iter().find_map(|pointer| match record.pointer(pointer)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    })
}

fn count_at(record: &JsonValue, pointers: &[&str]) -> Option<u32> {
    number_at(record, pointers)
        .filter(|n| n.is_finite() && *n >= 0.0 && *n <= f64::from(u32::MAX))
        .map(|n| n.round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 9, 30, 0).single().unwrap()
    }

    fn adapter(preset: Preset, credentials: Credentials) -> PresetAdapter {
        PresetAdapter::new(preset.as_str(), preset, None, credentials)
    }

    #[test]
    fn attom_payload_normalizes_nested_fields() {
        let payload = json!({
            "status": {"code": 0},
            "property": [{
                "identifier": {"attomId": 184713191},
                "address": {"line1": "4529 Winona Ct", "locality": "Denver",
                            "countrySubd": "CO", "postal1": "80212"},
                "location": {"latitude": "39.7781", "longitude": "-105.0465"},
                "sale": {"amount": {"saleamt": 615000}},
                "building": {"rooms": {"beds": 3, "bathstotal": 2.5},
                             "size": {"universalsize": 1862}}
            }]
        });
        let page = adapter(Preset::Attom, Credentials::ApiKey("k".into()))
            .normalize(payload.to_string().as_bytes(), fetched_at())
            .unwrap();

        assert_eq!(page.record_count, 1);
        let draft = &page.drafts[0];
        assert_eq!(draft.external_id, "184713191");
        assert_eq!(draft.address.street, "4529 Winona Ct");
        assert_eq!(draft.address.postal_code.as_deref(), Some("80212"));
        assert_eq!(draft.latitude, 39.7781);
        assert_eq!(draft.price, Some(615_000.0));
        assert_eq!(draft.beds, Some(3));
        assert_eq!(draft.baths, Some(2.5));
        assert_eq!(draft.square_feet, Some(1_862));
        assert_eq!(draft.raw_payload_hash.len(), 64);
        assert_eq!(draft.raw_payload["identifier"]["attomId"], 184713191);
        assert_eq!(draft.raw_payload_hash, payload_hash(&draft.raw_payload));
    }

    #[test]
    fn records_without_coordinates_are_skipped() {
        let payload = json!({
            "properties": [
                {"id": "a", "addressLine1": "1 Main St", "city": "Austin", "state": "TX",
                 "latitude": 30.1, "longitude": -97.7, "lastSalePrice": "$410,000"},
                {"id": "b", "addressLine1": "2 Main St", "city": "Austin", "state": "TX"}
            ]
        });
        let page = adapter(Preset::Rentcast, Credentials::ApiKey("k".into()))
            .normalize(payload.to_string().as_bytes(), fetched_at())
            .unwrap();
        assert_eq!(page.record_count, 2);
        assert_eq!(page.skipped, 1);
        assert_eq!(page.drafts[0].price, Some(410_000.0));
    }

    #[test]
    fn redfin_and_datafiniti_shapes_normalize() {
        let redfin = json!({"results": [{
            "id": 77, "address": {"street": "9 Elm St", "city": "Boise", "state": "ID", "zip": "83702"},
            "lat": 43.61, "lng": -116.2, "price": 450000, "beds": 4, "baths": 3, "sqft": 2100
        }]});
        let page = adapter(Preset::Redfin, Credentials::None)
            .normalize(redfin.to_string().as_bytes(), fetched_at())
            .unwrap();
        assert_eq!(page.drafts[0].address.city, "Boise");
        assert_eq!(page.drafts[0].longitude, -116.2);

        let datafiniti = json!({"num_found": 1, "records": [{
            "id": "AV-1", "address": "18 Oak Ave", "city": "Tampa", "province": "FL",
            "postalCode": "33602", "latitude": "27.95", "longitude": "-82.45",
            "mostRecentPriceAmount": 389000, "numBedroom": 3, "numBathroom": 2,
            "floorSizeValue": 1540
        }]});
        let page = adapter(Preset::Datafiniti, Credentials::None)
            .normalize(datafiniti.to_string().as_bytes(), fetched_at())
            .unwrap();
        assert_eq!(page.drafts[0].address.state, "FL");
        assert_eq!(page.drafts[0].square_feet, Some(1_540));
    }

    #[test]
    fn missing_records_array_reads_as_an_empty_page() {
        let page = adapter(Preset::Attom, Credentials::None)
            .normalize(br#"{"status": {"msg": "SuccessWithoutResult"}}"#, fetched_at())
            .unwrap();
        assert_eq!(page.record_count, 0);
        assert!(page.drafts.is_empty());

        let err = adapter(Preset::Attom, Credentials::None).normalize(b"<html>", fetched_at());
        assert!(matches!(err, Err(AdapterError::InvalidPayload(_))));
    }

    #[test]
    fn requests_follow_each_provider_shape() {
        let attom = adapter(Preset::Attom, Credentials::ApiKey("ak".into()))
            .build_request("Denver, CO", 2, 50)
            .unwrap();
        assert_eq!(attom.method, HttpMethod::Get);
        assert!(attom.headers.contains(&("apikey".into(), "ak".into())));
        assert!(attom.query.contains(&("page".into(), "2".into())));
        assert!(attom.query.contains(&("pageSize".into(), "50".into())));

        let rentcast = adapter(Preset::Rentcast, Credentials::ApiKey("rk".into()))
            .build_request("Austin, TX", 3, 50)
            .unwrap();
        assert!(rentcast.query.contains(&("offset".into(), "100".into())));

        let redfin = adapter(
            Preset::Redfin,
            Credentials::Basic {
                username: "u".into(),
                password: "p".into(),
            },
        )
        .build_request("Boise, ID", 1, 25)
        .unwrap();
        assert_eq!(redfin.method, HttpMethod::Post);
        assert_eq!(redfin.json_body.as_ref().unwrap()["source"], "redfin");
        assert!(!format!("{redfin:?}").contains("\"p\""));

        let datafiniti = adapter(Preset::Datafiniti, Credentials::Bearer("t".into()))
            .build_request("Tampa, FL", 1, 25)
            .unwrap();
        assert_eq!(datafiniti.json_body.as_ref().unwrap()["query"], "city:\"Tampa\"");
        assert_eq!(
            adapter(Preset::Datafiniti, Credentials::None).page_limit(),
            Some(1)
        );
    }

    #[test]
    fn mismatched_credentials_are_rejected() {
        let err = adapter(Preset::Redfin, Credentials::ApiKey("x".into()))
            .build_request("Boise", 1, 10)
            .unwrap_err();
        assert!(err.to_string().contains("OXYLABS_USER"));
        assert_eq!(
            Preset::Redfin.credentials_from(&["user".into()]),
            None,
            "basic auth needs both halves"
        );
        assert_eq!("Oxylabs".parse::<Preset>().unwrap(), Preset::Redfin);
    }
}
