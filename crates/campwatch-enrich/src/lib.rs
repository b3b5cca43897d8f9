//! Place-search and geocode lookups plus the sequential enrichment pass.

use std::time::Duration;

use anyhow::Context;
use campwatch_core::{EnrichmentPatch, EnrichmentSummary};
use campwatch_store::{EnrichmentScope, RecordStore, StoreError, StoredRecord};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "campwatch-enrich";

const DEFAULT_BASE_URL: &str = "https://openapi.naver.com";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("lookup status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
    pub pace_delay: Duration,
}

impl LookupConfig {
    /// Credentials are required; everything else falls back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            base_url: std::env::var("PLACE_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            client_id: std::env::var("PLACE_API_CLIENT_ID")
                .context("PLACE_API_CLIENT_ID is not set")?,
            client_secret: std::env::var("PLACE_API_CLIENT_SECRET")
                .context("PLACE_API_CLIENT_SECRET is not set")?,
            timeout: Duration::from_secs(
                std::env::var("CAMPWATCH_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            pace_delay: Duration::from_millis(
                std::env::var("CAMPWATCH_ENRICH_PACE_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            ),
        })
    }
}

/// Best match from the place-search capability.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceMatch {
    pub address: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceSearchResponse {
    #[serde(default)]
    items: Vec<PlaceSearchItem>,
}

#[derive(Debug, Deserialize)]
struct PlaceSearchItem {
    #[serde(default)]
    link: Option<String>,
    #[serde(default, rename = "roadAddress")]
    road_address: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    addresses: Vec<GeocodeAddress>,
}

/// The upstream reports longitude as `x` and latitude as `y`, both as
/// strings. Order is normalized to (latitude, longitude) at this boundary.
#[derive(Debug, Deserialize)]
struct GeocodeAddress {
    x: String,
    y: String,
}

pub struct LookupClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl LookupClient {
    pub fn new(config: &LookupConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building lookup http client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    /// Search for a place by company name, best single match only. An empty
    /// result set is `Ok(None)`.
    pub async fn find_place(&self, company: &str) -> Result<Option<PlaceMatch>, LookupError> {
        let url = format!("{}/v1/search/local.json", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-Naver-Client-Id", &self.client_id)
            .header("X-Naver-Client-Secret", &self.client_secret)
            .query(&[("query", company), ("display", "1")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let parsed: PlaceSearchResponse = response.json().await?;
        Ok(parsed.items.into_iter().next().map(|item| PlaceMatch {
            address: item.road_address.filter(|a| !a.is_empty()).or(item.address),
            link: item.link.filter(|l| !l.is_empty()),
        }))
    }

    /// Resolve an address to (latitude, longitude). No match is `Ok(None)`.
    pub async fn geocode(&self, address: &str) -> Result<Option<(f64, f64)>, LookupError> {
        let url = format!("{}/v1/map/geocode", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-Naver-Client-Id", &self.client_id)
            .header("X-Naver-Client-Secret", &self.client_secret)
            .query(&[("query", address)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let parsed: GeocodeResponse = response.json().await?;
        Ok(parsed.addresses.first().and_then(coords_from_address))
    }
}

fn coords_from_address(addr: &GeocodeAddress) -> Option<(f64, f64)> {
    match (addr.y.parse::<f64>(), addr.x.parse::<f64>()) {
        (Ok(lat), Ok(lng)) => Some((lat, lng)),
        _ => {
            warn!(x = %addr.x, y = %addr.y, "unparsable geocode coordinates");
            None
        }
    }
}

/// Combine lookup results into the partial update for one record.
pub fn build_patch(place: Option<&PlaceMatch>, coords: Option<(f64, f64)>) -> EnrichmentPatch {
    EnrichmentPatch {
        address: place.and_then(|p| p.address.clone()),
        latitude: coords.map(|(lat, _)| lat),
        longitude: coords.map(|(_, lng)| lng),
        image_url: place.and_then(|p| p.link.clone()),
    }
}

pub struct EnrichmentUpdater {
    lookup: LookupClient,
    pace_delay: Duration,
}

impl EnrichmentUpdater {
    pub fn new(lookup: LookupClient, pace_delay: Duration) -> Self {
        Self { lookup, pace_delay }
    }

    /// Visit candidate records strictly one at a time, with a pacing delay
    /// between records to bound the external request rate. Lookup failures
    /// are logged and leave that record untouched; only store failures
    /// abort the pass.
    pub async fn run(
        &self,
        store: &dyn RecordStore,
        scope: EnrichmentScope,
    ) -> Result<EnrichmentSummary, StoreError> {
        let candidates = store.enrichment_candidates(scope).await?;
        let mut summary = EnrichmentSummary::default();

        for (idx, record) in candidates.iter().enumerate() {
            summary.scanned += 1;
            if idx > 0 {
                tokio::time::sleep(self.pace_delay).await;
            }

            match self.enrich_one(record).await {
                Ok(patch) if patch.is_empty() => {
                    summary.skipped_empty += 1;
                }
                Ok(patch) => {
                    if patch.address.is_some() || patch.image_url.is_some() {
                        summary.place_matched += 1;
                    }
                    if patch.latitude.is_some() {
                        summary.geocoded += 1;
                    }
                    store.update_enrichment(record.id, &patch).await?;
                    summary.updated += 1;
                }
                Err(err) => {
                    warn!(company = %record.company, error = %err, "lookup failed, skipping record");
                    summary.failed += 1;
                }
            }
        }

        info!(
            scanned = summary.scanned,
            updated = summary.updated,
            failed = summary.failed,
            "enrichment pass finished"
        );
        Ok(summary)
    }

    async fn enrich_one(&self, record: &StoredRecord) -> Result<EnrichmentPatch, LookupError> {
        if record.company.is_empty() {
            return Ok(EnrichmentPatch::default());
        }

        let place = self.lookup.find_place(&record.company).await?;
        let coords = match place.as_ref().and_then(|p| p.address.as_deref()) {
            Some(address) => match self.lookup.geocode(address).await {
                Ok(coords) => coords,
                Err(err) => {
                    // Keep the address even when geocoding fails.
                    warn!(company = %record.company, error = %err, "geocode failed");
                    None
                }
            },
            None => None,
        };

        Ok(build_patch(place.as_ref(), coords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_response_takes_road_address_first() {
        let json = r#"{
            "items": [{
                "title": "Cafe <b>Dawn</b>",
                "link": "https://shop.example/dawn",
                "address": "old-style 12",
                "roadAddress": "12 Harbor Rd"
            }]
        }"#;
        let parsed: PlaceSearchResponse = serde_json::from_str(json).unwrap();
        let item = parsed.items.into_iter().next().unwrap();
        let best = PlaceMatch {
            address: item.road_address.filter(|a| !a.is_empty()).or(item.address),
            link: item.link.filter(|l| !l.is_empty()),
        };
        assert_eq!(best.address.as_deref(), Some("12 Harbor Rd"));
        assert_eq!(best.link.as_deref(), Some("https://shop.example/dawn"));
    }

    #[test]
    fn place_response_falls_back_to_plain_address() {
        let json = r#"{"items": [{"link": "", "roadAddress": "", "address": "old-style 12"}]}"#;
        let parsed: PlaceSearchResponse = serde_json::from_str(json).unwrap();
        let item = parsed.items.into_iter().next().unwrap();
        let address = item.road_address.filter(|a| !a.is_empty()).or(item.address);
        assert_eq!(address.as_deref(), Some("old-style 12"));
        assert!(item.link.filter(|l| !l.is_empty()).is_none());
    }

    #[test]
    fn empty_item_list_means_no_match() {
        let parsed: PlaceSearchResponse = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn geocode_swaps_x_y_into_lat_lng() {
        let json = r#"{"addresses": [{"x": "126.7154", "y": "37.6152"}]}"#;
        let parsed: GeocodeResponse = serde_json::from_str(json).unwrap();
        let coords = parsed.addresses.first().and_then(coords_from_address).unwrap();
        assert!((coords.0 - 37.6152).abs() < 1e-9);
        assert!((coords.1 - 126.7154).abs() < 1e-9);
    }

    #[test]
    fn unparsable_coordinates_become_none() {
        let addr = GeocodeAddress {
            x: "not-a-number".into(),
            y: "37.0".into(),
        };
        assert!(coords_from_address(&addr).is_none());
    }

    #[test]
    fn patch_carries_only_found_fields() {
        let place = PlaceMatch {
            address: Some("12 Harbor Rd".into()),
            link: None,
        };
        let patch = build_patch(Some(&place), None);
        assert_eq!(patch.address.as_deref(), Some("12 Harbor Rd"));
        assert!(patch.latitude.is_none());
        assert!(patch.longitude.is_none());
        assert!(patch.image_url.is_none());
        assert!(!patch.is_empty());

        assert!(build_patch(None, None).is_empty());
    }
}
