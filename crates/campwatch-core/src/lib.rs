//! Core domain model for campwatch.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "campwatch-core";

/// Civil timezone of the scraped listings (UTC+9). Parsed deadlines are
/// anchored here before anything touches the store.
pub fn listing_timezone() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("static offset is in range")
}

/// One table row as captured from the rendered results page. Cells are kept
/// as raw text; nothing here is validated yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub platform: String,
    pub company: String,
    pub company_link: Option<String>,
    pub offer: String,
    pub apply_deadline_text: String,
    pub review_deadline_text: String,
    pub search_term: String,
}

/// Trimmed natural key of a listing. The store enforces uniqueness on this
/// triple and the in-batch deduplicator groups by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub platform: String,
    pub company: String,
    pub offer: String,
}

impl RecordKey {
    pub fn new(platform: &str, company: &str, offer: &str) -> Self {
        Self {
            platform: platform.trim().to_string(),
            company: company.trim().to_string(),
            offer: offer.trim().to_string(),
        }
    }
}

/// Canonical storage-ready listing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub platform: String,
    pub company: String,
    pub company_link: Option<String>,
    pub offer: String,
    pub apply_deadline: Option<DateTime<FixedOffset>>,
    pub review_deadline: Option<DateTime<FixedOffset>>,
    pub search_term: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_url: Option<String>,
}

impl NormalizedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.platform, &self.company, &self.offer)
    }

    /// A record may enter reconciliation only with both deadlines parsed.
    /// String fields are never a gate: platform and company coalesce to `""`
    /// upstream when the page omits them, and such rows are kept.
    pub fn is_persistable(&self) -> bool {
        self.apply_deadline.is_some() && self.review_deadline.is_some()
    }
}

/// Derived geodata applied as a per-field partial update. Only fields that
/// are `Some` are written; key and deadline columns are never part of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentPatch {
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_url: Option<String>,
}

impl EnrichmentPatch {
    pub fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
            && self.image_url.is_none()
    }
}

/// Outcome counters for one full scrape run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keywords_processed: usize,
    pub keywords_without_results: usize,
    pub rows_extracted: usize,
    pub rows_skipped_short: usize,
    pub records_dropped_invalid: usize,
    pub duplicates_collapsed: usize,
    pub records_written: u64,
}

/// Outcome counters for one enrichment pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentSummary {
    pub scanned: usize,
    pub place_matched: usize,
    pub geocoded: usize,
    pub updated: usize,
    pub skipped_empty: usize,
    pub failed: usize,
}
