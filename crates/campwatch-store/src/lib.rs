//! Persistent reconciliation store: conflict-aware batch upsert, enrichment
//! point updates, and the CSV side export.

use std::path::Path;

use async_trait::async_trait;
use campwatch_core::{EnrichmentPatch, NormalizedRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "campwatch-store";
pub const DEFAULT_TABLE: &str = "campaign";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which stored records an enrichment pass visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentScope {
    MissingOnly,
    All,
}

/// A campaign row as persisted, surrogate id included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub platform: String,
    pub company: String,
    pub company_link: Option<String>,
    pub offer: String,
    pub apply_deadline: Option<DateTime<Utc>>,
    pub review_deadline: Option<DateTime<Utc>>,
    pub search_term: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage seam for the pipeline and the enrichment pass.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert-or-replace a whole batch inside one transaction. Empty input
    /// is a successful no-op with zero writes.
    async fn upsert_batch(&self, records: &[NormalizedRecord]) -> Result<u64, StoreError>;

    /// Records eligible for enrichment under the given scope.
    async fn enrichment_candidates(
        &self,
        scope: EnrichmentScope,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Apply a per-field partial update to one record. Only the patch's
    /// non-null fields are named in the statement; key and deadline columns
    /// are never touched here.
    async fn update_enrichment(&self, id: i64, patch: &EnrichmentPatch)
        -> Result<(), StoreError>;

    /// Every stored record, id order.
    async fn all_records(&self) -> Result<Vec<StoredRecord>, StoreError>;
}

pub struct PgRecordStore {
    pool: PgPool,
    table: String,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            table: table_ident(table)?,
        })
    }

    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            table: table_ident(table)?,
        })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_batch(&self, records: &[NormalizedRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            warn!(table = %self.table, "empty batch, skipping upsert");
            return Ok(0);
        }

        let sql = upsert_sql(&self.table);
        let mut written = 0u64;
        let mut tx = self.pool.begin().await?;
        for rec in records {
            // The unique constraint cannot hold nulls; re-trim the key
            // columns before binding.
            let key = rec.key();
            let result = sqlx::query(&sql)
                .bind(&key.platform)
                .bind(&key.company)
                .bind(&rec.company_link)
                .bind(&key.offer)
                .bind(rec.apply_deadline.map(|d| d.with_timezone(&Utc)))
                .bind(rec.review_deadline.map(|d| d.with_timezone(&Utc)))
                .bind(&rec.search_term)
                .bind(&rec.address)
                .bind(rec.latitude)
                .bind(rec.longitude)
                .bind(&rec.image_url)
                .execute(&mut *tx)
                .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;

        info!(table = %self.table, records = records.len(), written, "batch upsert committed");
        Ok(written)
    }

    async fn enrichment_candidates(
        &self,
        scope: EnrichmentScope,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let filter = match scope {
            EnrichmentScope::MissingOnly => {
                " WHERE address IS NULL AND latitude IS NULL AND longitude IS NULL"
            }
            EnrichmentScope::All => "",
        };
        let sql = format!("{}{} ORDER BY id", select_sql(&self.table), filter);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_stored).collect()
    }

    async fn update_enrichment(
        &self,
        id: i64,
        patch: &EnrichmentPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut builder = enrichment_update_query(&self.table, id, patch);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn all_records(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = format!("{} ORDER BY id", select_sql(&self.table));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_stored).collect()
    }
}

/// Write the given records to a CSV file. Secondary sink; the table stays
/// authoritative.
pub fn export_csv(records: &[StoredRecord], path: &Path) -> Result<usize, StoreError> {
    let mut writer = csv::Writer::from_path(path)?;
    for rec in records {
        writer.serialize(rec)?;
    }
    writer.flush()?;
    info!(path = %path.display(), records = records.len(), "csv export written");
    Ok(records.len())
}

/// Identifiers cannot be bound as parameters; restrict table names to a safe
/// character set instead.
pub fn table_ident(name: &str) -> Result<String, StoreError> {
    let trimmed = name.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !trimmed.chars().next().is_some_and(|c| c.is_ascii_digit());
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(StoreError::InvalidTable(name.to_string()))
    }
}

/// Full-replace-on-conflict insert. Every non-key column takes the incoming
/// value, enrichment columns included: a re-scrape deliberately supersedes
/// stale enrichment, which gets recomputed by the next enrichment pass.
pub fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} \
         (platform, company, company_link, offer, apply_deadline, review_deadline, \
          search_term, address, latitude, longitude, image_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (platform, company, offer) DO UPDATE SET \
         company_link = EXCLUDED.company_link, \
         apply_deadline = EXCLUDED.apply_deadline, \
         review_deadline = EXCLUDED.review_deadline, \
         search_term = EXCLUDED.search_term, \
         address = EXCLUDED.address, \
         latitude = EXCLUDED.latitude, \
         longitude = EXCLUDED.longitude, \
         image_url = EXCLUDED.image_url, \
         updated_at = NOW()"
    )
}

/// Partial UPDATE for one record's derived geodata. Only the patch's `Some`
/// fields become assignments, plus `updated_at`; key and deadline columns
/// are never named. Callers skip empty patches before building.
pub fn enrichment_update_query<'a>(
    table: &str,
    id: i64,
    patch: &'a EnrichmentPatch,
) -> QueryBuilder<'a, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!("UPDATE {table} SET "));
    let mut assignments = builder.separated(", ");
    if let Some(address) = &patch.address {
        assignments.push("address = ");
        assignments.push_bind_unseparated(address);
    }
    if let Some(latitude) = patch.latitude {
        assignments.push("latitude = ");
        assignments.push_bind_unseparated(latitude);
    }
    if let Some(longitude) = patch.longitude {
        assignments.push("longitude = ");
        assignments.push_bind_unseparated(longitude);
    }
    if let Some(image_url) = &patch.image_url {
        assignments.push("image_url = ");
        assignments.push_bind_unseparated(image_url);
    }
    assignments.push("updated_at = NOW()");
    builder.push(" WHERE id = ");
    builder.push_bind(id);
    builder
}

fn select_sql(table: &str) -> String {
    format!(
        "SELECT id, platform, company, company_link, offer, apply_deadline, \
         review_deadline, search_term, address, latitude, longitude, image_url, \
         created_at, updated_at FROM {table}"
    )
}

fn row_to_stored(row: &PgRow) -> Result<StoredRecord, StoreError> {
    Ok(StoredRecord {
        id: row.try_get("id")?,
        platform: row.try_get("platform")?,
        company: row.try_get("company")?,
        company_link: row.try_get("company_link")?,
        offer: row.try_get("offer")?,
        apply_deadline: row.try_get("apply_deadline")?,
        review_deadline: row.try_get("review_deadline")?,
        search_term: row.try_get("search_term")?,
        address: row.try_get("address")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn table_ident_accepts_plain_names() {
        assert_eq!(table_ident("campaign").unwrap(), "campaign");
        assert_eq!(table_ident(" campaign_v2 ").unwrap(), "campaign_v2");
    }

    #[test]
    fn table_ident_rejects_injection_shapes() {
        assert!(table_ident("campaign; DROP TABLE x").is_err());
        assert!(table_ident("").is_err());
        assert!(table_ident("1campaign").is_err());
        assert!(table_ident("cam paign").is_err());
    }

    #[test]
    fn upsert_targets_natural_key_and_replaces_every_non_key_column() {
        let sql = upsert_sql("campaign");
        assert!(sql.contains("ON CONFLICT (platform, company, offer) DO UPDATE SET"));
        for col in [
            "company_link",
            "apply_deadline",
            "review_deadline",
            "search_term",
            "address",
            "latitude",
            "longitude",
            "image_url",
        ] {
            assert!(
                sql.contains(&format!("{col} = EXCLUDED.{col}")),
                "missing replacement for {col}"
            );
        }
        // Key columns are the conflict target, never assignment targets.
        assert!(!sql.contains("platform = EXCLUDED"));
        assert!(!sql.contains("company = EXCLUDED"));
        assert!(!sql.contains("offer = EXCLUDED"));
        assert!(sql.contains("updated_at = NOW()"));
    }

    #[test]
    fn enrichment_update_names_only_patched_enrichment_columns() {
        let patch = EnrichmentPatch {
            address: Some("12 Harbor Rd".into()),
            latitude: Some(37.615),
            longitude: None,
            image_url: None,
        };
        let sql = enrichment_update_query("campaign", 7, &patch).into_sql();

        assert!(sql.starts_with("UPDATE campaign SET "));
        assert!(sql.contains("address = $1"));
        assert!(sql.contains("latitude = $2"));
        assert!(sql.contains("updated_at = NOW()"));
        assert!(sql.ends_with("WHERE id = $3"));
        // Absent patch fields and everything outside the enrichment column
        // set stay out of the statement.
        assert!(!sql.contains("longitude"));
        assert!(!sql.contains("image_url"));
        assert!(!sql.contains("platform"));
        assert!(!sql.contains("company"));
        assert!(!sql.contains("offer"));
        assert!(!sql.contains("deadline"));
        assert!(!sql.contains("search_term"));
    }

    #[test]
    fn enrichment_update_with_full_patch_covers_all_four_columns() {
        let patch = EnrichmentPatch {
            address: Some("12 Harbor Rd".into()),
            latitude: Some(37.615),
            longitude: Some(126.715),
            image_url: Some("https://img.example/1.jpg".into()),
        };
        let sql = enrichment_update_query("campaign", 1, &patch).into_sql();
        assert!(sql.contains("address = $1"));
        assert!(sql.contains("latitude = $2"));
        assert!(sql.contains("longitude = $3"));
        assert!(sql.contains("image_url = $4"));
        assert!(sql.ends_with("WHERE id = $5"));
    }

    #[test]
    fn csv_export_round_trips_headers_and_rows() {
        let rec = StoredRecord {
            id: 1,
            platform: "revu".into(),
            company: "Cafe Dawn".into(),
            company_link: Some("https://shop.example/dawn".into()),
            offer: "Free tasting set".into(),
            apply_deadline: Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).single(),
            review_deadline: Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).single(),
            search_term: Some("gimpo".into()),
            address: Some("12 Harbor Rd".into()),
            latitude: Some(37.615),
            longitude: Some(126.715),
            image_url: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        let written = export_csv(&[rec], &path).unwrap();
        assert_eq!(written, 1);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("id,platform,company,company_link,offer"));
        let row = lines.next().unwrap();
        assert!(row.contains("Cafe Dawn"));
        assert!(row.contains("37.615"));
    }
}
