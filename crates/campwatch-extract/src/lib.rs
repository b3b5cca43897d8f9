//! Page-source provider contract + table row extraction.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use campwatch_core::RawRow;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "campwatch-extract";

/// Cell layout of the results table. Extraction reads cells through these
/// names only, so a markup reorder is a one-place change.
mod cell {
    pub const PLATFORM: usize = 0;
    pub const COMPANY: usize = 1;
    pub const OFFER: usize = 2;
    pub const APPLY_DEADLINE: usize = 3;
    pub const REVIEW_DEADLINE: usize = 4;
    pub const MIN_CELLS: usize = 5;
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("page source unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("driver session error: {0}")]
    Session(String),
}

/// Behavior knobs for a page driver session. Every recognized option is a
/// named field; there is no pass-through bag of arbitrary settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Run the browser without a window. Only browser-backed drivers render
    /// anything; `SnapshotDriver` ignores it.
    pub headless: bool,
    /// Upper bound on waiting for page source. Expiry is "no data", not an
    /// error.
    pub wait_timeout: Duration,
    /// Pause between consecutive keyword searches.
    pub settle_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            headless: true,
            wait_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Opaque provider of rendered page source. The browser-automation layer
/// lives behind this seam; the pipeline owns exactly one driver per run and
/// shuts it down on every exit path.
#[async_trait]
pub trait PageDriver: Send {
    /// Navigate to a path relative to the driver's base URL.
    async fn navigate(&mut self, path: &str) -> Result<(), DriverError>;

    /// Submit a search and wait (bounded) for the results container. A wait
    /// timeout is "no data", reported as `Ok(None)`, never an error.
    async fn search(&mut self, term: &str) -> Result<Option<String>, DriverError>;

    /// Release the underlying session.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Driver backed by captured page snapshots on disk, one HTML file per
/// keyword. Used for tests and manual-capture runs; a missing snapshot
/// behaves like a results-table wait timeout.
#[derive(Debug, Clone)]
pub struct SnapshotDriver {
    root: PathBuf,
    config: DriverConfig,
}

impl SnapshotDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, DriverConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: DriverConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    fn snapshot_path(&self, term: &str) -> PathBuf {
        self.root.join(format!("{}.html", keyword_slug(term)))
    }
}

#[async_trait]
impl PageDriver for SnapshotDriver {
    async fn navigate(&mut self, _path: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn search(&mut self, term: &str) -> Result<Option<String>, DriverError> {
        let path = self.snapshot_path(term);
        if !path.exists() {
            warn!(term, path = %path.display(), "no snapshot for keyword, treating as no data");
            return Ok(None);
        }
        match tokio::time::timeout(self.config.wait_timeout, tokio::fs::read_to_string(&path))
            .await
        {
            Ok(read) => Ok(Some(read?)),
            Err(_) => {
                warn!(term, "snapshot read exceeded the wait timeout, treating as no data");
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// File-name-safe form of a search keyword.
pub fn keyword_slug(term: &str) -> String {
    term.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Rows pulled from one rendered results page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedRows {
    pub rows: Vec<RawRow>,
    pub skipped_short: usize,
}

pub struct RowExtractor {
    row_selector: Selector,
    cell_selector: Selector,
    link_selector: Selector,
}

impl RowExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            row_selector: parse_selector("#result_table tbody tr")?,
            cell_selector: parse_selector("td")?,
            link_selector: parse_selector("a[href]")?,
        })
    }

    /// Turn the results-container HTML into raw rows. Rows with fewer than
    /// five cells are dropped and counted; a missing company link downgrades
    /// to `None` with a warning. Nothing row-scoped fails the page.
    pub fn extract(&self, html: &str, search_term: &str) -> ExtractedRows {
        let document = Html::parse_document(html);
        let mut out = ExtractedRows::default();

        for row in document.select(&self.row_selector) {
            let cells: Vec<ElementRef> = row.select(&self.cell_selector).collect();
            if cells.len() < cell::MIN_CELLS {
                out.skipped_short += 1;
                continue;
            }

            let company = cell_text(&cells[cell::COMPANY]);
            let company_link = cells[cell::COMPANY]
                .select(&self.link_selector)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(ToString::to_string);
            if company_link.is_none() {
                warn!(company = %company, "company cell has no link");
            }

            out.rows.push(RawRow {
                platform: cell_text(&cells[cell::PLATFORM]),
                company,
                company_link,
                offer: cell_text(&cells[cell::OFFER]),
                apply_deadline_text: cell_text(&cells[cell::APPLY_DEADLINE]),
                review_deadline_text: cell_text(&cells[cell::REVIEW_DEADLINE]),
                search_term: search_term.to_string(),
            });
        }

        debug!(
            term = search_term,
            rows = out.rows.len(),
            skipped = out.skipped_short,
            "extracted page rows"
        );
        out
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PAGE: &str = r#"
        <html><body>
        <table id="result_table"><tbody>
          <tr>
            <td>revu</td>
            <td><a href="https://shop.example/dawn">Cafe Dawn</a></td>
            <td>Free tasting set</td>
            <td>~01/10</td>
            <td>~01/20</td>
          </tr>
          <tr>
            <td>storyn</td>
            <td>Bistro Noon</td>
            <td>20% discount</td>
            <td>~02/05</td>
            <td>~02/15</td>
          </tr>
          <tr>
            <td>broken</td>
            <td>Too Short</td>
          </tr>
        </tbody></table>
        </body></html>"#;

    #[test]
    fn extracts_rows_and_skips_short_ones() {
        let extractor = RowExtractor::new().unwrap();
        let extracted = extractor.extract(PAGE, "gimpo");

        assert_eq!(extracted.rows.len(), 2);
        assert_eq!(extracted.skipped_short, 1);

        let first = &extracted.rows[0];
        assert_eq!(first.platform, "revu");
        assert_eq!(first.company, "Cafe Dawn");
        assert_eq!(
            first.company_link.as_deref(),
            Some("https://shop.example/dawn")
        );
        assert_eq!(first.apply_deadline_text, "~01/10");
        assert_eq!(first.search_term, "gimpo");
    }

    #[test]
    fn missing_company_link_becomes_none() {
        let extractor = RowExtractor::new().unwrap();
        let extracted = extractor.extract(PAGE, "gimpo");
        assert!(extracted.rows[1].company_link.is_none());
    }

    #[test]
    fn page_without_table_yields_nothing() {
        let extractor = RowExtractor::new().unwrap();
        let extracted = extractor.extract("<html><body><p>empty</p></body></html>", "x");
        assert!(extracted.rows.is_empty());
        assert_eq!(extracted.skipped_short, 0);
    }

    #[test]
    fn keyword_slug_collapses_non_alphanumerics() {
        assert_eq!(keyword_slug("  gyeonggi gimpo "), "gyeonggi-gimpo");
        assert_eq!(keyword_slug("경기 김포"), "경기-김포");
    }

    #[tokio::test]
    async fn snapshot_driver_reads_keyword_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gyeonggi-gimpo.html");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(PAGE.as_bytes()).unwrap();

        let mut driver = SnapshotDriver::new(dir.path());
        driver.navigate("/").await.unwrap();

        let html = driver.search("gyeonggi gimpo").await.unwrap();
        assert!(html.is_some());

        let missing = driver.search("nowhere").await.unwrap();
        assert!(missing.is_none());

        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_driver_honors_configured_wait_timeout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gimpo.html"), PAGE).unwrap();

        let config = DriverConfig {
            wait_timeout: Duration::from_secs(2),
            ..DriverConfig::default()
        };
        let mut driver = SnapshotDriver::with_config(dir.path(), config);
        let html = driver.search("gimpo").await.unwrap();
        assert!(html.is_some());
    }
}
