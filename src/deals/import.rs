// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Resumable import of the deal CSV feed.
//!
//! Offsets count data rows; the header line is never counted. A chunk reports [`ImportStep::Done`] as soon as the file
//! has no rows left, so a caller never needs an extra empty chunk to notice the end.

use crate::deals::store::{DealStatus, DealStore, FeedDeal};
use crate::error::ApwResult;
use crate::product::is_valid_asin;
use crate::settings::DealSettings;
use crate::time;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COLUMN_STATUS: usize = 2;
const COLUMN_ASIN: usize = 4;
const COLUMN_START: usize = 6;
const COLUMN_END: usize = 7;
const COLUMN_PRICE: usize = 9;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImportStep {
    /// More rows remain, starting at this data-row offset
    Continue { next_offset: u64 },
    /// The file is exhausted
    Done,
}

/// Result of importing one chunk. File-level failures are reported through the surrounding `Result` instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImportChunk {
    /// Rows consumed, including skipped and invalid ones
    pub processed: u64,
    /// Rows that could not be imported
    pub errors: u64,
    pub step: ImportStep,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealImportState {
    pub processed: u64,
    pub errors: u64,
    pub finished: bool,
}

/// Everything needed to resume an import in a later invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportContinuation {
    pub path: PathBuf,
    pub total: u64,
    #[serde(default)]
    pub state: DealImportState,
}

impl ImportContinuation {
    pub fn new(path: PathBuf, total: u64) -> Self {
        Self {
            path,
            total,
            state: DealImportState::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkedOutcome {
    /// The whole file was imported
    Finished,
    /// The time budget ran out; resume with the same continuation
    Paused,
    /// Too many invalid rows; the import was abandoned
    Failed,
}

#[derive(Copy, Clone, Debug)]
pub struct ImportLimits {
    pub time_budget: Duration,
    pub per_round: u64,
    pub max_errors: u64,
}

impl From<&DealSettings> for ImportLimits {
    fn from(settings: &DealSettings) -> Self {
        Self {
            time_budget: settings.max_processing_time,
            per_round: settings.imports_per_round.max(1),
            max_errors: settings.max_invalid,
        }
    }
}

struct RowBatch {
    rows: Vec<Result<StringRecord, csv::Error>>,
    exhausted: bool,
}

enum RowError {
    Start,
    End,
    Price,
}

impl RowError {
    fn as_str(&self) -> &'static str {
        match self {
            RowError::Start => "invalid deal start",
            RowError::End => "invalid deal end",
            RowError::Price => "invalid deal price",
        }
    }
}

#[derive(Clone)]
pub struct DealImporter {
    store: DealStore,
}

impl DealImporter {
    pub fn new(store: DealStore) -> Self {
        Self { store }
    }

    /// Import up to `max_entries` rows starting at data-row `offset`. `None` imports the rest of the file.
    pub async fn import(&self, path: &Path, offset: u64, max_entries: Option<u64>) -> ApwResult<ImportChunk> {
        self.import_bounded(path, offset, max_entries, None).await
    }

    /// Like [`DealImporter::import`], but stops early once `error_budget` invalid rows have been seen
    pub async fn import_bounded(
        &self,
        path: &Path,
        offset: u64,
        max_entries: Option<u64>,
        error_budget: Option<u64>,
    ) -> ApwResult<ImportChunk> {
        let owned_path = path.to_path_buf();
        let batch = tokio::task::spawn_blocking(move || read_rows(&owned_path, offset, max_entries)).await??;

        let row_count = batch.rows.len();
        let mut processed = 0u64;
        let mut errors = 0u64;
        for (index, row) in batch.rows.into_iter().enumerate() {
            if error_budget.is_some_and(|budget| errors >= budget) {
                break;
            }
            processed += 1;
            let line = offset + index as u64 + 2;
            let record = match row {
                Ok(record) => record,
                Err(e) => {
                    debug!("deal feed line {line}: unreadable row: {e}");
                    errors += 1;
                    continue;
                }
            };
            match parse_row(&record) {
                Ok(None) => {}
                Ok(Some(deal)) => {
                    if let Err(e) = self.store.insert_or_update(&deal).await {
                        warn!("deal feed line {line}: could not store deal for {}: {e}", deal.asin);
                        errors += 1;
                    }
                }
                Err(e) => {
                    debug!("deal feed line {line}: {}", e.as_str());
                    errors += 1;
                }
            }
        }

        let step = if batch.exhausted && processed as usize == row_count {
            ImportStep::Done
        } else {
            ImportStep::Continue {
                next_offset: offset + processed,
            }
        };
        Ok(ImportChunk { processed, errors, step })
    }
}

fn read_rows(path: &Path, offset: u64, max_entries: Option<u64>) -> ApwResult<RowBatch> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let skip = usize::try_from(offset).unwrap_or(usize::MAX);
    let mut records = reader.records().skip(skip);
    let mut rows = Vec::new();
    loop {
        if max_entries.is_some_and(|max| rows.len() as u64 >= max) {
            let exhausted = records.next().is_none();
            return Ok(RowBatch { rows, exhausted });
        }
        match records.next() {
            Some(row) => rows.push(row),
            None => return Ok(RowBatch { rows, exhausted: true }),
        }
    }
}

/// Count the data rows of a deal feed
pub(crate) fn count_rows(path: &Path) -> ApwResult<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    Ok(reader.records().count() as u64)
}

/// `Ok(None)` means the row has no usable ASIN and is silently skipped
fn parse_row(record: &StringRecord) -> Result<Option<FeedDeal>, RowError> {
    let asin = record.get(COLUMN_ASIN).map(str::trim).unwrap_or_default();
    if !is_valid_asin(asin) {
        return Ok(None);
    }
    let deal_start = record
        .get(COLUMN_START)
        .and_then(time::parse_feed_time)
        .ok_or(RowError::Start)?;
    let deal_end = record
        .get(COLUMN_END)
        .and_then(time::parse_feed_time)
        .ok_or(RowError::End)?;
    let deal_price = record.get(COLUMN_PRICE).and_then(parse_price).ok_or(RowError::Price)?;
    let deal_status = DealStatus::from_feed(record.get(COLUMN_STATUS).unwrap_or_default());
    Ok(Some(FeedDeal {
        asin: asin.to_string(),
        deal_start,
        deal_end,
        deal_price,
        deal_status,
    }))
}

fn parse_price(price: &str) -> Option<f64> {
    let price = price.trim();
    let parsed = price
        .parse::<f64>()
        .ok()
        .or_else(|| price.replace(',', ".").parse::<f64>().ok())?;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
}

/// Import chunks until the file is done, the time budget is spent, or the error budget is exceeded.
///
/// At least one chunk is always attempted. Progress is written back into `continuation`.
pub async fn import_chunked(
    importer: &DealImporter,
    continuation: &mut ImportContinuation,
    limits: &ImportLimits,
) -> ApwResult<ChunkedOutcome> {
    let start = Instant::now();
    loop {
        let state = &mut continuation.state;
        let error_budget = (limits.max_errors != 0).then(|| limits.max_errors.saturating_sub(state.errors));
        let chunk = importer
            .import_bounded(&continuation.path, state.processed, Some(limits.per_round), error_budget)
            .await?;
        state.processed += chunk.processed;
        state.errors += chunk.errors;

        if limits.max_errors != 0 && state.errors >= limits.max_errors {
            warn!(
                "deal import of {} abandoned after {} invalid rows",
                continuation.path.display(),
                state.errors
            );
            return Ok(ChunkedOutcome::Failed);
        }

        if chunk.step == ImportStep::Done {
            state.finished = true;
            info!(
                "deal import of {} finished: {} rows, {} invalid",
                continuation.path.display(),
                state.processed,
                state.errors
            );
            return Ok(ChunkedOutcome::Finished);
        }

        debug!(
            "deal import progress: {}/{} rows, {} invalid",
            state.processed, continuation.total, state.errors
        );
        if start.elapsed() >= limits.time_budget {
            return Ok(ChunkedOutcome::Paused);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::ApwDb;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    const HEADER: &str = "id,type,status,title,asin,link,start,end,list,price";

    fn row(status: &str, asin: &str, start: &str, end: &str, price: &str) -> String {
        format!("1,LD,{status},Title,{asin},https://example.com,{start},{end},20.00,{price}")
    }

    fn valid_row(asin: &str) -> String {
        row("AVAILABLE", asin, "2024-01-01T00:00:00Z", "2099-01-01T00:00:00Z", "9.99")
    }

    fn feed(rows: &[String]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "{HEADER}").expect("write header");
        for row in rows {
            writeln!(file, "{row}").expect("write row");
        }
        file.flush().expect("flush");
        file
    }

    async fn importer() -> (DealImporter, DealStore) {
        let store = DealStore::new(ApwDb::open_in_memory().await.expect("in-memory db"));
        (DealImporter::new(store.clone()), store)
    }

    fn asin(i: usize) -> String {
        format!("B{i:09}")
    }

    #[tokio::test]
    async fn test_import_everything() {
        let (importer, store) = importer().await;
        let file = feed(&[valid_row("B00TEST001"), valid_row("B00TEST002")]);
        let chunk = importer.import(file.path(), 0, None).await.expect("import");
        assert_eq!(
            chunk,
            ImportChunk {
                processed: 2,
                errors: 0,
                step: ImportStep::Done
            }
        );
        assert_eq!(store.count().await.expect("count"), 2);
        let deal = store.get_by_asin("B00TEST002").await.expect("read").expect("present");
        assert_eq!(deal.deal_price, 9.99);
        assert_eq!(deal.deal_start, 1_704_067_200);
        assert_eq!(deal.deal_status, DealStatus::Available);
    }

    #[tokio::test]
    async fn test_chunk_offsets() {
        let (importer, store) = importer().await;
        let rows: Vec<String> = (0..5).map(|i| valid_row(&asin(i))).collect();
        let file = feed(&rows);

        let chunk = importer.import(file.path(), 0, Some(2)).await.expect("import");
        assert_eq!(chunk.step, ImportStep::Continue { next_offset: 2 });
        let chunk = importer.import(file.path(), 2, Some(2)).await.expect("import");
        assert_eq!(chunk.step, ImportStep::Continue { next_offset: 4 });
        let chunk = importer.import(file.path(), 4, Some(2)).await.expect("import");
        assert_eq!(chunk.processed, 1);
        assert_eq!(chunk.step, ImportStep::Done);
        assert_eq!(store.count().await.expect("count"), 5);
    }

    #[tokio::test]
    async fn test_exact_fit_reports_done() {
        let (importer, _) = importer().await;
        let file = feed(&[valid_row("B00TEST001"), valid_row("B00TEST002")]);
        let chunk = importer.import(file.path(), 0, Some(2)).await.expect("import");
        assert_eq!(chunk.processed, 2);
        assert_eq!(chunk.step, ImportStep::Done);
    }

    #[tokio::test]
    async fn test_header_only() {
        let (importer, _) = importer().await;
        let file = feed(&[]);
        let chunk = importer.import(file.path(), 0, Some(10)).await.expect("import");
        assert_eq!(chunk.processed, 0);
        assert_eq!(chunk.step, ImportStep::Done);
        assert_eq!(count_rows(file.path()).expect("count"), 0);
    }

    #[tokio::test]
    async fn test_invalid_rows() {
        let (importer, store) = importer().await;
        let file = feed(&[
            valid_row("B00TEST001"),
            row("AVAILABLE", "not-an-asin", "2024-01-01", "2024-01-02", "1.00"),
            row("AVAILABLE", "B00TEST002", "garbage", "2024-01-02", "1.00"),
            row("AVAILABLE", "B00TEST003", "2024-01-01", "2024-01-02", "free"),
            row("UPCOMING", "B00TEST004", "2024-01-01", "2024-01-02", "\"3,50\""),
        ]);
        let chunk = importer.import(file.path(), 0, None).await.expect("import");
        assert_eq!(chunk.processed, 5);
        assert_eq!(chunk.errors, 2);
        assert_eq!(store.count().await.expect("count"), 2);
        let deal = store.get_by_asin("B00TEST004").await.expect("read").expect("present");
        assert_eq!(deal.deal_price, 3.5);
        assert_eq!(deal.deal_status, DealStatus::Upcoming);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let (importer, _) = importer().await;
        let result = importer.import(Path::new("/nonexistent/apw-deals.csv"), 0, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_chunked_finishes_across_rounds() {
        let (importer, store) = importer().await;
        let rows: Vec<String> = (0..25).map(|i| valid_row(&asin(i))).collect();
        let file = feed(&rows);
        let mut continuation = ImportContinuation::new(file.path().to_path_buf(), 25);
        let limits = ImportLimits {
            time_budget: Duration::from_secs(60),
            per_round: 10,
            max_errors: 100,
        };
        let outcome = import_chunked(&importer, &mut continuation, &limits).await.expect("import");
        assert_eq!(outcome, ChunkedOutcome::Finished);
        assert!(continuation.state.finished);
        assert_eq!(continuation.state.processed, 25);
        assert_eq!(store.count().await.expect("count"), 25);
    }

    #[tokio::test]
    async fn test_chunked_pauses_on_time_budget() {
        let (importer, _) = importer().await;
        let rows: Vec<String> = (0..25).map(|i| valid_row(&asin(i))).collect();
        let file = feed(&rows);
        let mut continuation = ImportContinuation::new(file.path().to_path_buf(), 25);
        let limits = ImportLimits {
            time_budget: Duration::ZERO,
            per_round: 10,
            max_errors: 100,
        };
        let outcome = import_chunked(&importer, &mut continuation, &limits).await.expect("import");
        assert_eq!(outcome, ChunkedOutcome::Paused);
        assert_eq!(continuation.state.processed, 10);
        assert!(!continuation.state.finished);

        let outcome = import_chunked(&importer, &mut continuation, &limits).await.expect("import");
        assert_eq!(outcome, ChunkedOutcome::Paused);
        assert_eq!(continuation.state.processed, 20);
    }

    #[tokio::test]
    async fn test_chunked_fails_on_error_budget() {
        let (importer, store) = importer().await;
        let mut rows: Vec<String> = (0..5)
            .map(|i| row("AVAILABLE", &asin(i), "bad", "bad", "1.00"))
            .collect();
        rows.push(valid_row("B00TEST999"));
        let file = feed(&rows);
        let mut continuation = ImportContinuation::new(file.path().to_path_buf(), 6);
        let limits = ImportLimits {
            time_budget: Duration::from_secs(60),
            per_round: 100,
            max_errors: 3,
        };
        let outcome = import_chunked(&importer, &mut continuation, &limits).await.expect("import");
        assert_eq!(outcome, ChunkedOutcome::Failed);
        assert_eq!(continuation.state.errors, 3);
        assert_eq!(continuation.state.processed, 3);
        assert_eq!(store.count().await.expect("count"), 0);
    }
}
