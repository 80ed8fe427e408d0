//! Streaming bulk loader.
//!
//! [`BatchLoader`] feeds rows into a `COPY ... FROM LOCAL` statement through a
//! named pipe. The statement runs on a background task and reads the pipe
//! until the writer closes it; closing is the only completion signal, so
//! the number of rows never has to be known up front and rows are never
//! buffered beyond the pipe and a small write buffer.
//!
//! A batch session starts lazily on the first insert and ends on
//! [`commit`](BatchLoader::commit), [`rollback`](BatchLoader::rollback),
//! [`get_errors`](BatchLoader::get_errors) or [`close`](BatchLoader::close).
//! Errors of the background COPY are captured and returned by the next of
//! those calls.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vertica_migrate::{BatchLoader, LoaderOptions, SqlExecutor, SqlValue};
//!
//! async fn load(executor: Arc<dyn SqlExecutor>) -> vertica_migrate::Result<()> {
//!     let mut loader = BatchLoader::new(
//!         executor,
//!         "stg.customers",
//!         vec!["id".into(), "name".into()],
//!         LoaderOptions::default(),
//!     )?;
//!     loader.insert(&[SqlValue::from(1), SqlValue::from("Alice")]).await?;
//!     let (rejected, report) = loader.get_errors().await?;
//!     if rejected > 0 {
//!         eprintln!("{}", report);
//!     }
//!     loader.commit().await
//! }
//! ```

mod copy;
mod format;
mod pipe;

pub use copy::{char_literal, CopyStatement};
pub use format::RowFormatter;
pub use pipe::{Completion, NamedPipe, PendingExecution};

use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::config::LoaderOptions;
use crate::core::identifier::{quote_literal, validate_identifier};
use crate::core::{SqlExecutor, SqlValue};
use crate::error::{MigrateError, Result};

const REJECTED_PREFIX: &str = "Rejected data at line: ";

/// Resources of one active batch session.
struct Session {
    writer: BufWriter<File>,
    pending: PendingExecution,
    rejected: Option<NamedTempFile>,
    // dropped last: removes the FIFO and its directory
    pipe: NamedPipe,
}

/// Streams rows into one table through a background COPY.
pub struct BatchLoader {
    executor: Arc<dyn SqlExecutor>,
    table: String,
    columns: Vec<String>,
    options: LoaderOptions,
    formatter: RowFormatter,
    session: Option<Session>,
    /// Error of the last COPY, returned by the next quiescing call.
    captured: Option<MigrateError>,
    /// Rejected-data files of the sessions since the last flush.
    rejected_files: Vec<NamedTempFile>,
    diagnostics_consumed: bool,
    ended_clean: bool,
    total_count: u64,
    count_since_flush: u64,
    rows_loaded: u64,
}

impl BatchLoader {
    /// Create a loader for `table` (`schema.table`, used verbatim in SQL).
    ///
    /// An empty column list loads all columns in table order.
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        table: impl Into<String>,
        columns: Vec<String>,
        options: LoaderOptions,
    ) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        for column in &columns {
            validate_identifier(column)?;
        }
        options.copy.validate()?;

        debug!(
            "Initializing BatchLoader for {} with columns [{}]",
            table,
            columns.join(", ")
        );

        Ok(Self {
            executor,
            table,
            columns,
            formatter: RowFormatter::new(&options.copy),
            options,
            session: None,
            captured: None,
            rejected_files: Vec::new(),
            diagnostics_consumed: false,
            ended_clean: true,
            total_count: 0,
            count_since_flush: 0,
            rows_loaded: 0,
        })
    }

    /// Table the loader writes to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The executor bound to this loader.
    ///
    /// Statements issued through it share the loader's transaction. Do not
    /// use it while a session is active.
    pub fn executor(&self) -> &Arc<dyn SqlExecutor> {
        &self.executor
    }

    /// Items inserted since the last commit or rollback.
    ///
    /// With [`insert_raw`](Self::insert_raw) this counts calls, not lines.
    pub fn count_since_flush(&self) -> u64 {
        self.count_since_flush
    }

    /// Items inserted over the life of the loader.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Rows the database reported as loaded by completed sessions.
    pub fn rows_loaded(&self) -> u64 {
        self.rows_loaded
    }

    /// Whether a batch session is active.
    pub fn in_session(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the last session's COPY finished within the shutdown wait.
    pub fn ended_cleanly(&self) -> bool {
        self.ended_clean
    }

    /// Truncate the target table. Only valid outside a session.
    pub async fn truncate_table(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(MigrateError::Loader(format!(
                "cannot truncate {} while a batch session is active",
                self.table
            )));
        }
        info!("Truncating table {}", self.table);
        self.executor
            .execute(&format!("TRUNCATE TABLE {}", self.table))
            .await?;
        Ok(())
    }

    /// Encode and write one row.
    ///
    /// Waits while the pipe is full, so the caller never runs ahead of the
    /// database.
    pub async fn insert(&mut self, row: &[SqlValue]) -> Result<()> {
        let line = self.formatter.encode_row(row);
        self.write(line.as_bytes()).await?;
        self.count(1);
        Ok(())
    }

    /// Insert every row of an iterator; returns the number of rows written.
    pub async fn insert_rows<I, R>(&mut self, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[SqlValue]>,
    {
        let mut written = 0;
        for row in rows {
            self.insert(row.as_ref()).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Write one pre-formatted line; the record terminator is appended.
    pub async fn insert_line(&mut self, line: &str) -> Result<()> {
        debug!("Inserting line: {}", line);
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push(self.formatter.terminator());
        self.write(record.as_bytes()).await?;
        self.count(1);
        Ok(())
    }

    /// Write bytes verbatim.
    ///
    /// The data may hold part of a record or several records; each call
    /// counts as one item.
    pub async fn insert_raw(&mut self, data: &[u8]) -> Result<()> {
        self.write(data).await?;
        self.count(1);
        Ok(())
    }

    /// End the session and report rejected rows and constraint violations.
    ///
    /// Returns the error count and a plain-text report. The diagnostics are
    /// consumed: a second call before the next session or flush fails.
    pub async fn get_errors(&mut self) -> Result<(u64, String)> {
        self.end_session().await?;
        if let Some(err) = self.captured.take() {
            return Err(err);
        }

        if self.count_since_flush == 0 {
            return Ok((0, String::new()));
        }

        if self.diagnostics_consumed {
            return Err(MigrateError::Loader(format!(
                "errors for {} were already collected since the last insert",
                self.table
            )));
        }
        self.diagnostics_consumed = true;

        let mut report = String::new();
        let mut error_count = self
            .executor
            .fetch_value("SELECT GET_NUM_REJECTED_ROWS()")
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as u64;

        if self.options.analyze_constraints {
            let sql = format!("SELECT ANALYZE_CONSTRAINTS({})", quote_literal(&self.table));
            let violations = match self.executor.fetch_all(&sql).await {
                Ok(rows) => rows,
                Err(e) if e.to_string().to_lowercase().contains("no constraints defined") => {
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            if let Some(first) = violations.first() {
                error_count += violations.len() as u64;
                let fields: Vec<String> = first.iter().filter_map(SqlValue::as_string).collect();
                report.push_str(&format!(
                    "At least one constraint not met: {}\n",
                    fields.join(", ")
                ));
            }
        }

        for file in self.rejected_files.drain(..) {
            let data = tokio::fs::read(file.path()).await?;
            report.push_str(&rejected_report(&data, self.formatter.terminator()));
        }

        Ok((error_count, report))
    }

    /// End the session and commit.
    ///
    /// A captured COPY error is returned instead, without committing.
    pub async fn commit(&mut self) -> Result<()> {
        let batch_count = self.count_since_flush;
        let ended = self.end_session().await;
        let captured = self.captured.take();
        self.reset_flush();

        if let Some(err) = captured {
            return Err(err);
        }
        ended?;

        self.executor.commit().await?;
        info!(
            "Transaction committed, {} lines inserted into {}",
            batch_count, self.table
        );
        Ok(())
    }

    /// End the session and roll back.
    ///
    /// The rollback happens even when a COPY error was captured; that error
    /// is returned afterwards.
    pub async fn rollback(&mut self) -> Result<()> {
        let ended = self.end_session().await;
        let rolled_back = self.executor.rollback().await;
        let captured = self.captured.take();
        self.reset_flush();

        if let Some(err) = captured {
            return Err(err);
        }
        ended?;
        rolled_back?;
        info!("Transaction rolled back for {}", self.table);
        Ok(())
    }

    /// End the active session without a transaction boundary.
    ///
    /// Returns whether the COPY finished within the shutdown wait.
    pub async fn close(&mut self) -> Result<bool> {
        self.end_session().await?;
        if let Some(err) = self.captured.take() {
            return Err(err);
        }
        Ok(self.ended_clean)
    }

    fn count(&mut self, n: u64) {
        self.total_count += n;
        self.count_since_flush += n;
    }

    fn reset_flush(&mut self) {
        self.count_since_flush = 0;
        self.diagnostics_consumed = false;
        self.rejected_files.clear();
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.session.is_none() {
            self.start_session().await?;
        }
        let written = match self.session.as_mut() {
            Some(session) => session.writer.write_all(data).await,
            None => return Err(MigrateError::Loader("no active batch session".to_string())),
        };

        if let Err(e) = written {
            // the COPY went away; its error explains more than the broken pipe
            let _ = self.end_session().await;
            return Err(self.captured.take().unwrap_or_else(|| e.into()));
        }
        Ok(())
    }

    async fn start_session(&mut self) -> Result<()> {
        let pipe = NamedPipe::create()?;
        let rejected = if self.options.copy.rejected_data {
            Some(tempfile::Builder::new().prefix("vertica-rejected-").tempfile()?)
        } else {
            None
        };

        let sql = CopyStatement {
            table: &self.table,
            columns: &self.columns,
            source: pipe.path(),
            rejected: rejected.as_ref().map(NamedTempFile::path),
            options: &self.options.copy,
        }
        .to_sql();

        let pending =
            PendingExecution::spawn(Arc::clone(&self.executor), sql, pipe.path().to_path_buf());
        let (pending, file) = pending.open_writer(pipe.path()).await?;

        debug!("Batch session started for {}", self.table);
        self.session = Some(Session {
            writer: BufWriter::new(file),
            pending,
            rejected,
            pipe,
        });
        self.diagnostics_consumed = false;
        self.ended_clean = true;
        Ok(())
    }

    /// Close the pipe and wait a bounded time for the COPY.
    ///
    /// The COPY's error, if any, is kept in `captured`. The pipe directory is
    /// removed on every path.
    async fn end_session(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        debug!("Closing FIFO {}", session.pipe.path().display());
        let closed = session.writer.shutdown().await;
        drop(session.writer);

        debug!("Waiting for COPY into {} to finish", self.table);
        match session.pending.finish(self.options.shutdown_timeout()).await {
            Completion::Loaded(rows) => {
                self.rows_loaded += rows;
                debug!("Batch session ended for {}", self.table);
            }
            Completion::Failed(e) => {
                self.captured = Some(e);
            }
            Completion::TimedOut => {
                warn!(
                    "COPY into {} did not finish within {:?}; releasing the pipe anyway",
                    self.table,
                    self.options.shutdown_timeout()
                );
                self.ended_clean = false;
            }
        }

        if let Some(rejected) = session.rejected {
            self.rejected_files.push(rejected);
        }
        drop(session.pipe);

        match closed {
            Err(e) if self.captured.is_none() => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Render a rejected-data file, one line per rejected record.
fn rejected_report(data: &[u8], terminator: char) -> String {
    let text = String::from_utf8_lossy(data);
    text.split(terminator)
        .filter(|record| !record.is_empty())
        .map(|record| format!("{}{}\n", REJECTED_PREFIX, record))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyOptions;
    use crate::testing::{quoted_after, MockExecutor};
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn options() -> LoaderOptions {
        LoaderOptions {
            copy: CopyOptions {
                delimiter: ',',
                ..CopyOptions::default()
            },
            ..LoaderOptions::default()
        }
    }

    fn loader(mock: &Arc<MockExecutor>) -> BatchLoader {
        let executor: Arc<dyn SqlExecutor> = mock.clone();
        BatchLoader::new(executor, "stg.t", vec!["a".into(), "b".into()], options()).unwrap()
    }

    #[test]
    fn test_rejected_report() {
        let report = rejected_report(b"1,x\x012,y\x01", '\x01');
        assert_eq!(
            report,
            "Rejected data at line: 1,x\nRejected data at line: 2,y\n"
        );
        assert_eq!(rejected_report(b"", '\x01'), "");
    }

    #[test]
    fn test_rejects_invalid_options() {
        let mock: Arc<dyn SqlExecutor> = Arc::new(MockExecutor::new());
        let mut opts = LoaderOptions::default();
        opts.copy.enclosed_by = ';';
        assert!(BatchLoader::new(mock.clone(), "stg.t", vec![], opts).is_err());
        assert!(BatchLoader::new(mock, "", vec![], LoaderOptions::default()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rows_stream_through_pipe() {
        let mock = Arc::new(MockExecutor::new());
        let mut loader = loader(&mock);

        loader
            .insert(&[
                SqlValue::from("é1"),
                SqlValue::from("a\"b"),
                SqlValue::Null,
                SqlValue::from(100),
            ])
            .await
            .unwrap();
        loader.insert_line("\"x\",\"y\"").await.unwrap();
        assert!(loader.in_session());
        assert_eq!(loader.count_since_flush(), 2);

        loader.commit().await.unwrap();
        assert!(!loader.in_session());
        assert_eq!(loader.count_since_flush(), 0);
        assert_eq!(loader.total_count(), 2);
        assert_eq!(loader.rows_loaded(), 2);

        let piped = String::from_utf8(mock.piped()).unwrap();
        assert_eq!(piped, "\"é1\",\"a\\\"b\",,\"100\"\x01\"x\",\"y\"\x01");
        assert_eq!(mock.count("COPY stg.t (a, b) FROM LOCAL"), 1);
        assert_eq!(mock.count_exact("COMMIT"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_counters_across_flushes() {
        let mock = Arc::new(MockExecutor::new());
        let mut loader = loader(&mock);

        for i in 0..3 {
            loader.insert(&[SqlValue::from(i), SqlValue::Null]).await.unwrap();
        }
        loader.insert_raw(b"\"3\",\"4\"\x01\"5\",\"6\"\x01").await.unwrap();
        assert_eq!(loader.count_since_flush(), 4);
        loader.rollback().await.unwrap();
        assert_eq!(loader.count_since_flush(), 0);

        let written = loader
            .insert_rows(vec![vec![SqlValue::from(7)], vec![SqlValue::from(8)]])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(loader.count_since_flush(), 2);
        assert_eq!(loader.total_count(), 6);
        loader.commit().await.unwrap();

        assert_eq!(mock.count("COPY "), 2);
        assert_eq!(mock.count_exact("ROLLBACK"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_errors_without_rows_issues_no_sql() {
        let mock = Arc::new(MockExecutor::new());
        let mut loader = loader(&mock);

        let (count, report) = loader.get_errors().await.unwrap();
        assert_eq!(count, 0);
        assert!(report.is_empty());
        assert!(mock.executed().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_errors_reports_rejections_and_constraints() {
        let mock = Arc::new(
            MockExecutor::new()
                .value("GET_NUM_REJECTED_ROWS", 1)
                .rows(
                    "ANALYZE_CONSTRAINTS",
                    vec![vec![
                        SqlValue::from("stg"),
                        SqlValue::from("t"),
                        SqlValue::from("a"),
                        SqlValue::from("C_PRIMARY"),
                    ]],
                )
                .reject(b"\"x\",\"y\"\x01"),
        );
        let mut loader = loader(&mock);

        loader.insert(&[SqlValue::from("x"), SqlValue::from("y")]).await.unwrap();
        let (count, report) = loader.get_errors().await.unwrap();

        assert!(!loader.in_session());
        assert_eq!(count, 2);
        assert_eq!(
            report,
            "At least one constraint not met: stg, t, a, C_PRIMARY\n\
             Rejected data at line: \"x\",\"y\"\n"
        );
        assert_eq!(mock.count("SELECT ANALYZE_CONSTRAINTS('stg.t')"), 1);

        // consumed until the next session or flush
        assert!(matches!(
            loader.get_errors().await,
            Err(MigrateError::Loader(_))
        ));
        loader.commit().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_constraints_are_tolerated() {
        let mock = Arc::new(
            MockExecutor::new()
                .value("GET_NUM_REJECTED_ROWS", 0)
                .fail("ANALYZE_CONSTRAINTS", "No constraints defined for table"),
        );
        let mut loader = loader(&mock);

        loader.insert(&[SqlValue::from(1), SqlValue::from(2)]).await.unwrap();
        let (count, report) = loader.get_errors().await.unwrap();
        assert_eq!(count, 0);
        assert!(report.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_copy_failure_surfaces_at_commit() {
        let mock = Arc::new(MockExecutor::new().fail("COPY", "column \"b\" does not exist"));
        let mut loader = loader(&mock);

        // the failure may surface at insert time or at commit, never later
        let inserted = loader.insert(&[SqlValue::from(1), SqlValue::from(2)]).await;
        let err = match inserted {
            Err(e) => e,
            Ok(()) => loader.commit().await.unwrap_err(),
        };
        assert!(err.to_string().contains("does not exist"));
        assert!(!loader.in_session());
        assert_eq!(mock.count_exact("COMMIT"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rollback_still_runs_after_copy_failure() {
        let mock = Arc::new(MockExecutor::new().fail("COPY", "permission denied"));
        let mut loader = loader(&mock);

        if loader.insert(&[SqlValue::from(1), SqlValue::from(2)]).await.is_ok() {
            let err = loader.rollback().await.unwrap_err();
            assert!(err.to_string().contains("permission denied"));
            assert_eq!(mock.count_exact("ROLLBACK"), 1);
        }
        assert_eq!(loader.count_since_flush(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_truncate_outside_session() {
        let mock = Arc::new(MockExecutor::new());
        let mut loader = loader(&mock);

        loader.truncate_table().await.unwrap();
        assert_eq!(mock.count("TRUNCATE TABLE stg.t"), 1);

        loader.insert(&[SqlValue::from(1), SqlValue::from(2)]).await.unwrap();
        assert!(matches!(
            loader.truncate_table().await,
            Err(MigrateError::Loader(_))
        ));
        assert!(loader.close().await.unwrap());
        assert!(loader.ended_cleanly());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_copy_is_detached_and_pipe_released() {
        let mock = Arc::new(MockExecutor::new().slow_copy(Duration::from_secs(30)));
        let executor: Arc<dyn SqlExecutor> = mock.clone();
        let opts = LoaderOptions {
            shutdown_timeout_ms: 100,
            ..options()
        };
        let mut loader = BatchLoader::new(executor, "stg.t", vec![], opts).unwrap();

        loader.insert(&[SqlValue::from(1)]).await.unwrap();
        let copy = mock
            .executed()
            .into_iter()
            .find(|sql| sql.starts_with("COPY "))
            .unwrap();
        let fifo = quoted_after(&copy, "FROM LOCAL '").unwrap();
        let fifo_dir = Path::new(&fifo).parent().unwrap().to_path_buf();
        assert!(fifo_dir.exists());

        let started = Instant::now();
        assert!(!loader.close().await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!loader.ended_cleanly());
        assert!(!loader.in_session());
        assert!(!fifo_dir.exists());
    }
}
