//! Table data transfer between two Vertica databases.
//!
//! Two paths move the rows:
//! - **direct**: the source pushes each table to the target over a
//!   `CONNECT TO VERTICA` link with `EXPORT TO VERTICA`
//! - **odbc**: rows are read through the source connection and streamed
//!   into the target with a [`BatchLoader`]
//!
//! The direct path is used whenever the source can open the link.
//! Tables are transferred one after another. A failing table is recorded
//! and skipped unless the failure is not one a single table can cause, in
//! which case the run stops.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, LoaderOptions, MigrationConfig};
use crate::core::identifier::{escape_literal, quote_literal};
use crate::core::{SqlExecutor, SqlValue};
use crate::error::{MigrateError, Result};
use crate::loader::BatchLoader;

/// Scratch table used to check that an export to the target goes through.
const LINK_CHECK_TABLE: &str = "public.vertica_migrate_link_check";

/// How table contents travel from source to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Server-to-server `EXPORT TO VERTICA`.
    Direct,
    /// Client-streamed through both connections.
    Odbc,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Direct => write!(f, "direct"),
            TransferMode::Odbc => write!(f, "odbc"),
        }
    }
}

/// A user table, named as the catalog reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// A table that could not be transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

/// Outcome of a data migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataReport {
    pub mode: TransferMode,
    pub tables_total: usize,
    pub tables_succeeded: usize,
    /// Rows exported or streamed, summed over successful tables.
    pub rows: u64,
    pub failures: Vec<TableFailure>,
}

/// Catalog query listing the user tables matched by `filter`.
///
/// Selectors are `schema` or `schema.table`; an empty filter matches every
/// user table.
pub fn target_objects_query(filter: &[String]) -> String {
    let mut sql = String::from(
        "SELECT table_schema, table_name FROM v_catalog.tables \
         WHERE is_system_table = false AND is_temp_table = false",
    );

    let clauses: Vec<String> = filter
        .iter()
        .map(|selector| match selector.split_once('.') {
            Some((schema, table)) => format!(
                "(table_schema = '{}' AND table_name = '{}')",
                escape_literal(schema),
                escape_literal(table)
            ),
            None => format!("(table_schema = '{}')", escape_literal(selector)),
        })
        .collect();

    if !clauses.is_empty() {
        sql.push_str(" AND (");
        sql.push_str(&clauses.join(" OR "));
        sql.push(')');
    }
    sql.push_str(" ORDER BY table_schema, table_name");
    sql
}

/// Copies table contents from the source to the target.
pub struct DataMigrator {
    source: Arc<dyn SqlExecutor>,
    target: Arc<dyn SqlExecutor>,
    target_endpoint: EndpointConfig,
    config: MigrationConfig,
    loader: LoaderOptions,
}

impl DataMigrator {
    pub fn new(
        source: Arc<dyn SqlExecutor>,
        target: Arc<dyn SqlExecutor>,
        target_endpoint: EndpointConfig,
        config: MigrationConfig,
        loader: LoaderOptions,
    ) -> Self {
        Self {
            source,
            target,
            target_endpoint,
            config,
            loader,
        }
    }

    fn connect_sql(&self) -> String {
        let ep = &self.target_endpoint;
        format!(
            "CONNECT TO VERTICA {} USER {} PASSWORD {} ON {},{}",
            ep.database,
            ep.user,
            quote_literal(&ep.password),
            quote_literal(&ep.host),
            ep.port
        )
    }

    fn disconnect_sql(&self) -> String {
        format!("DISCONNECT {}", self.target_endpoint.database)
    }

    async fn connect(&self) -> Result<()> {
        info!(
            "CONNECT TO VERTICA {} USER {} ON '{}',{}",
            self.target_endpoint.database,
            self.target_endpoint.user,
            self.target_endpoint.host,
            self.target_endpoint.port
        );
        self.source.execute(&self.connect_sql()).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self.source.execute(&self.disconnect_sql()).await {
            warn!("Could not close the link to {}: {}", self.target_endpoint.database, e);
        }
    }

    /// Decide whether the source can push rows to the target itself.
    ///
    /// The source opens the link and exports an empty result into a
    /// scratch table on the target. Any failure means the rows have to be
    /// streamed through the client. A dry run only opens the link.
    pub async fn detect_transfer_mode(&self) -> TransferMode {
        let outcome = match self.connect().await {
            Ok(()) => {
                let exported = if self.config.commit {
                    self.export_round_trip().await
                } else {
                    Ok(())
                };
                self.disconnect().await;
                exported
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!("Source can export to the target, using direct transfer");
                TransferMode::Direct
            }
            Err(e) => {
                debug!("Direct transfer check failed: {}", e);
                info!("Source cannot export to the target, using odbc transfer");
                TransferMode::Odbc
            }
        }
    }

    async fn export_round_trip(&self) -> Result<()> {
        self.target
            .execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (id INT)",
                LINK_CHECK_TABLE
            ))
            .await?;
        self.target.commit().await?;

        let exported = self
            .source
            .execute(&format!(
                "EXPORT TO VERTICA {}.{} AS SELECT 1 AS id LIMIT 0",
                self.target_endpoint.database, LINK_CHECK_TABLE
            ))
            .await;

        let dropped = self
            .target
            .execute(&format!("DROP TABLE IF EXISTS {}", LINK_CHECK_TABLE))
            .await;
        match dropped {
            Ok(_) => self.target.commit().await?,
            Err(e) => warn!("Could not drop {}: {}", LINK_CHECK_TABLE, e),
        }

        exported.map(|_| ())
    }

    /// Resolve schema and table selectors to the target's user tables.
    pub async fn list_target_objects(&self, filter: &[String]) -> Result<Vec<TableRef>> {
        let rows = self.target.fetch_all(&target_objects_query(filter)).await?;
        rows.into_iter()
            .map(|row| {
                let mut values = row.into_iter();
                match (
                    values.next().and_then(|v| v.as_string()),
                    values.next().and_then(|v| v.as_string()),
                ) {
                    (Some(schema), Some(table)) => Ok(TableRef::new(schema, table)),
                    _ => Err(MigrateError::Migration(
                        "catalog returned a table without schema or name".into(),
                    )),
                }
            })
            .collect()
    }

    fn limit_clause(&self) -> String {
        match self.config.row_limit {
            Some(limit) => format!(" LIMIT {}", limit),
            None => String::new(),
        }
    }

    /// Transfer one table; returns the number of rows moved.
    pub async fn transfer_table(&self, mode: TransferMode, table: &TableRef) -> Result<u64> {
        match mode {
            TransferMode::Direct => self.export_table(table).await,
            TransferMode::Odbc => self.stream_table(table).await,
        }
    }

    async fn export_table(&self, table: &TableRef) -> Result<u64> {
        let sql = format!(
            "EXPORT TO VERTICA {}.{} AS SELECT * FROM {}{}",
            self.target_endpoint.database,
            table,
            table,
            self.limit_clause()
        );
        info!("{}...", sql);

        if !self.config.commit {
            return Ok(0);
        }

        if self.config.truncate {
            self.target.execute(&format!("TRUNCATE TABLE {}", table)).await?;
            self.target.commit().await?;
        }

        let rows = self.source.execute(&sql).await?;
        info!("{} rows exported", rows);
        Ok(rows)
    }

    async fn stream_table(&self, table: &TableRef) -> Result<u64> {
        let query = format!("SELECT * FROM {}{}", table, self.limit_clause());
        info!("{} (streamed to {})...", query, self.target_endpoint.describe());

        if !self.config.commit {
            return Ok(0);
        }

        let mut loader = BatchLoader::new(
            self.target.clone(),
            table.to_string(),
            Vec::new(),
            self.loader.clone(),
        )?;

        if let Err(e) = self.feed(&mut loader, &query).await {
            if let Err(rollback) = loader.rollback().await {
                debug!("Rollback after failed transfer of {}: {}", table, rollback);
            }
            return Err(e);
        }

        let (rejected, report) = match loader.get_errors().await {
            Ok(errors) => errors,
            Err(e) => {
                if let Err(rollback) = loader.rollback().await {
                    debug!("Rollback after failed transfer of {}: {}", table, rollback);
                }
                return Err(e);
            }
        };
        if rejected > 0 {
            warn!("{} rows rejected while loading {}:\n{}", rejected, table, report);
        }

        loader.commit().await?;
        let rows = loader.rows_loaded();
        info!("{} rows streamed", rows);
        Ok(rows)
    }

    async fn feed(&self, loader: &mut BatchLoader, query: &str) -> Result<()> {
        if self.config.truncate {
            loader.truncate_table().await?;
        }

        let mut rows = self.source.stream(query).await?;
        while let Some(row) = rows.recv().await {
            let row: Vec<SqlValue> = row?.into_iter().map(SqlValue::into_unicode).collect();
            loader.insert(&row).await?;
        }
        Ok(())
    }

    /// Transfer every selected table.
    ///
    /// Recoverable failures are recorded and followed by a short pause;
    /// any other failure aborts the run. The abort carries the report so
    /// far, with the stopping table and the ones never attempted counted
    /// as failed.
    pub async fn migrate(&self) -> Result<DataReport> {
        let mode = self.detect_transfer_mode().await;
        let tables = self.list_target_objects(&self.config.tables).await?;
        info!("Migrating data of {} tables ({} mode)", tables.len(), mode);

        if mode == TransferMode::Direct {
            self.connect().await?;
        }
        let result = self.transfer_all(mode, &tables).await;
        if mode == TransferMode::Direct {
            self.disconnect().await;
        }
        result
    }

    async fn transfer_all(&self, mode: TransferMode, tables: &[TableRef]) -> Result<DataReport> {
        let mut report = DataReport {
            mode,
            tables_total: tables.len(),
            tables_succeeded: 0,
            rows: 0,
            failures: Vec::new(),
        };

        for (idx, table) in tables.iter().enumerate() {
            match self.transfer_table(mode, table).await {
                Ok(rows) => {
                    report.tables_succeeded += 1;
                    report.rows += rows;
                }
                Err(e) if e.is_recoverable() => {
                    error!("Transfer of {} failed: {}", table, e);
                    report.failures.push(TableFailure {
                        table: table.to_string(),
                        error: e.to_string(),
                    });
                    tokio::time::sleep(self.config.failure_pause()).await;
                }
                Err(e) => {
                    let remaining: Vec<String> =
                        tables[idx + 1..].iter().map(ToString::to_string).collect();
                    error!(
                        "Transfer of {} failed, {} tables not attempted: {}",
                        table,
                        remaining.len(),
                        e
                    );
                    report.failures.push(TableFailure {
                        table: table.to_string(),
                        error: e.to_string(),
                    });
                    report.failures.extend(remaining.iter().map(|t| TableFailure {
                        table: t.clone(),
                        error: "not attempted".to_string(),
                    }));
                    return Err(MigrateError::Aborted {
                        table: table.to_string(),
                        remaining,
                        report: Box::new(report),
                        source: Box::new(e),
                    });
                }
            }
        }

        if report.failures.is_empty() {
            info!("All data migrated: {} rows", report.rows);
        } else {
            warn!(
                "{} of {} tables failed: {}",
                report.failures.len(),
                report.tables_total,
                report
                    .failures
                    .iter()
                    .map(|f| f.table.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(report)
    }
}
