//! Schema migration between two Vertica databases.
//!
//! The DDL exported from the source is split into statements and applied on
//! the target. Export order does not follow dependencies, so failures are
//! retried pass after pass until every statement succeeds or a pass stops
//! making progress. Identity columns become an explicit sequence plus a
//! column default, and sequences resume where the source left off.

mod classify;
mod export;

pub use classify::{DdlClassifier, DdlKind, RegexClassifier, SkipReason};
pub use export::{export_query, fetch_ddl};

use std::ops::Range;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, MigrationConfig};
use crate::core::identifier::escape_literal;
use crate::core::SqlExecutor;
use crate::error::{MigrateError, Result};

/// Outcome of a schema migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DdlReport {
    /// Statements sent to the target, synthesized ones included.
    pub statements: usize,
    /// Statements that succeeded.
    pub applied: usize,
    /// Statements tolerated because the object already existed.
    pub already_existing: usize,
    /// Exported statements that were not reproduced.
    pub skipped: usize,
    /// Full passes over the pending statements.
    pub passes: usize,
}

/// Statements ready to be applied, after classification and rewriting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedDdl {
    pub statements: Vec<String>,
    pub skipped: usize,
}

/// Reproduces source schema objects on the target.
pub struct DdlMigrator {
    source: Arc<dyn SqlExecutor>,
    target: Arc<dyn SqlExecutor>,
    source_endpoint: EndpointConfig,
    config: MigrationConfig,
    classifier: Box<dyn DdlClassifier>,
    start_with: Regex,
}

impl DdlMigrator {
    pub fn new(
        source: Arc<dyn SqlExecutor>,
        target: Arc<dyn SqlExecutor>,
        source_endpoint: EndpointConfig,
        config: MigrationConfig,
    ) -> Result<Self> {
        let start_with = Regex::new(r"(?i)\bSTART\s+WITH\s+-?\d+")
            .map_err(|e| MigrateError::Config(format!("invalid DDL pattern: {}", e)))?;
        Ok(Self {
            source,
            target,
            source_endpoint,
            config,
            classifier: Box::new(RegexClassifier::new()?),
            start_with,
        })
    }

    /// Replace the statement classifier.
    pub fn with_classifier(mut self, classifier: Box<dyn DdlClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Export the DDL of `objects` (comma-separated, "" = everything).
    pub async fn fetch_ddl(&self, objects: &str) -> Result<String> {
        info!("Getting DDLs...");
        fetch_ddl(
            self.source.as_ref(),
            &self.source_endpoint,
            &self.config.vsql_path,
            objects,
        )
        .await
    }

    pub fn classify(&self, statement: &str) -> DdlKind {
        self.classifier.classify(statement)
    }

    /// Give a `CREATE SEQUENCE` the START WITH of the source's next value.
    pub async fn rewrite_sequence(&self, statement: &str, schema: &str, name: &str) -> Result<String> {
        let sql = format!(
            "SELECT current_value FROM v_catalog.sequences \
             WHERE sequence_schema = '{}' AND sequence_name = '{}'",
            escape_literal(unquote(schema)),
            escape_literal(unquote(name))
        );
        let current = self
            .source
            .fetch_value(&sql)
            .await?
            .and_then(|v| v.as_i64());
        if current.is_none() {
            warn!("No current value for sequence {}.{}, starting at 1", schema, name);
        }
        let start = current.unwrap_or(0).saturating_add(1).max(1);

        Ok(if self.start_with.is_match(statement) {
            self.start_with
                .replace(statement, format!("START WITH {}", start).as_str())
                .into_owned()
        } else {
            format!("{} START WITH {}", statement, start)
        })
    }

    /// Turn a `CREATE TABLE` with an identity column into three statements:
    /// the sequence, the table with a plain integer column, and the column
    /// default drawing from the sequence.
    pub async fn rewrite_identity(
        &self,
        statement: &str,
        schema: &str,
        table: &str,
        column: &str,
        span: Range<usize>,
    ) -> Result<Vec<String>> {
        let table_def = match statement.get(span.clone()) {
            Some(_) => format!(
                "{}INT NOT NULL{}",
                &statement[..span.start],
                &statement[span.end..]
            ),
            None => {
                return Err(MigrateError::Migration(format!(
                    "identity span {:?} outside of statement for {}.{}",
                    span, schema, table
                )))
            }
        };

        let sequence_sql = format!(
            "SELECT sequence_name FROM v_catalog.sequences \
             WHERE sequence_schema = '{}' AND identity_table_name = '{}'",
            escape_literal(unquote(schema)),
            escape_literal(unquote(table))
        );
        let sequence = match self
            .source
            .fetch_value(&sequence_sql)
            .await?
            .and_then(|v| v.as_string())
        {
            Some(name) => name,
            None => {
                let name = format!("{}_{}_seq", unquote(table), unquote(column));
                debug!("No identity sequence recorded for {}.{}, using {}", schema, table, name);
                name
            }
        };

        let max = self
            .source
            .fetch_value(&format!("SELECT MAX({}) FROM {}.{}", column, schema, table))
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let start = max.saturating_add(1).max(1);

        Ok(vec![
            format!("CREATE SEQUENCE {}.{} START WITH {}", schema, sequence, start),
            table_def,
            format!(
                "ALTER TABLE {}.{} ALTER COLUMN {} SET DEFAULT NEXTVAL('{}.{}')",
                schema, table, column, schema, sequence
            ),
        ])
    }

    /// Split, classify and rewrite an exported DDL script.
    pub async fn prepare(&self, ddl: &str) -> Result<PreparedDdl> {
        let mut prepared = PreparedDdl::default();

        for statement in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match self.classify(statement) {
                DdlKind::Skip(reason) => {
                    debug!("Skipping {:?}: {}", reason, first_line(statement));
                    prepared.skipped += 1;
                }
                DdlKind::Sequence { schema, name } => {
                    let rewritten = self.rewrite_sequence(statement, &schema, &name).await?;
                    prepared.statements.push(rewritten);
                }
                DdlKind::Identity {
                    schema,
                    table,
                    column,
                    span,
                } => {
                    let rewritten = self
                        .rewrite_identity(statement, &schema, &table, &column, span)
                        .await?;
                    prepared.statements.extend(rewritten);
                }
                DdlKind::Plain => prepared.statements.push(statement.to_string()),
            }
        }

        Ok(prepared)
    }

    /// Apply statements on the target, retrying failures until a fixpoint.
    ///
    /// A pass runs every pending statement once; failures are queued for
    /// the next pass. Passes continue while the queue shrinks. Once it stops
    /// shrinking, the remaining statements are run one more time only to log
    /// their errors, and the migration fails.
    pub async fn apply(&self, statements: Vec<String>) -> Result<DdlReport> {
        let mut report = DdlReport {
            statements: statements.len(),
            ..DdlReport::default()
        };

        if !self.config.commit {
            for statement in &statements {
                info!("[dry run] {}", first_line(statement));
                debug!("{}", statement);
            }
            return Ok(report);
        }

        let mut pending = statements;
        while !pending.is_empty() {
            report.passes += 1;
            let attempted = pending.len();
            let mut failed = Vec::new();

            for statement in pending {
                info!("{}", first_line(&statement));
                match self.target.execute(&statement).await {
                    Ok(_) => report.applied += 1,
                    Err(e) if self.config.idempotent_ddl && e.is_already_exists() => {
                        debug!("Already exists: {}", first_line(&statement));
                        report.already_existing += 1;
                    }
                    Err(e) => {
                        debug!("Queued for retry: {}", e);
                        failed.push(statement);
                    }
                }
            }

            // the first pass has no earlier queue to compare against
            if report.passes > 1 && !failed.is_empty() && failed.len() >= attempted {
                return Err(self.log_residual(&failed, report.passes).await);
            }
            pending = failed;
        }

        info!(
            "{} DDLs migrated in {} passes",
            report.applied + report.already_existing,
            report.passes
        );
        Ok(report)
    }

    /// Run the statements left at the fixpoint once more to log their errors.
    async fn log_residual(&self, failed: &[String], passes: usize) -> MigrateError {
        warn!(
            "{} DDL statements stopped making progress after {} passes",
            failed.len(),
            passes
        );
        for statement in failed {
            match self.target.execute(statement).await {
                Ok(_) => debug!("Succeeded after the last pass: {}", first_line(statement)),
                Err(e) => error!("{}", e),
            }
        }
        MigrateError::Migration(format!(
            "{} DDL statements could not be applied after {} passes",
            failed.len(),
            passes
        ))
    }

    /// Fetch, prepare and apply the schema of the configured objects.
    pub async fn migrate(&self) -> Result<DdlReport> {
        let objects = self.config.tables.join(",");
        let ddl = self.fetch_ddl(&objects).await?;

        info!("Migrating DDLs...");
        let prepared = self.prepare(&ddl).await?;
        let mut report = self.apply(prepared.statements).await?;
        report.skipped = prepared.skipped;

        if self.config.commit {
            self.target.commit().await?;
        }
        Ok(report)
    }
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or(statement)
}

fn unquote(identifier: &str) -> &str {
    identifier
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(identifier)
}
