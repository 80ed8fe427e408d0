//! Error types for the loader and migration library.

use thiserror::Error;

use crate::transfer::DataReport;

/// Main error type for loading and migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection to a database was lost or could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// A statement was rejected by the database
    #[error("SQL error: {message}\n  Statement: {statement}")]
    Sql { statement: String, message: String },

    /// The background ingest task failed without a SQL error (e.g. it panicked)
    #[error("Ingest error: {0}")]
    Ingest(String),

    /// The loader was used out of order
    #[error("Loader error: {0}")]
    Loader(String),

    /// DDL could not be exported from the source
    #[error("DDL export failed: {0}")]
    DdlExport(String),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// An unexpected failure stopped the data migration.
    ///
    /// `report` covers the whole run: earlier failures, the table that
    /// stopped it and every table not attempted.
    #[error("Data migration aborted at table {table} ({} tables not attempted): {source}", .remaining.len())]
    Aborted {
        table: String,
        remaining: Vec<String>,
        report: Box<DataReport>,
        #[source]
        source: Box<MigrateError>,
    },

    /// IO error (pipes, scratch files, subprocesses)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Sql error for a rejected statement
    pub fn sql(statement: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Sql {
            statement: statement.into(),
            message: message.into(),
        }
    }

    /// Whether a per-table failure can be recorded and skipped.
    ///
    /// Anything else (lost connections, IO failures, bugs) stops the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MigrateError::Sql { .. } | MigrateError::Ingest(_))
    }

    /// Whether the database reported that the object already exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            MigrateError::Sql { message, .. } => message.to_lowercase().contains("already exists"),
            _ => false,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for loader and migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferMode;

    #[test]
    fn test_recoverable_classes() {
        assert!(MigrateError::sql("COPY t", "boom").is_recoverable());
        assert!(MigrateError::Ingest("panicked".into()).is_recoverable());
        assert!(!MigrateError::Connection("gone".into()).is_recoverable());
        assert!(!MigrateError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_already_exists() {
        let err = MigrateError::sql("CREATE TABLE s.t (id INT)", "Object \"t\" already exists");
        assert!(err.is_already_exists());
        assert!(!MigrateError::sql("CREATE TABLE s.t", "syntax error").is_already_exists());
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let err = MigrateError::Aborted {
            table: "s.b".into(),
            remaining: vec!["s.c".into()],
            report: Box::new(DataReport {
                mode: TransferMode::Direct,
                tables_total: 3,
                tables_succeeded: 1,
                rows: 10,
                failures: Vec::new(),
            }),
            source: Box::new(MigrateError::Connection("node down".into())),
        };
        let detailed = err.format_detailed();
        assert!(detailed.contains("aborted at table s.b"));
        assert!(detailed.contains("Caused by:"));
        assert!(detailed.contains("node down"));
    }
}
