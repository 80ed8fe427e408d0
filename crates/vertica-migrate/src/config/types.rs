//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database.
    pub source: EndpointConfig,

    /// Target database.
    pub target: EndpointConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Bulk loader settings used by client-streamed transfers.
    #[serde(default)]
    pub loader: LoaderOptions,
}

/// Connection details of one Vertica database.
///
/// Besides identifying the database in logs, these details feed the
/// `CONNECT TO VERTICA` link statement and the vsql fallback, which cannot
/// be derived from an already open connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// ODBC data source name, if connections are made through a DSN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,

    /// Database host.
    pub host: String,

    /// Database port (default: 5433).
    #[serde(default = "default_vertica_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("dsn", &self.dsn)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Execute statements on the target. When false, everything is logged only.
    #[serde(default)]
    pub commit: bool,

    /// Objects to migrate: `schema` or `schema.table` selectors. Empty means all.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Allow migrating into a target that already holds user tables.
    #[serde(default)]
    pub even_not_empty: bool,

    /// Count "already exists" DDL failures as applied instead of retrying them.
    #[serde(default)]
    pub idempotent_ddl: bool,

    /// Skip the schema phase.
    #[serde(default)]
    pub skip_ddl: bool,

    /// Skip the data phase.
    #[serde(default)]
    pub skip_data: bool,

    /// Copy at most this many rows per table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,

    /// Truncate each target table before copying into it.
    #[serde(default)]
    pub truncate: bool,

    /// Pause after a failed table before moving on (milliseconds).
    #[serde(default = "default_failure_pause_ms")]
    pub failure_pause_ms: u64,

    /// vsql binary used when EXPORT_OBJECTS returns nothing over the connection.
    #[serde(default = "default_vsql_path")]
    pub vsql_path: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            commit: false,
            tables: Vec::new(),
            even_not_empty: false,
            idempotent_ddl: false,
            skip_ddl: false,
            skip_data: false,
            row_limit: None,
            truncate: false,
            failure_pause_ms: default_failure_pause_ms(),
            vsql_path: default_vsql_path(),
        }
    }
}

impl MigrationConfig {
    /// Pause applied after a recoverable per-table failure.
    pub fn failure_pause(&self) -> Duration {
        Duration::from_millis(self.failure_pause_ms)
    }
}

/// How a literal enclosure character inside a value is escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscapeStyle {
    /// Prefix with a backslash (`a\"b`), Vertica's default escape character.
    #[default]
    Backslash,
    /// Double the enclosure character (`a""b`); the COPY runs with `NO ESCAPE`.
    Double,
}

/// Options of the COPY statement and of the matching text encoding.
///
/// Every loader owns its own copy; overriding a field on one loader never
/// affects another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyOptions {
    /// Field delimiter (default: `;`).
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Enclosure character wrapped around every non-null value (default: `"`).
    #[serde(default = "default_enclosed_by")]
    pub enclosed_by: char,

    /// Escape style for enclosure characters inside values.
    #[serde(default)]
    pub escape: EscapeStyle,

    /// Null marker (default: empty string).
    #[serde(default)]
    pub null: String,

    /// Record terminator (default: `\x01`).
    #[serde(default = "default_record_terminator")]
    pub record_terminator: char,

    /// Leading records to skip.
    #[serde(default)]
    pub skip: u64,

    /// Write rejected rows to a scratch file for later inspection.
    #[serde(default = "default_true")]
    pub rejected_data: bool,

    /// Maximum rejected rows before the COPY fails (0 = no limit).
    #[serde(default)]
    pub reject_max: u64,

    /// Leave the transaction open so commit/rollback decide the outcome.
    #[serde(default = "default_true")]
    pub no_commit: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            enclosed_by: default_enclosed_by(),
            escape: EscapeStyle::default(),
            null: String::new(),
            record_terminator: default_record_terminator(),
            skip: 0,
            rejected_data: true,
            reject_max: 0,
            no_commit: true,
        }
    }
}

/// Bulk loader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderOptions {
    /// COPY options and text encoding.
    #[serde(default)]
    pub copy: CopyOptions,

    /// Run ANALYZE_CONSTRAINTS when collecting errors.
    #[serde(default = "default_true")]
    pub analyze_constraints: bool,

    /// Bounded wait for the ingest task after the pipe is closed (milliseconds).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            copy: CopyOptions::default(),
            analyze_constraints: true,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl LoaderOptions {
    /// Bounded wait for the ingest task at session end.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn default_vertica_port() -> u16 {
    5433
}

fn default_failure_pause_ms() -> u64 {
    5_000
}

fn default_vsql_path() -> String {
    "/opt/vertica/bin/vsql".to_string()
}

fn default_delimiter() -> char {
    ';'
}

fn default_enclosed_by() -> char {
    '"'
}

fn default_record_terminator() -> char {
    '\x01'
}

fn default_shutdown_timeout_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}
