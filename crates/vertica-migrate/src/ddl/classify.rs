//! DDL statement classification.

use std::ops::Range;

use regex::Regex;

use crate::error::{MigrateError, Result};

/// Why a statement is not reproduced on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Projections are derived storage; the target builds its own.
    Projection,
    /// Temporary tables do not outlive the session that created them.
    TempTable,
}

/// What to do with one exported statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlKind {
    Skip(SkipReason),
    /// `CREATE SEQUENCE`; needs a START WITH matching the source position.
    Sequence { schema: String, name: String },
    /// `CREATE TABLE` with an identity column; `span` covers the identity
    /// type in the statement text.
    Identity {
        schema: String,
        table: String,
        column: String,
        span: Range<usize>,
    },
    Plain,
}

/// Tags exported DDL statements.
///
/// Implementations must be pure: the same text always yields the same kind.
pub trait DdlClassifier: Send + Sync {
    fn classify(&self, statement: &str) -> DdlKind;
}

/// Line-anchored regular expression classifier.
///
/// Handles one identity column per table, which is all Vertica allows.
#[derive(Debug, Clone)]
pub struct RegexClassifier {
    projection: Regex,
    temp_table: Regex,
    sequence: Regex,
    create_table: Regex,
    identity_column: Regex,
}

impl RegexClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            projection: compile(r"(?is)^\s*CREATE\s+PROJECTION\b")?,
            temp_table: compile(
                r"(?is)^\s*CREATE\s+(?:LOCAL\s+|GLOBAL\s+)?TEMP(?:ORARY)?\s+TABLE\b",
            )?,
            sequence: compile(
                r#"(?i)^\s*CREATE\s+SEQUENCE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?P<schema>"[^"]+"|[^\s."]+)\.(?P<name>"[^"]+"|[^\s;"]+)"#,
            )?,
            create_table: compile(
                r#"(?i)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?P<schema>"[^"]+"|[^\s.("]+)\.(?P<table>"[^"]+"|[^\s("]+)"#,
            )?,
            identity_column: compile(
                r#"(?im)^\s*(?P<column>"[^"]+"|\w+)\s+(?P<kind>IDENTITY|AUTO_INCREMENT)\b(?:\s*\([^)]*\))?"#,
            )?,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| MigrateError::Config(format!("invalid DDL pattern: {}", e)))
}

impl DdlClassifier for RegexClassifier {
    fn classify(&self, statement: &str) -> DdlKind {
        if self.projection.is_match(statement) {
            return DdlKind::Skip(SkipReason::Projection);
        }
        if self.temp_table.is_match(statement) {
            return DdlKind::Skip(SkipReason::TempTable);
        }

        if let Some(caps) = self.sequence.captures(statement) {
            return DdlKind::Sequence {
                schema: caps["schema"].to_string(),
                name: caps["name"].to_string(),
            };
        }

        if let Some(table_caps) = self.create_table.captures(statement) {
            if let Some(caps) = self.identity_column.captures(statement) {
                if let (Some(kind), Some(whole)) = (caps.name("kind"), caps.get(0)) {
                    return DdlKind::Identity {
                        schema: table_caps["schema"].to_string(),
                        table: table_caps["table"].to_string(),
                        column: caps["column"].to_string(),
                        span: kind.start()..whole.end(),
                    };
                }
            }
        }

        DdlKind::Plain
    }
}
