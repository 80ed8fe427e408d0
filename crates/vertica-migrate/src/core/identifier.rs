//! Identifier validation and literal quoting for dynamically built SQL.
//!
//! Object names read from the catalog end up inside COPY, EXPORT and
//! catalog queries. Identifiers cannot be bound as parameters, so they are
//! validated here and string literals are escaped before interpolation.

use crate::error::{MigrateError, Result};

/// Vertica's identifier length limit in bytes.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Escape a string literal value: `O'Brien` -> `O''Brien`.
pub fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Quote a string literal: `O'Brien` -> `'O''Brien'`.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", escape_literal(s))
}
