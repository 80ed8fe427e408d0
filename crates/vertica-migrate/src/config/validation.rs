//! Configuration validation.

use super::{Config, CopyOptions, EndpointConfig};
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint("source", &config.source)?;
    validate_endpoint("target", &config.target)?;

    // Cannot migrate into the database we read from
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    for selector in &config.migration.tables {
        if selector.trim().is_empty() || selector.split('.').count() > 2 {
            return Err(MigrateError::Config(format!(
                "migration.tables entry '{}' must be 'schema' or 'schema.table'",
                selector
            )));
        }
    }

    if config.migration.vsql_path.is_empty() {
        return Err(MigrateError::Config(
            "migration.vsql_path cannot be empty".into(),
        ));
    }

    if config.loader.shutdown_timeout_ms == 0 {
        return Err(MigrateError::Config(
            "loader.shutdown_timeout_ms must be at least 1".into(),
        ));
    }

    validate_copy_options(&config.loader.copy)
}

fn validate_endpoint(side: &str, endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", side)));
    }
    if endpoint.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", side)));
    }
    if endpoint.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", side)));
    }
    Ok(())
}

/// The delimiter, enclosure and terminator must be distinguishable in the stream.
pub fn validate_copy_options(copy: &CopyOptions) -> Result<()> {
    if copy.delimiter == copy.enclosed_by {
        return Err(MigrateError::Config(
            "copy.delimiter and copy.enclosed_by must differ".into(),
        ));
    }
    if copy.delimiter == copy.record_terminator || copy.enclosed_by == copy.record_terminator {
        return Err(MigrateError::Config(
            "copy.record_terminator must differ from the delimiter and enclosure".into(),
        ));
    }
    Ok(())
}
