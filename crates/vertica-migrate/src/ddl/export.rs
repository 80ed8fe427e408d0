//! Fetching DDL text from the source catalog.

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::EndpointConfig;
use crate::core::identifier::quote_literal;
use crate::core::SqlExecutor;
use crate::error::{MigrateError, Result};

/// `EXPORT_OBJECTS` query for a comma-separated object list ("" = everything).
pub fn export_query(objects: &str) -> String {
    format!("SELECT EXPORT_OBJECTS('', {}, false)", quote_literal(objects))
}

/// Fetch DDL through `EXPORT_OBJECTS`, falling back to the vsql client.
///
/// Some drivers return NULL for large exports; vsql prints the same text.
pub async fn fetch_ddl(
    source: &dyn SqlExecutor,
    endpoint: &EndpointConfig,
    vsql_path: &str,
    objects: &str,
) -> Result<String> {
    let query = export_query(objects);

    match source.fetch_value(&query).await {
        Ok(Some(value)) => {
            if let Some(ddl) = value.as_string().filter(|ddl| !ddl.trim().is_empty()) {
                info!("Got DDLs");
                return Ok(ddl);
            }
            warn!("EXPORT_OBJECTS returned empty text, falling back to vsql");
        }
        Ok(None) => warn!("EXPORT_OBJECTS returned nothing, falling back to vsql"),
        Err(e) => warn!("EXPORT_OBJECTS failed ({}), falling back to vsql", e),
    }

    let ddl = vsql_export(vsql_path, endpoint, &query).await?;
    info!("Got DDLs (from vsql)");
    Ok(ddl)
}

async fn vsql_export(vsql_path: &str, endpoint: &EndpointConfig, query: &str) -> Result<String> {
    let port = endpoint.port.to_string();
    let output = Command::new(vsql_path)
        .args([
            "-U",
            endpoint.user.as_str(),
            "-h",
            endpoint.host.as_str(),
            "-p",
            port.as_str(),
            "-d",
            endpoint.database.as_str(),
            "-t",
            "-w",
            endpoint.password.as_str(),
            "-c",
            query,
        ])
        .output()
        .await
        .map_err(|e| {
            MigrateError::DdlExport(format!("could not run {}: {}", vsql_path, e))
        })?;

    if !output.status.success() {
        return Err(MigrateError::DdlExport(format!(
            "could not use vsql to get DDLs ({}). Output was: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let ddl = String::from_utf8_lossy(&output.stdout).into_owned();
    if ddl.trim().is_empty() {
        return Err(MigrateError::DdlExport(
            "vsql returned no DDL".to_string(),
        ));
    }
    Ok(ddl)
}
