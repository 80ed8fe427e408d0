//! Migration orchestrator - coordinates the schema and data phases.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::SqlExecutor;
use crate::ddl::{DdlMigrator, DdlReport};
use crate::error::{MigrateError, Result};
use crate::transfer::{DataMigrator, DataReport};

const NODE_ADDRESS_QUERY: &str = "SELECT n.node_address FROM v_monitor.current_session cs \
     JOIN v_catalog.nodes n ON n.node_name = cs.node_name";

const USER_TABLE_COUNT_QUERY: &str = "SELECT COUNT(*) FROM v_catalog.tables \
     WHERE is_system_table = false AND is_temp_table = false";

/// Migrates a Vertica database into another one.
pub struct Migrator {
    config: Config,
    source: Arc<dyn SqlExecutor>,
    target: Arc<dyn SqlExecutor>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: `completed`, `completed_with_failures` or `dry_run`.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Schema phase outcome, unless skipped.
    pub ddl: Option<DdlReport>,

    /// Data phase outcome, unless skipped.
    pub data: Option<DataReport>,
}

impl Migrator {
    /// Create a migrator over two open connections.
    pub fn new(
        config: Config,
        source: Arc<dyn SqlExecutor>,
        target: Arc<dyn SqlExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            target,
        })
    }

    async fn node_address(executor: &dyn SqlExecutor) -> Result<Option<String>> {
        Ok(executor
            .fetch_value(NODE_ADDRESS_QUERY)
            .await?
            .and_then(|v| v.as_string()))
    }

    async fn current_database(executor: &dyn SqlExecutor) -> Result<Option<String>> {
        Ok(executor
            .fetch_value("SELECT CURRENT_DATABASE()")
            .await?
            .and_then(|v| v.as_string()))
    }

    /// Refuse to copy a database onto itself or over a populated target.
    pub async fn sanity_checks(&self) -> Result<()> {
        let source_node = Self::node_address(self.source.as_ref()).await?;
        let target_node = Self::node_address(self.target.as_ref()).await?;

        if source_node.is_some() && source_node == target_node {
            let source_db = Self::current_database(self.source.as_ref()).await?;
            let target_db = Self::current_database(self.target.as_ref()).await?;
            if source_db == target_db {
                return Err(MigrateError::Config(
                    "Source and target database are the same. Will stop here.".into(),
                ));
            }
            info!("Copying inside the same server to another database");
        }

        let user_tables = self
            .target
            .fetch_value(USER_TABLE_COUNT_QUERY)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if user_tables > 0 {
            if !self.config.migration.even_not_empty {
                return Err(MigrateError::Migration(format!(
                    "Target database is not empty ({} user tables)",
                    user_tables
                )));
            }
            warn!("Target database not empty ({} user tables), copying anyway", user_tables);
        }
        Ok(())
    }

    /// Run the sanity checks, then the schema phase, then the data phase.
    pub async fn run(&self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let migration = &self.config.migration;

        info!(
            "Starting migration run {}: {} -> {}{}",
            run_id,
            self.config.source.describe(),
            self.config.target.describe(),
            if migration.commit { "" } else { " (dry run)" }
        );

        self.sanity_checks().await?;

        let ddl = if migration.skip_ddl {
            info!("Skipping DDL migration");
            None
        } else {
            info!("Phase 1: Migrating DDLs");
            let migrator = DdlMigrator::new(
                self.source.clone(),
                self.target.clone(),
                self.config.source.clone(),
                migration.clone(),
            )?;
            Some(migrator.migrate().await?)
        };

        let data = if migration.skip_data {
            info!("Skipping data migration");
            None
        } else {
            info!("Phase 2: Migrating data");
            let migrator = DataMigrator::new(
                self.source.clone(),
                self.target.clone(),
                self.config.target.clone(),
                migration.clone(),
                self.config.loader.clone(),
            );
            Some(migrator.migrate().await?)
        };

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let status = if !migration.commit {
            "dry_run"
        } else if data.as_ref().map_or(false, |d| !d.failures.is_empty()) {
            "completed_with_failures"
        } else {
            "completed"
        };

        let result = MigrationResult {
            run_id,
            status: status.to_string(),
            duration_seconds: duration,
            started_at,
            completed_at,
            ddl,
            data,
        };

        info!(
            "Migration {}: {} DDL statements, {} rows in {:.1}s",
            result.status,
            result.ddl.as_ref().map_or(0, |d| d.applied + d.already_existing),
            result.data.as_ref().map_or(0, |d| d.rows),
            result.duration_seconds
        );
        Ok(result)
    }
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoaderOptions, MigrationConfig};
    use crate::testing::{endpoint, MockExecutor};

    fn config(migration: MigrationConfig) -> Config {
        Config {
            source: endpoint("vertica-a", "dwh"),
            target: endpoint("vertica-b", "stgdwh"),
            migration,
            loader: LoaderOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_same_database_refused() {
        let source = Arc::new(
            MockExecutor::new()
                .value("node_address", "10.0.0.1")
                .value("CURRENT_DATABASE", "dwh"),
        );
        let target = Arc::new(
            MockExecutor::new()
                .value("node_address", "10.0.0.1")
                .value("CURRENT_DATABASE", "dwh"),
        );
        let migrator = Migrator::new(config(MigrationConfig::default()), source, target).unwrap();

        let err = migrator.sanity_checks().await.unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test]
    async fn test_same_node_other_database_allowed() {
        let source = Arc::new(
            MockExecutor::new()
                .value("node_address", "10.0.0.1")
                .value("CURRENT_DATABASE", "dwh"),
        );
        let target = Arc::new(
            MockExecutor::new()
                .value("node_address", "10.0.0.1")
                .value("CURRENT_DATABASE", "stgdwh")
                .value("COUNT(*)", 0),
        );
        let migrator = Migrator::new(config(MigrationConfig::default()), source, target).unwrap();
        migrator.sanity_checks().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_empty_target() {
        let target = || Arc::new(MockExecutor::new().value("COUNT(*)", 12));

        let strict = Migrator::new(
            config(MigrationConfig::default()),
            Arc::new(MockExecutor::new()),
            target(),
        )
        .unwrap();
        assert!(matches!(
            strict.sanity_checks().await,
            Err(MigrateError::Migration(_))
        ));

        let lenient = Migrator::new(
            config(MigrationConfig {
                even_not_empty: true,
                ..MigrationConfig::default()
            }),
            Arc::new(MockExecutor::new()),
            target(),
        )
        .unwrap();
        lenient.sanity_checks().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_both_phases() {
        let source = Arc::new(
            MockExecutor::new()
                .value("EXPORT_OBJECTS", "CREATE SCHEMA stg;\nCREATE TABLE stg.a (id int);")
                .affected("EXPORT TO VERTICA", 7),
        );
        let target = Arc::new(
            MockExecutor::new()
                .value("COUNT(*)", 0)
                .rows("FROM v_catalog.tables", vec![vec!["stg".into(), "a".into()]]),
        );
        let migrator = Migrator::new(
            config(MigrationConfig {
                commit: true,
                ..MigrationConfig::default()
            }),
            source.clone(),
            target.clone(),
        )
        .unwrap();

        let result = migrator.run().await.unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.ddl.as_ref().map(|d| d.applied), Some(2));
        assert_eq!(result.data.as_ref().map(|d| d.rows), Some(7));
        assert_eq!(target.count("CREATE TABLE stg.a"), 1);
        assert_eq!(source.count("EXPORT TO VERTICA stgdwh.stg.a"), 1);

        let json = result.to_json().unwrap();
        assert!(json.contains("\"mode\": \"direct\""));
    }

    #[tokio::test]
    async fn test_skipped_phases() {
        let migrator = Migrator::new(
            config(MigrationConfig {
                skip_ddl: true,
                skip_data: true,
                ..MigrationConfig::default()
            }),
            Arc::new(MockExecutor::new()),
            Arc::new(MockExecutor::new()),
        )
        .unwrap();

        let result = migrator.run().await.unwrap();
        assert_eq!(result.status, "dry_run");
        assert!(result.ddl.is_none());
        assert!(result.data.is_none());
    }
}
