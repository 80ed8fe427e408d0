//! # vertica-migrate
//!
//! Bulk loading into Vertica and Vertica-to-Vertica migration.
//!
//! This library provides:
//!
//! - **Streaming bulk loads**: [`BatchLoader`] feeds rows through a named
//!   pipe into a `COPY ... FROM LOCAL` running in the background
//! - **Schema migration**: [`DdlMigrator`] replays exported DDL on the
//!   target, retrying dependency failures until nothing changes, and turns
//!   identity columns into explicit sequences
//! - **Data migration**: [`DataMigrator`] pushes tables server-to-server
//!   when the source can reach the target, and streams them through the
//!   client otherwise
//!
//! Every component talks to the database through [`SqlExecutor`]. With the
//! `odbc` feature, `odbc::OdbcExecutor` implements it over `odbc-api`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vertica_migrate::{Config, Migrator, SqlExecutor};
//!
//! async fn migrate(
//!     source: Arc<dyn SqlExecutor>,
//!     target: Arc<dyn SqlExecutor>,
//! ) -> vertica_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let result = Migrator::new(config, source, target)?.run().await?;
//!     println!("{}", result.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod ddl;
pub mod error;
pub mod loader;
#[cfg(feature = "odbc")]
pub mod odbc;
pub mod orchestrator;
pub mod transfer;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use config::{Config, CopyOptions, EndpointConfig, EscapeStyle, LoaderOptions, MigrationConfig};
pub use crate::core::{Row, SqlExecutor, SqlValue};
pub use ddl::{DdlMigrator, DdlReport};
pub use error::{MigrateError, Result};
pub use loader::BatchLoader;
pub use orchestrator::{MigrationResult, Migrator};
pub use transfer::{DataMigrator, DataReport, TableRef, TransferMode};
