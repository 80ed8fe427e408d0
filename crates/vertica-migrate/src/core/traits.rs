//! The SQL executor seam.
//!
//! Loading and migration only ever talk to a database through
//! [`SqlExecutor`]. Connection bootstrapping, node selection and
//! retries on lost connections belong to whoever builds the executor.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

use super::value::{Row, SqlValue};

/// Execute SQL against one Vertica session.
///
/// An executor wraps a single connection and its transaction. Statements on
/// one executor are serialized: while a `COPY ... FROM LOCAL` is in flight no
/// other statement is issued on the same executor.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute a statement and return the number of affected rows.
    ///
    /// For `COPY` this is the number of loaded rows; for `EXPORT TO VERTICA`
    /// the number of exported rows.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute a query and collect all rows.
    async fn fetch_all(&self, sql: &str) -> Result<Vec<Row>>;

    /// Execute a query and return the first row, if any.
    async fn fetch_one(&self, sql: &str) -> Result<Option<Row>> {
        Ok(self.fetch_all(sql).await?.into_iter().next())
    }

    /// Execute a query and return the first column of the first row.
    ///
    /// A missing row and a NULL value both yield `None`.
    async fn fetch_value(&self, sql: &str) -> Result<Option<SqlValue>> {
        let row = self.fetch_one(sql).await?;
        Ok(row
            .and_then(|r| r.into_iter().next())
            .filter(|v| !v.is_null()))
    }

    /// Start streaming the rows of a query.
    ///
    /// Returns a channel receiver that yields rows one at a time. The
    /// implementation fills the channel from a background task, so a slow
    /// consumer applies backpressure to the cursor.
    async fn stream(&self, sql: &str) -> Result<mpsc::Receiver<Result<Row>>>;

    /// Commit the current transaction.
    async fn commit(&self) -> Result<()>;

    /// Roll back the current transaction.
    async fn rollback(&self) -> Result<()>;
}
