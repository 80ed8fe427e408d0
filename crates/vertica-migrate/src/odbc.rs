//! ODBC-backed [`SqlExecutor`] for Vertica.
//!
//! **Requirements:**
//! - The `odbc` feature must be enabled
//! - unixODBC and the Vertica ODBC driver must be installed, either
//!   registered as `Vertica` or referenced through a DSN
//!
//! ODBC handles are not thread-safe, so each executor owns one connection
//! on a dedicated worker thread and receives statements over a channel.
//! Statements on one executor therefore run strictly one after another.

use std::sync::OnceLock;
use std::thread;

use async_trait::async_trait;
use odbc_api::{buffers::TextRowSet, Connection, ConnectionOptions, Cursor, Environment, ResultSetMetadata};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::core::{Row, SqlExecutor, SqlValue};
use crate::error::{MigrateError, Result};

/// Rows fetched per ODBC round trip.
const FETCH_BATCH_SIZE: usize = 1000;

/// Upper bound for a single text column value.
const MAX_STR_LEN: usize = 65_000;

/// Rows buffered between the cursor and a streaming consumer.
const STREAM_CHANNEL_SIZE: usize = 4096;

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

fn environment() -> Result<&'static Environment> {
    if let Some(env) = ENVIRONMENT.get() {
        return Ok(env);
    }
    let env = Environment::new().map_err(|e| {
        MigrateError::Connection(format!(
            "Failed to create ODBC environment: {}. \
             Make sure unixODBC and the Vertica ODBC driver are installed.",
            e
        ))
    })?;
    Ok(ENVIRONMENT.get_or_init(|| env))
}

enum Command {
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<u64>>,
    },
    FetchAll {
        sql: String,
        reply: oneshot::Sender<Result<Vec<Row>>>,
    },
    Stream {
        sql: String,
        rows: mpsc::Sender<Result<Row>>,
        started: oneshot::Sender<Result<()>>,
    },
    Commit {
        reply: oneshot::Sender<Result<()>>,
    },
    Rollback {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A Vertica session over ODBC with autocommit disabled.
pub struct OdbcExecutor {
    commands: std::sync::mpsc::Sender<Command>,
    description: String,
}

impl OdbcExecutor {
    /// Connect to the endpoint and start the worker thread.
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self> {
        let env = environment()?;
        let connection_string = connection_string(endpoint);
        let description = endpoint.describe();

        debug!(
            "ODBC connection string (credentials hidden): {}",
            connection_string.replace(&endpoint.password, "*****")
        );

        let (commands, inbox) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::Builder::new()
            .name(format!("odbc-{}", endpoint.host))
            .spawn(move || {
                let conn = match env
                    .connect_with_connection_string(&connection_string, ConnectionOptions::default())
                    .and_then(|conn| conn.set_autocommit(false).map(|_| conn))
                {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        conn
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(MigrateError::Connection(format!(
                            "ODBC connection failed: {}",
                            e
                        ))));
                        return;
                    }
                };
                serve(&conn, inbox);
            })?;

        ready_rx
            .await
            .map_err(|_| MigrateError::Connection("ODBC worker exited during connect".into()))??;

        info!("Connected to Vertica via ODBC: {}", description);
        Ok(Self {
            commands,
            description,
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| {
            MigrateError::Connection(format!("ODBC worker for {} has stopped", self.description))
        })
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply))?;
        response.await.map_err(|_| {
            MigrateError::Connection(format!("ODBC worker for {} dropped a reply", self.description))
        })?
    }
}

fn connection_string(endpoint: &EndpointConfig) -> String {
    match &endpoint.dsn {
        Some(dsn) => format!(
            "DSN={};UID={};PWD={};",
            dsn, endpoint.user, endpoint.password
        ),
        None => format!(
            "Driver={{Vertica}};Servername={};Port={};Database={};UID={};PWD={};",
            endpoint.host, endpoint.port, endpoint.database, endpoint.user, endpoint.password
        ),
    }
}

fn serve(conn: &Connection<'_>, inbox: std::sync::mpsc::Receiver<Command>) {
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Execute { sql, reply } => {
                let _ = reply.send(execute(conn, &sql));
            }
            Command::FetchAll { sql, reply } => {
                let mut rows = Vec::new();
                let result = query(conn, &sql, |row| {
                    rows.push(row);
                    true
                });
                let _ = reply.send(result.map(|_| rows));
            }
            Command::Stream { sql, rows, started } => {
                let mut started = Some(started);
                let result = query(conn, &sql, |row| {
                    if let Some(started) = started.take() {
                        let _ = started.send(Ok(()));
                    }
                    rows.blocking_send(Ok(row)).is_ok()
                });
                match (result, started.take()) {
                    (Ok(()), Some(started)) => {
                        let _ = started.send(Ok(()));
                    }
                    (Err(e), Some(started)) => {
                        let _ = started.send(Err(e));
                    }
                    (Err(e), None) => {
                        let _ = rows.blocking_send(Err(e));
                    }
                    (Ok(()), None) => {}
                }
            }
            Command::Commit { reply } => {
                let _ = reply.send(conn.commit().map_err(|e| MigrateError::sql("COMMIT", e.to_string())));
            }
            Command::Rollback { reply } => {
                let _ = reply.send(
                    conn.rollback()
                        .map_err(|e| MigrateError::sql("ROLLBACK", e.to_string())),
                );
            }
        }
    }
    debug!("ODBC worker stopping");
}

fn execute(conn: &Connection<'_>, sql: &str) -> Result<u64> {
    let mut statement = conn
        .preallocate()
        .map_err(|e| MigrateError::sql(sql, e.to_string()))?;
    statement
        .execute(sql, ())
        .map_err(|e| MigrateError::sql(sql, e.to_string()))?;
    let rows = statement.row_count().ok().flatten().unwrap_or(0);
    Ok(rows as u64)
}

/// Run a query and hand each row to `sink` until it returns false.
fn query(conn: &Connection<'_>, sql: &str, mut sink: impl FnMut(Row) -> bool) -> Result<()> {
    let sql_err = |e: odbc_api::Error| MigrateError::sql(sql, e.to_string());

    let Some(mut cursor) = conn.execute(sql, ()).map_err(sql_err)? else {
        return Ok(());
    };
    let num_cols = cursor.num_result_cols().map_err(sql_err)? as usize;
    let mut buffers =
        TextRowSet::for_cursor(FETCH_BATCH_SIZE, &mut cursor, Some(MAX_STR_LEN)).map_err(sql_err)?;
    let mut row_cursor = cursor.bind_buffer(&mut buffers).map_err(sql_err)?;

    while let Some(batch) = row_cursor.fetch().map_err(sql_err)? {
        for row_idx in 0..batch.num_rows() {
            let row = (0..num_cols)
                .map(|col_idx| match batch.at(col_idx, row_idx) {
                    None => SqlValue::Null,
                    Some(bytes) => match std::str::from_utf8(bytes) {
                        Ok(text) => SqlValue::Text(text.to_string()),
                        Err(_) => SqlValue::Bytes(bytes.to_vec()),
                    },
                })
                .collect();
            if !sink(row) {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl SqlExecutor for OdbcExecutor {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let sql = sql.to_string();
        self.call(|reply| Command::Execute { sql, reply }).await
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        self.call(|reply| Command::FetchAll { sql, reply }).await
    }

    async fn stream(&self, sql: &str) -> Result<mpsc::Receiver<Result<Row>>> {
        let (rows, receiver) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let sql = sql.to_string();
        self.call(|started| Command::Stream { sql, rows, started }).await?;
        Ok(receiver)
    }

    async fn commit(&self) -> Result<()> {
        self.call(|reply| Command::Commit { reply }).await
    }

    async fn rollback(&self) -> Result<()> {
        self.call(|reply| Command::Rollback { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::endpoint;

    #[test]
    fn test_driver_connection_string() {
        assert_eq!(
            connection_string(&endpoint("vertica-a", "dwh")),
            "Driver={Vertica};Servername=vertica-a;Port=5433;Database=dwh;UID=dbadmin;PWD=pw;"
        );
    }

    #[test]
    fn test_dsn_connection_string() {
        let mut ep = endpoint("vertica-a", "dwh");
        ep.dsn = Some("VerticaDWH".into());
        assert_eq!(connection_string(&ep), "DSN=VerticaDWH;UID=dbadmin;PWD=pw;");
    }
}
