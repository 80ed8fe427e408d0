//! Scripted executor for unit tests.
//!
//! Replies are matched by substring against the statement text. A `COPY ...
//! FROM LOCAL '<path>'` really opens the named pipe and reads it to EOF, so
//! loader tests run the writer and reader ends of the OS pipe.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::EndpointConfig;
use crate::core::{Row, SqlExecutor, SqlValue};
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Rows(Vec<Row>),
    Affected(u64),
    Fail(String),
    Lost(String),
}

struct Rule {
    pattern: String,
    reply: Reply,
    times: Option<usize>,
}

#[derive(Default)]
pub(crate) struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
    piped: Mutex<Vec<u8>>,
    rejected: Mutex<Vec<u8>>,
    copy_delay: Mutex<Option<Duration>>,
}

/// Endpoint fixture with throwaway credentials.
pub(crate) fn endpoint(host: &str, database: &str) -> EndpointConfig {
    EndpointConfig {
        dsn: None,
        host: host.into(),
        port: 5433,
        database: database.into(),
        user: "dbadmin".into(),
        password: "pw".into(),
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, pattern: &str, reply: Reply, times: Option<usize>) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push(Rule { pattern: pattern.to_string(), reply, times });
        self
    }

    /// Answer matching queries with `rows`.
    pub fn rows(self, pattern: &str, rows: Vec<Row>) -> Self {
        self.rule(pattern, Reply::Rows(rows), None)
    }

    /// Answer matching queries with a single value.
    pub fn value(self, pattern: &str, value: impl Into<SqlValue>) -> Self {
        self.rows(pattern, vec![vec![value.into()]])
    }

    /// Report `count` affected rows for matching statements. A matching
    /// COPY still drains its pipe.
    pub fn affected(self, pattern: &str, count: u64) -> Self {
        self.rule(pattern, Reply::Affected(count), None)
    }

    /// Fail every matching statement.
    pub fn fail(self, pattern: &str, message: &str) -> Self {
        self.rule(pattern, Reply::Fail(message.to_string()), None)
    }

    /// Fail the first `times` matching statements.
    pub fn fail_times(self, pattern: &str, message: &str, times: usize) -> Self {
        self.rule(pattern, Reply::Fail(message.to_string()), Some(times))
    }

    /// Fail matching statements as if the connection dropped.
    pub fn lose(self, pattern: &str, message: &str) -> Self {
        self.rule(pattern, Reply::Lost(message.to_string()), None)
    }

    /// Bytes a COPY writes into its REJECTED DATA file.
    pub fn reject(self, data: &[u8]) -> Self {
        *self.rejected.lock().unwrap() = data.to_vec();
        self
    }

    /// Keep a COPY running for `delay` after the pipe reaches EOF.
    pub fn slow_copy(self, delay: Duration) -> Self {
        *self.copy_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.executed().iter().filter(|s| s.contains(pattern)).count()
    }

    pub fn count_exact(&self, sql: &str) -> usize {
        self.executed().iter().filter(|s| s.as_str() == sql).count()
    }

    pub fn piped(&self) -> Vec<u8> {
        self.piped.lock().unwrap().clone()
    }

    fn reply_for(&self, sql: &str) -> Option<Reply> {
        self.log.lock().unwrap().push(sql.to_string());
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| sql.contains(&r.pattern) && r.times != Some(0))?;
        if let Some(times) = rule.times.as_mut() {
            *times -= 1;
        }
        Some(rule.reply.clone())
    }

    async fn run_copy(&self, sql: &str) -> Result<u64> {
        let pipe = quoted_after(sql, "FROM LOCAL '")
            .ok_or_else(|| MigrateError::sql(sql, "no FROM LOCAL path"))?;
        let data = tokio::fs::read(&pipe).await?;
        let delay = *self.copy_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rejected = self.rejected.lock().unwrap().clone();
        if let Some(path) = quoted_after(sql, "REJECTED DATA '") {
            tokio::fs::write(path, &rejected).await?;
        }

        let records = data.iter().filter(|b| **b == 0x01).count() as u64;
        self.piped.lock().unwrap().extend_from_slice(&data);
        Ok(records)
    }
}

pub(crate) fn quoted_after(sql: &str, marker: &str) -> Option<String> {
    let start = sql.find(marker)? + marker.len();
    let end = sql[start..].find('\'')?;
    Some(sql[start..start + end].to_string())
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn execute(&self, sql: &str) -> Result<u64> {
        match self.reply_for(sql) {
            Some(Reply::Fail(message)) => Err(MigrateError::sql(sql, message)),
            Some(Reply::Lost(message)) => Err(MigrateError::Connection(message)),
            Some(Reply::Affected(count)) if sql.starts_with("COPY ") => {
                self.run_copy(sql).await.map(|_| count)
            }
            _ if sql.starts_with("COPY ") => self.run_copy(sql).await,
            Some(Reply::Affected(count)) => Ok(count),
            Some(Reply::Rows(rows)) => Ok(rows.len() as u64),
            None => Ok(0),
        }
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Row>> {
        match self.reply_for(sql) {
            Some(Reply::Fail(message)) => Err(MigrateError::sql(sql, message)),
            Some(Reply::Lost(message)) => Err(MigrateError::Connection(message)),
            Some(Reply::Rows(rows)) => Ok(rows),
            _ => Ok(Vec::new()),
        }
    }

    async fn stream(&self, sql: &str) -> Result<mpsc::Receiver<Result<Row>>> {
        let rows = self.fetch_all(sql).await?;
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            tx.try_send(Ok(row))
                .map_err(|e| MigrateError::Connection(e.to_string()))?;
        }
        Ok(rx)
    }

    async fn commit(&self) -> Result<()> {
        match self.reply_for("COMMIT") {
            Some(Reply::Fail(message)) => Err(MigrateError::sql("COMMIT", message)),
            _ => Ok(()),
        }
    }

    async fn rollback(&self) -> Result<()> {
        match self.reply_for("ROLLBACK") {
            Some(Reply::Fail(message)) => Err(MigrateError::sql("ROLLBACK", message)),
            _ => Ok(()),
        }
    }
}
