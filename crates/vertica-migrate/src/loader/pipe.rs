//! Named pipe plumbing between the writer and the background COPY.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tempfile::TempDir;
use tokio::fs::{File, OpenOptions};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::core::SqlExecutor;
use crate::error::{MigrateError, Result};

/// A FIFO inside its own temporary directory.
///
/// Dropping the value removes both the pipe and the directory.
#[derive(Debug)]
pub struct NamedPipe {
    _dir: TempDir,
    path: PathBuf,
}

impl NamedPipe {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("vertica-load-").tempdir()?;
        let path = dir.path().join("fifo");
        mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).map_err(std::io::Error::from)?;
        debug!("Created FIFO {}", path.display());
        Ok(Self { _dir: dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// How the background COPY ended.
#[derive(Debug)]
pub enum Completion {
    /// The statement finished; the executor reported this many rows.
    Loaded(u64),
    /// The statement failed or the task died.
    Failed(MigrateError),
    /// The task did not finish within the shutdown wait and was detached.
    TimedOut,
}

/// The in-flight COPY statement of one batch session.
pub struct PendingExecution {
    handle: JoinHandle<Result<u64>>,
}

impl PendingExecution {
    /// Spawn the COPY on the executor.
    ///
    /// On failure the task drains the pipe before returning the error, so a
    /// writer blocked on a full pipe is released.
    pub fn spawn(executor: Arc<dyn SqlExecutor>, sql: String, pipe_path: PathBuf) -> Self {
        let handle = tokio::spawn(async move {
            debug!("COPY started: {}", sql);
            match executor.execute(&sql).await {
                Ok(rows) => {
                    debug!("COPY finished, {} rows loaded", rows);
                    Ok(rows)
                }
                Err(e) => {
                    error!("COPY failed: {}", e);
                    if let Err(drain_err) = drain(&pipe_path).await {
                        warn!("Draining {} failed: {}", pipe_path.display(), drain_err);
                    }
                    Err(e)
                }
            }
        });
        Self { handle }
    }

    /// Open the write end of the pipe.
    ///
    /// Opening blocks until the COPY opens the read end. If the COPY ends
    /// before that happens, the pending open is released and the COPY's
    /// outcome is returned as an error.
    pub async fn open_writer(mut self, path: &Path) -> Result<(Self, File)> {
        let mut options = OpenOptions::new();
        options.write(true);
        let open = options.open(path.to_path_buf());
        tokio::pin!(open);

        tokio::select! {
            file = &mut open => Ok((self, file?)),
            joined = &mut self.handle => {
                // a non-blocking reader lets the pending open complete
                let release = pipe::OpenOptions::new().open_receiver(path)?;
                let _ = open.await;
                drop(release);
                Err(match joined {
                    Ok(Err(e)) => e,
                    Ok(Ok(_)) => MigrateError::Ingest(
                        "COPY finished before reading the pipe".to_string(),
                    ),
                    Err(e) => MigrateError::Ingest(format!("COPY task failed: {}", e)),
                })
            }
        }
    }

    /// Wait at most `wait` for the COPY to finish.
    ///
    /// A task still running after the wait is detached, never aborted.
    pub async fn finish(self, wait: Duration) -> Completion {
        match tokio::time::timeout(wait, self.handle).await {
            Ok(Ok(Ok(rows))) => Completion::Loaded(rows),
            Ok(Ok(Err(e))) => Completion::Failed(e),
            Ok(Err(e)) => Completion::Failed(MigrateError::Ingest(format!(
                "COPY task failed: {}",
                e
            ))),
            Err(_) => Completion::TimedOut,
        }
    }
}

/// Read the pipe to EOF, discarding the data.
///
/// The read end is opened non-blocking, so a pipe whose writer is already
/// gone yields EOF immediately instead of waiting for a new writer.
async fn drain(path: &Path) -> std::io::Result<u64> {
    let mut receiver = pipe::OpenOptions::new().open_receiver(path)?;
    let drained = tokio::io::copy(&mut receiver, &mut tokio::io::sink()).await?;
    debug!("Drained {} bytes from {}", drained, path.display());
    Ok(drained)
}
