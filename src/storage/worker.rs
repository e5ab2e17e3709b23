//! The per-file log worker.
//!
//! Every log file is owned by exactly one worker task; callers talk to it
//! over a bounded request channel and the worker executes operations
//! strictly in arrival order (FIFO per file; that ordering contract is
//! part of the public storage spec, the worker's internal concurrency is
//! not). Blocking file I/O runs on the blocking pool; the worker awaits
//! each operation before starting the next, which is what serializes them.
//! A full request queue exerts backpressure: senders wait on channel
//! capacity.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::errors::StorageError;
use crate::storage::log::RecordLog;

enum LogCommand {
    Append {
        lines: Vec<serde_json::Value>,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    TruncateTo {
        offset: u64,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Cloneable handle to a spawned log worker.
#[derive(Clone)]
pub struct LogWorker {
    tx: mpsc::Sender<LogCommand>,
}

impl LogWorker {
    /// Spawn the worker task owning `log`. `queue_depth` bounds the inbound
    /// append queue.
    pub fn spawn(log: RecordLog, queue_depth: usize) -> LogWorker {
        let (tx, mut rx) = mpsc::channel(queue_depth.max(1));
        let log = Arc::new(Mutex::new(log));
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    LogCommand::Append { lines, reply } => {
                        let log = log.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            log.lock().expect("log worker poisoned").append(&lines)
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(StorageError::io(
                                "<log worker>",
                                std::io::Error::other(e),
                            ))
                        });
                        let _ = reply.send(result);
                    }
                    LogCommand::Flush { reply } => {
                        let log = log.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            log.lock().expect("log worker poisoned").flush()
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(StorageError::io(
                                "<log worker>",
                                std::io::Error::other(e),
                            ))
                        });
                        let _ = reply.send(result);
                    }
                    LogCommand::TruncateTo { offset, reply } => {
                        let log = log.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            log.lock()
                                .expect("log worker poisoned")
                                .truncate_to(offset)
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(StorageError::io(
                                "<log worker>",
                                std::io::Error::other(e),
                            ))
                        });
                        let _ = reply.send(result);
                    }
                    LogCommand::Close { reply } => {
                        let log = log.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            log.lock().expect("log worker poisoned").close()
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(StorageError::io(
                                "<log worker>",
                                std::io::Error::other(e),
                            ))
                        });
                        let _ = reply.send(result);
                        break;
                    }
                }
            }
        });
        LogWorker { tx }
    }

    /// Append pre-serialized record lines. Resolves once the batch is
    /// durable.
    pub async fn append(&self, lines: Vec<serde_json::Value>) -> Result<(), StorageError> {
        self.request(|reply| LogCommand::Append { lines, reply })
            .await
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.request(|reply| LogCommand::Flush { reply }).await
    }

    /// Explicit-intent repair after a reported corruption offset.
    pub async fn truncate_to(&self, offset: u64) -> Result<(), StorageError> {
        self.request(|reply| LogCommand::TruncateTo { offset, reply })
            .await
    }

    /// Flush, release the file handle, and stop the worker.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.request(|reply| LogCommand::Close { reply }).await
    }

    async fn request<F>(&self, build: F) -> Result<(), StorageError>
    where
        F: FnOnce(oneshot::Sender<Result<(), StorageError>>) -> LogCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StorageError::io("<log worker>", std::io::Error::other("worker gone")))?;
        reply_rx
            .await
            .map_err(|_| StorageError::io("<log worker>", std::io::Error::other("worker gone")))?
    }
}
