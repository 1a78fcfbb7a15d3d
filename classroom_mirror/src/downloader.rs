//! Concurrent execution of download tasks.
//!
//! Remote content is streamed into a hidden `.<name>.<random>.part` file next
//! to its destination and renamed into place once the byte count checks out,
//! so an interrupted run never leaves a truncated file under the final name.
//! Allocated names never start with a dot, so a temp file cannot collide with
//! a sibling destination.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ContentSource, Download};
use crate::classifier::{placeholder_body, RemoteContent, Strategy};
use crate::error::{MirrorError, Result};
use crate::ledger::CompletionLedger;
use crate::models::format_size;
use crate::retry::RetryPolicy;

/// Default number of concurrent transfers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Suffix for in-flight files.
pub const PART_SUFFIX: &str = "part";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// One file to materialize under the output root.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub strategy: Strategy,
    /// Path relative to the output root.
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    pub status: TaskStatus,
}

impl DownloadTask {
    pub fn new(strategy: Strategy, destination: PathBuf, expected_size: Option<u64>) -> Self {
        Self {
            strategy,
            destination,
            expected_size,
            status: TaskStatus::Pending,
        }
    }
}

/// Why a task or listing did not produce its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied(String),
    RetriesExhausted { attempts: u32, last_error: String },
    Filesystem(String),
    Remote(String),
}

impl FailureReason {
    pub fn from_error(error: &MirrorError, attempts: u32) -> Self {
        match error {
            MirrorError::Permission(message) => FailureReason::PermissionDenied(message.clone()),
            MirrorError::Io(e) => FailureReason::Filesystem(e.to_string()),
            e if e.is_transient() => FailureReason::RetriesExhausted {
                attempts,
                last_error: e.to_string(),
            },
            e => FailureReason::Remote(e.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PermissionDenied(message) => write!(f, "permission denied: {}", message),
            FailureReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {} attempts: {}", attempts, last_error),
            FailureReason::Filesystem(message) => write!(f, "filesystem error: {}", message),
            FailureReason::Remote(message) => write!(f, "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub path: PathBuf,
    pub reason: FailureReason,
}

/// Tallies for one downloader run.
#[derive(Debug, Default, Clone)]
pub struct DownloadReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub not_started: usize,
    pub failed: Vec<FailedItem>,
    pub bytes: u64,
    /// Total remote attempts across all tasks.
    pub attempts: u32,
}

impl DownloadReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.not_started + self.failed.len()
    }
}

enum Outcome {
    Completed { bytes: u64, attempts: u32 },
    Skipped,
    Failed { reason: FailureReason, attempts: u32 },
    NotStarted,
    Fatal(MirrorError),
}

/// Runs download tasks with bounded concurrency.
pub struct Downloader {
    root: PathBuf,
    content: Arc<dyn ContentSource>,
    retry: RetryPolicy,
    concurrency: usize,
    ledger: CompletionLedger,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(
        root: impl Into<PathBuf>,
        content: Arc<dyn ContentSource>,
        retry: RetryPolicy,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        let root = root.into();
        let ledger = CompletionLedger::open(&root);
        Self {
            root,
            content,
            retry,
            concurrency: concurrency.max(1),
            ledger,
            cancel,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Execute every task from `tasks`, at most `concurrency` at a time.
    ///
    /// Per-task failures are collected in the report. An authorization
    /// failure cancels the remaining work and is returned as the error.
    pub async fn run<S>(&self, tasks: S) -> Result<DownloadReport>
    where
        S: Stream<Item = DownloadTask> + Send,
    {
        let mut report = DownloadReport::default();
        let mut fatal = None;

        let outcomes = tasks
            .map(|task| self.execute(task))
            .buffer_unordered(self.concurrency);
        futures::pin_mut!(outcomes);

        while let Some((task, outcome)) = outcomes.next().await {
            match outcome {
                Outcome::Completed { bytes, attempts } => {
                    report.succeeded += 1;
                    report.bytes += bytes;
                    report.attempts += attempts;
                }
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed { reason, attempts } => {
                    warn!(path = %task.destination.display(), %reason, "download failed");
                    report.attempts += attempts;
                    report.failed.push(FailedItem {
                        path: task.destination,
                        reason,
                    });
                }
                Outcome::NotStarted => report.not_started += 1,
                Outcome::Fatal(e) => {
                    report.not_started += 1;
                    if fatal.is_none() {
                        error!(error = %e, "authorization failed, stopping downloads");
                        self.cancel.cancel();
                        fatal = Some(e);
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed.len(),
            not_started = report.not_started,
            bytes = %format_size(report.bytes),
            "downloads finished"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn execute(&self, mut task: DownloadTask) -> (DownloadTask, Outcome) {
        if self.cancel.is_cancelled() {
            return (task, Outcome::NotStarted);
        }

        let source = task.strategy.source_key();
        if self.ledger.is_complete(&task.destination, &source).await {
            debug!(path = %task.destination.display(), "already complete");
            task.status = TaskStatus::Complete;
            return (task, Outcome::Skipped);
        }

        task.status = TaskStatus::InProgress;
        let outcome = match &task.strategy {
            Strategy::Placeholder { url, title } => {
                match self.write_placeholder(&task.destination, url, title).await {
                    Ok(bytes) => Outcome::Completed { bytes, attempts: 0 },
                    Err(e) => Outcome::Failed {
                        reason: FailureReason::from_error(&e, 0),
                        attempts: 0,
                    },
                }
            }
            Strategy::Remote(content) => {
                let attempted = self
                    .retry
                    .run(&self.cancel, |attempt| {
                        if attempt > 1 {
                            debug!(path = %task.destination.display(), attempt, "retrying");
                        }
                        self.transfer(&task, content)
                    })
                    .await;
                match attempted.result {
                    Ok(bytes) => Outcome::Completed {
                        bytes,
                        attempts: attempted.attempts,
                    },
                    Err(MirrorError::Cancelled) => Outcome::NotStarted,
                    Err(e) if e.is_fatal() => Outcome::Fatal(e),
                    Err(e) => Outcome::Failed {
                        reason: FailureReason::from_error(&e, attempted.attempts),
                        attempts: attempted.attempts,
                    },
                }
            }
        };

        match &outcome {
            Outcome::Completed { bytes, .. } => {
                task.status = TaskStatus::Complete;
                debug!(path = %task.destination.display(), bytes, "saved");
                if let Err(e) = self.ledger.record(&task.destination, &source, *bytes).await {
                    warn!(error = %e, "failed to update ledger");
                }
            }
            Outcome::Failed { .. } | Outcome::Fatal(_) => task.status = TaskStatus::Failed,
            Outcome::Skipped | Outcome::NotStarted => {}
        }
        (task, outcome)
    }

    async fn transfer(&self, task: &DownloadTask, content: &RemoteContent) -> Result<u64> {
        let destination = self.root.join(&task.destination);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let download = self.content.open(content).await?;
        let temp = part_path(&destination);
        match self.stream_to(&temp, download, task.expected_size).await {
            Ok(bytes) => {
                if let Err(e) = fs::rename(&temp, &destination).await {
                    let _ = fs::remove_file(&temp).await;
                    return Err(e.into());
                }
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, temp: &Path, download: Download, expected: Option<u64>) -> Result<u64> {
        let expected = expected.or(download.content_length);
        let mut stream = download.stream;
        let mut file = File::create(temp).await?;
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MirrorError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                None => break,
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        match expected {
            Some(expected) if expected != written => Err(MirrorError::Incomplete {
                expected,
                actual: written,
            }),
            _ => Ok(written),
        }
    }

    async fn write_placeholder(&self, relative: &Path, url: &str, title: &str) -> Result<u64> {
        let destination = self.root.join(relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = placeholder_body(url, title);
        let temp = part_path(&destination);
        fs::write(&temp, body.as_bytes()).await?;
        fs::rename(&temp, &destination).await?;
        Ok(body.len() as u64)
    }
}

/// `.<destination name>.<random>.part`, beside the destination.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    if let Some(file_name) = destination.file_name() {
        name.push(file_name);
    }
    name.push(format!(".{:08x}.{}", rand::random::<u32>(), PART_SUFFIX));
    destination.with_file_name(name)
}
