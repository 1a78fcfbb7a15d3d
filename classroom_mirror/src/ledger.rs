//! Record of completed downloads, used to skip work on a re-run.
//!
//! The ledger lives in the output root as JSON Lines: one line is appended per
//! completed file and later lines win. A file counts as complete only if its
//! entry names the same source and the file on disk still has the recorded
//! size. Opening the ledger drops superseded and torn lines.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// Ledger file name inside the output root.
pub const LEDGER_FILE_NAME: &str = ".classroom-mirror.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub source: String,
    pub bytes: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerLine {
    path: String,
    #[serde(flatten)]
    entry: LedgerEntry,
}

pub struct CompletionLedger {
    root: PathBuf,
    path: PathBuf,
    entries: Mutex<BTreeMap<String, LedgerEntry>>,
    log: Mutex<Option<File>>,
}

impl CompletionLedger {
    /// Open the ledger under `root`, starting empty if it is missing.
    pub fn open(root: &Path) -> Self {
        let path = root.join(LEDGER_FILE_NAME);
        let (entries, lines) = load(&path);
        if lines > entries.len() {
            compact(&path, &entries);
        }
        debug!(path = %path.display(), entries = entries.len(), "ledger opened");

        Self {
            root: root.to_path_buf(),
            path,
            entries: Mutex::new(entries),
            log: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn entry(&self, relative: &Path) -> Option<LedgerEntry> {
        self.entries.lock().await.get(&key(relative)).cloned()
    }

    /// Whether `relative` was completed from `source` and is still intact.
    pub async fn is_complete(&self, relative: &Path, source: &str) -> bool {
        let expected = match self.entry(relative).await {
            Some(entry) if entry.source == source => entry.bytes,
            _ => return false,
        };
        match tokio::fs::metadata(self.root.join(relative)).await {
            Ok(meta) => meta.is_file() && meta.len() == expected,
            Err(_) => false,
        }
    }

    /// Record a completed file by appending one line to the ledger.
    pub async fn record(&self, relative: &Path, source: &str, bytes: u64) -> Result<()> {
        let line = LedgerLine {
            path: key(relative),
            entry: LedgerEntry {
                source: source.to_string(),
                bytes,
                completed_at: Utc::now(),
            },
        };
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');

        self.entries
            .lock()
            .await
            .insert(line.path, line.entry);

        let mut log = self.log.lock().await;
        if log.is_none() {
            tokio::fs::create_dir_all(&self.root).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *log = Some(file);
        }
        if let Some(file) = log.as_mut() {
            file.write_all(&encoded).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// Entries keyed by path, and the number of non-empty lines read.
fn load(path: &Path) -> (BTreeMap<String, LedgerEntry>, usize) {
    let mut entries = BTreeMap::new();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return (entries, 0),
    };

    let mut lines = 0;
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        match serde_json::from_str::<LedgerLine>(line) {
            Ok(line) => {
                entries.insert(line.path, line.entry);
            }
            Err(e) => warn!(path = %path.display(), line = number + 1, error = %e, "skipping unreadable ledger line"),
        }
    }
    (entries, lines)
}

/// Rewrite the ledger with one line per entry.
fn compact(path: &Path, entries: &BTreeMap<String, LedgerEntry>) {
    let mut content = Vec::new();
    for (path, entry) in entries {
        let line = LedgerLine {
            path: path.clone(),
            entry: entry.clone(),
        };
        match serde_json::to_vec(&line) {
            Ok(encoded) => {
                content.extend_from_slice(&encoded);
                content.push(b'\n');
            }
            Err(e) => {
                warn!(error = %e, "ledger compaction skipped");
                return;
            }
        }
    }

    let temp = path.with_file_name(format!("{}.tmp", LEDGER_FILE_NAME));
    let written = std::fs::write(&temp, &content).and_then(|_| std::fs::rename(&temp, path));
    match written {
        Ok(()) => debug!(path = %path.display(), entries = entries.len(), "ledger compacted"),
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            warn!(path = %path.display(), error = %e, "ledger compaction failed");
        }
    }
}

/// Ledger key for a relative path, independent of the platform separator.
fn key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
