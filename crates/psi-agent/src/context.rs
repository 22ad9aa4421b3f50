//! Durable conversation context
//!
//! Append-only JSONL history with checkpoint markers, token accounting,
//! restore-on-startup, and rotation-based revert. Single-writer: callers
//! serialize through the loop driver. The store accepts any path and does
//! not create parent directories.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use psi_ai::Message;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metadata records interleaved with messages in the history file,
/// discriminated by reserved `role` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum MetaRecord {
    /// Model-reported token count at this point in the conversation
    #[serde(rename = "_usage")]
    Usage { token_count: u64 },
    /// A boundary the driver may revert to; ids are dense from 0
    #[serde(rename = "_checkpoint")]
    Checkpoint { id: u32 },
}

/// One persisted line of the history file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryRecord {
    Meta(MetaRecord),
    Message(Message),
}

/// The durable context for one session.
pub struct Context {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    records: Vec<HistoryRecord>,
    messages: Vec<Message>,
    token_count: u64,
    n_checkpoints: u32,
}

impl Context {
    /// Create a context over `path`. No I/O happens until the first write
    /// or [`Self::restore`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            records: Vec::new(),
            messages: Vec::new(),
            token_count: 0,
            n_checkpoints: 0,
        }
    }

    /// Path of the current history file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only view of the message history
    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    /// Number of checkpoints in the current generation
    pub fn checkpoint_count(&self) -> u32 {
        self.n_checkpoints
    }

    /// Last model-reported token count
    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    /// Append a message and persist it as one line.
    pub fn append(&mut self, message: Message) -> Result<()> {
        let record = HistoryRecord::Message(message.clone());
        self.write_record(&record)?;
        self.records.push(record);
        self.messages.push(message);
        Ok(())
    }

    /// Set the token count and persist a `_usage` record.
    pub fn update_token_count(&mut self, token_count: u64) -> Result<()> {
        let record = HistoryRecord::Meta(MetaRecord::Usage { token_count });
        self.write_record(&record)?;
        self.records.push(record);
        self.token_count = token_count;
        Ok(())
    }

    /// Create a checkpoint and return its id.
    ///
    /// With `ensure_progress`, a checkpoint directly on top of another one
    /// is elided and the existing id is returned instead.
    pub fn checkpoint(&mut self, ensure_progress: bool) -> Result<u32> {
        if ensure_progress {
            if let Some(HistoryRecord::Meta(MetaRecord::Checkpoint { id })) = self.records.last() {
                return Ok(*id);
            }
        }
        let id = self.n_checkpoints;
        let record = HistoryRecord::Meta(MetaRecord::Checkpoint { id });
        self.write_record(&record)?;
        self.records.push(record);
        self.n_checkpoints += 1;
        Ok(id)
    }

    /// Count of messages preceding the most recent checkpoint, if any
    pub fn last_checkpoint_boundary(&self) -> Option<usize> {
        let pos = self.last_checkpoint_position()?;
        Some(
            self.records[..pos]
                .iter()
                .filter(|r| matches!(r, HistoryRecord::Message(_)))
                .count(),
        )
    }

    /// Revert to checkpoint `k`, rotating the current file first so no
    /// data is destroyed.
    ///
    /// `k == checkpoint_count()` still rotates but leaves the state
    /// unchanged; any smaller `k` truncates to the records preceding the
    /// `_checkpoint{k}` boundary and resets the token count.
    pub fn revert_to(&mut self, k: u32) -> Result<()> {
        if k > self.n_checkpoints {
            return Err(Error::InvalidCheckpoint {
                requested: k,
                available: self.n_checkpoints,
            });
        }

        let retained: Vec<HistoryRecord> = if k == self.n_checkpoints {
            self.records.clone()
        } else {
            let boundary = self
                .records
                .iter()
                .position(
                    |r| matches!(r, HistoryRecord::Meta(MetaRecord::Checkpoint { id }) if *id == k),
                )
                .ok_or(Error::InvalidCheckpoint {
                    requested: k,
                    available: self.n_checkpoints,
                })?;
            self.records[..boundary].to_vec()
        };
        let truncated = k < self.n_checkpoints;

        self.rotate_and_rewrite(retained)?;
        if truncated {
            self.token_count = 0;
        }
        Ok(())
    }

    /// Replace everything preceding the most recent checkpoint with a
    /// single summary message.
    ///
    /// The rewritten file is `{summary, _checkpoint{0}, tail}` where the
    /// tail is every record after the old checkpoint; the surviving
    /// checkpoint id 0 marks the summary boundary.
    pub fn replace_prefix(&mut self, summary: Message) -> Result<()> {
        let boundary = self
            .last_checkpoint_position()
            .ok_or_else(|| Error::Compaction("no checkpoint to compact against".to_string()))?;

        let mut records = Vec::with_capacity(self.records.len() - boundary + 2);
        records.push(HistoryRecord::Message(summary));
        records.push(HistoryRecord::Meta(MetaRecord::Checkpoint { id: 0 }));
        records.extend(self.records[boundary + 1..].iter().cloned());

        self.rotate_and_rewrite(records)
    }

    /// Replay the history file into memory.
    ///
    /// Returns `false` for a missing, empty, or all-blank file. Lines that
    /// fail to parse are skipped with a diagnostic.
    pub fn restore(&mut self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(&self.path)?;

        let mut records = Vec::new();
        let mut has_content = false;
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            has_content = true;
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("skipping unreadable history line {}: {e}", lineno + 1);
                }
            }
        }

        if !has_content {
            return Ok(false);
        }
        self.reload_from(records);
        Ok(true)
    }

    fn last_checkpoint_position(&self) -> Option<usize> {
        self.records
            .iter()
            .rposition(|r| matches!(r, HistoryRecord::Meta(MetaRecord::Checkpoint { .. })))
    }

    fn write_record(&mut self, record: &HistoryRecord) -> Result<()> {
        let line = serde_json::to_string(record).map_err(json_io)?;
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{line}")?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Rename the current file to the smallest unused `.R` sibling, write
    /// `records` as the new current file, and reload in-memory state.
    fn rotate_and_rewrite(&mut self, records: Vec<HistoryRecord>) -> Result<()> {
        self.writer = None;
        if self.path.exists() {
            std::fs::rename(&self.path, rotation_target(&self.path))?;
        }

        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        for record in &records {
            let line = serde_json::to_string(record).map_err(json_io)?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        self.writer = Some(writer);

        self.reload_from(records);
        Ok(())
    }

    fn reload_from(&mut self, records: Vec<HistoryRecord>) {
        self.messages.clear();
        self.token_count = 0;
        self.n_checkpoints = 0;
        for record in &records {
            match record {
                HistoryRecord::Message(m) => self.messages.push(m.clone()),
                HistoryRecord::Meta(MetaRecord::Usage { token_count }) => {
                    self.token_count = *token_count;
                }
                HistoryRecord::Meta(MetaRecord::Checkpoint { id }) => {
                    self.n_checkpoints = id + 1;
                }
            }
        }
        self.records = records;
    }
}

fn json_io(e: serde_json::Error) -> Error {
    Error::Persistence(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Smallest positive `R` such that `<path>.R` does not exist
fn rotation_target(path: &Path) -> PathBuf {
    let mut r = 1u32;
    loop {
        let mut os = path.as_os_str().to_os_string();
        os.push(format!(".{r}"));
        let candidate = PathBuf::from(os);
        if !candidate.exists() {
            return candidate;
        }
        r += 1;
    }
}
