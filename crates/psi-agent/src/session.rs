//! Session descriptor supplied by the host

use std::path::PathBuf;

/// Identity and filesystem anchors of one conversation session.
///
/// The host owns session lifecycle; the core only consumes the history
/// file path when constructing a [`crate::Context`].
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub work_dir: PathBuf,
    pub history_file_path: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    /// Create a fresh session rooted at `work_dir`, with the default
    /// `history.jsonl` inside it.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let history_file_path = work_dir.join("history.jsonl");
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            work_dir,
            history_file_path,
            created_at: chrono::Utc::now(),
        }
    }

    /// Use a specific history file instead of the default location
    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_file_path = path.into();
        self
    }
}
