use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineKind {
    Header,
    Add,
    Remove,
    Context,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffLine {
    #[serde(rename = "type")]
    pub kind: DiffLineKind,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hunk {
    #[serde(rename = "oldStart")]
    pub old_start: u64,
    #[serde(rename = "oldCount")]
    pub old_count: u64,
    #[serde(rename = "newStart")]
    pub new_start: u64,
    #[serde(rename = "newCount")]
    pub new_count: u64,
    pub lines: Vec<DiffLine>,
}

/// Structured view of one file inside a unified diff. Derived data:
/// always re-derivable from the patch text that produced it. Zero
/// hunks is valid and means "metadata only" (rename-only change, or
/// hunk content not persisted).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDiff {
    #[serde(rename = "oldPath")]
    pub old_path: String,
    #[serde(rename = "newPath")]
    pub new_path: String,
    #[serde(rename = "isNew")]
    pub is_new: bool,
    #[serde(rename = "isDeleted")]
    pub is_deleted: bool,
    #[serde(default)]
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    pub fn is_metadata_only(&self) -> bool {
        self.hunks.is_empty()
    }
}
