pub mod diff;
pub mod event;
pub mod session;
pub mod settings;
pub mod tool;

pub use diff::*;
pub use event::*;
pub use session::*;
pub use settings::*;
pub use tool::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Execution context supplied by the workspace selector. Tiller never
/// creates or mutates workspaces, it only runs against one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }
}
