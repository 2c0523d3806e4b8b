//! Side-channel conversation state. Both collections are replaced wholesale
//! by the events that carry them; nothing here merges.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default)]
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArtifact {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl FileArtifact {
    /// Language hint, falling back to the path's extension.
    pub fn language_hint(&self) -> Option<&str> {
        self.language.as_deref().or_else(|| {
            std::path::Path::new(&self.path)
                .extension()
                .and_then(|ext| ext.to_str())
        })
    }
}
