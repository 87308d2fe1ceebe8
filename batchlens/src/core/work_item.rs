//! Work items: one image source to classify.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle state of a work item within a session.
///
/// Terminal states are written once and never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Not yet dispatched or still in flight.
    #[default]
    Pending,
    /// Classified successfully.
    Success,
    /// Failed terminally (retries exhausted or non-retryable error).
    Failed,
    /// Skipped before dispatch (budget denial, already recorded).
    Skipped,
}

/// A single unit of classification work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier derived from the source reference.
    pub id: String,
    /// Path or URL of the image.
    pub source: String,
    /// Optional title hint passed to the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional description hint passed to the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current lifecycle state.
    #[serde(default)]
    pub state: ItemState,
}

impl WorkItem {
    /// Creates a work item with an id derived from the source.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id: Self::derive_id(&source),
            source,
            title: None,
            description: None,
            state: ItemState::Pending,
        }
    }

    /// Sets the title hint.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the description hint.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Derives the stable id for a source reference.
    ///
    /// First 16 hex characters of SHA-256, enough to make collisions
    /// within one batch implausible while keeping log lines readable.
    #[must_use]
    pub fn derive_id(source: &str) -> String {
        let digest = Sha256::digest(source.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Moves the item into a terminal state. The first terminal state
    /// sticks; later calls are ignored.
    pub fn settle(&mut self, state: ItemState) {
        if self.state == ItemState::Pending && state != ItemState::Pending {
            self.state = state;
        }
    }

    /// Returns true once the item has reached a terminal state.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state != ItemState::Pending
    }
}

impl From<crate::core::OutcomeStatus> for ItemState {
    fn from(status: crate::core::OutcomeStatus) -> Self {
        match status {
            crate::core::OutcomeStatus::Success => Self::Success,
            crate::core::OutcomeStatus::Failed => Self::Failed,
            crate::core::OutcomeStatus::Skipped => Self::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_id_is_stable() {
        let a = WorkItem::new("photos/cat.jpg");
        let b = WorkItem::new("photos/cat.jpg");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }

    #[test]
    fn test_id_differs_by_source() {
        let a = WorkItem::new("photos/cat.jpg");
        let b = WorkItem::new("photos/dog.jpg");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_builder_hints() {
        let item = WorkItem::new("x.png")
            .with_title("sunset")
            .with_description("beach at dusk");
        assert_eq!(item.title.as_deref(), Some("sunset"));
        assert_eq!(item.description.as_deref(), Some("beach at dusk"));
        assert_eq!(item.state, ItemState::Pending);
    }

    #[test]
    fn test_first_terminal_state_sticks() {
        let mut item = WorkItem::new("x.png");
        assert!(!item.is_settled());

        item.settle(ItemState::Failed);
        assert_eq!(item.state, ItemState::Failed);

        item.settle(ItemState::Success);
        assert_eq!(item.state, ItemState::Failed);
    }

    #[test]
    fn test_hints_omitted_from_json_when_absent() {
        let item = WorkItem::new("x.png");
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("title"));
        assert!(!json.contains("description"));
    }
}
