//! Task record.
//!
//! # Invariants
//! - `text` must not be blank when a task is inserted or renamed.
//! - `completed` defaults to `false` for new tasks.

use crate::model::record::{RecordKind, RecordValidationError, SyncRecord};
use serde::{Deserialize, Serialize};

const TASK_TEXT_MAX_CHARS: usize = 2_000;

/// Business fields of one to-do item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            completed: false,
        }
    }
}

/// Changed task fields for the partial update endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl SyncRecord for Task {
    type Patch = TaskPatch;

    const KIND: RecordKind = RecordKind::Task;

    fn diff(&self, modified: &Self) -> Option<TaskPatch> {
        let patch = TaskPatch {
            text: (self.text != modified.text).then(|| modified.text.clone()),
            completed: (self.completed != modified.completed).then_some(modified.completed),
        };
        if patch == TaskPatch::default() {
            None
        } else {
            Some(patch)
        }
    }

    fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(text) = patch.text.as_ref() {
            self.text = text.clone();
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
    }

    fn validate(&self) -> Result<(), RecordValidationError> {
        if self.text.trim().is_empty() {
            return Err(RecordValidationError::BlankField("text"));
        }
        if self.text.chars().count() > TASK_TEXT_MAX_CHARS {
            return Err(RecordValidationError::TooLong {
                field: "text",
                max_chars: TASK_TEXT_MAX_CHARS,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Task, TaskPatch};
    use crate::model::record::{RecordValidationError, SyncRecord};

    #[test]
    fn diff_reports_only_changed_fields() {
        let original = Task::new("Buy milk");
        let mut modified = original.clone();
        modified.completed = true;

        let patch = original.diff(&modified).expect("completed changed");
        assert_eq!(
            patch,
            TaskPatch {
                text: None,
                completed: Some(true),
            }
        );
        let body = serde_json::to_value(&patch).unwrap();
        assert_eq!(body, serde_json::json!({ "completed": true }));
    }

    #[test]
    fn diff_of_identical_tasks_is_none() {
        let task = Task::new("same");
        assert!(task.diff(&task.clone()).is_none());
    }

    #[test]
    fn validate_rejects_blank_text() {
        assert_eq!(
            Task::new("   ").validate(),
            Err(RecordValidationError::BlankField("text"))
        );
    }
}
