//! Task list use-cases.

use crate::model::record::RecordKey;
use crate::model::task::Task;
use crate::service::ServiceResult;
use crate::sync::collection::{Collection, LiveRow};
use crate::sync::mutation::MutationTicket;

/// Task list facade over the task collection.
#[derive(Clone)]
pub struct TaskService {
    tasks: Collection<Task>,
}

impl TaskService {
    pub fn new(tasks: Collection<Task>) -> Self {
        Self { tasks }
    }

    /// Adds an open task. Surrounding whitespace is dropped; blank text is
    /// rejected before anything becomes visible.
    pub fn add(&self, text: &str) -> ServiceResult<MutationTicket> {
        Ok(self.tasks.insert(Task::new(text.trim()))?)
    }

    /// Flips the completion flag.
    pub fn toggle(&self, key: RecordKey) -> ServiceResult<MutationTicket> {
        Ok(self
            .tasks
            .update(key, |task| task.completed = !task.completed)?)
    }

    pub fn rename(&self, key: RecordKey, text: &str) -> ServiceResult<MutationTicket> {
        let text = text.trim().to_string();
        Ok(self.tasks.update(key, move |task| task.text = text)?)
    }

    pub fn remove(&self, key: RecordKey) -> ServiceResult<MutationTicket> {
        Ok(self.tasks.delete(key)?)
    }

    /// Visible tasks in collection order: synced rows by id, then pending
    /// creates in insertion order.
    pub fn list(&self) -> Vec<LiveRow<Task>> {
        self.tasks.snapshot().as_ref().clone()
    }

    pub fn open_count(&self) -> usize {
        self.tasks
            .snapshot()
            .iter()
            .filter(|row| !row.value.completed)
            .count()
    }
}
