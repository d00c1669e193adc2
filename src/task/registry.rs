//! In-memory task store.
//!
//! Pure state container: no network, no timers, no ordering rules. Writes go
//! through [`super::Reconciler`], which decides what gets stored.

use std::collections::HashMap;

use super::task::{Task, TaskId, TaskStatus};

/// All known tasks, at most one entry per id.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `task.id`. Returns the previous entry.
    pub fn upsert(&mut self, task: Task) -> Option<Task> {
        self.tasks.insert(task.id.clone(), task)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Every entry, ordered by id.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Ids of entries that have not reached a terminal status.
    pub fn active_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remove every cancelled entry and return what was removed.
    pub fn remove_cancelled(&mut self) -> Vec<Task> {
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Cancelled)
            .map(|t| t.id.clone())
            .collect();

        let mut removed: Vec<Task> = ids
            .iter()
            .filter_map(|id| self.tasks.remove(id))
            .collect();
        removed.sort_by(|a, b| a.id.cmp(&b.id));
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Sequence, TaskKind, TaskProgress, UpdateSource};
    use chrono::Utc;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: TaskId::from(id),
            kind: TaskKind::SingleTrack,
            status,
            progress: TaskProgress::default(),
            last_updated: Sequence::ZERO,
            error: None,
            origin: UpdateSource::Poll,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_keeps_one_entry_per_id() {
        let mut registry = TaskRegistry::new();
        assert!(registry.upsert(task("a", TaskStatus::Pending)).is_none());
        let previous = registry.upsert(task("a", TaskStatus::Running));

        assert_eq!(previous.unwrap().status, TaskStatus::Pending);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&"a".into()).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn test_remove_cancelled_only_touches_cancelled() {
        let mut registry = TaskRegistry::new();
        registry.upsert(task("p", TaskStatus::Pending));
        registry.upsert(task("r", TaskStatus::Running));
        registry.upsert(task("c1", TaskStatus::Cancelled));
        registry.upsert(task("d", TaskStatus::Completed));
        registry.upsert(task("f", TaskStatus::Failed));
        registry.upsert(task("c2", TaskStatus::Cancelled));

        let removed: Vec<String> = registry
            .remove_cancelled()
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();

        assert_eq!(removed, vec!["c1", "c2"]);
        let left: Vec<(String, TaskStatus)> = registry
            .list()
            .into_iter()
            .map(|t| (t.id.to_string(), t.status))
            .collect();
        assert_eq!(
            left,
            vec![
                ("d".to_string(), TaskStatus::Completed),
                ("f".to_string(), TaskStatus::Failed),
                ("p".to_string(), TaskStatus::Pending),
                ("r".to_string(), TaskStatus::Running),
            ]
        );
    }

    #[test]
    fn test_active_ids_skip_terminal() {
        let mut registry = TaskRegistry::new();
        registry.upsert(task("b", TaskStatus::Running));
        registry.upsert(task("a", TaskStatus::Pending));
        registry.upsert(task("z", TaskStatus::Completed));
        assert_eq!(registry.active_ids(), vec![TaskId::from("a"), TaskId::from("b")]);
        assert_eq!(registry.list_by_status(TaskStatus::Pending).len(), 1);
    }
}
