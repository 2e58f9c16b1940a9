use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use veritask_common::TaskId;

/// Keyed exclusive leases: at most one driver per task id
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    held: Arc<Mutex<HashSet<TaskId>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` while another lease for the task is alive
    pub fn try_acquire(&self, task_id: TaskId) -> Option<TaskLease> {
        if !self.held().insert(task_id) {
            return None;
        }
        Some(TaskLease {
            task_id,
            table: self.clone(),
        })
    }

    pub fn is_held(&self, task_id: TaskId) -> bool {
        self.held().contains(&task_id)
    }
}

/// Released on drop
#[derive(Debug)]
pub struct TaskLease {
    task_id: TaskId,
    table: LeaseTable,
}

impl TaskLease {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        self.table.held().remove(&self.task_id);
    }
}
