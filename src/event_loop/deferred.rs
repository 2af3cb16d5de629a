//! Deferred task queue
//!
//! Tasks run in insertion order the next time the loop is idle, before it
//! blocks. A task id can be queued at most once; queueing it again while it
//! is pending is a no-op.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::display::Display;
use crate::window::WindowId;

/// Work run once with the display context.
pub type DeferredTask = Box<dyn FnOnce(&mut Display)>;

/// Deduplication key of a deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// The redraw task of a window.
    Redraw(WindowId),
    /// A caller-chosen key.
    Keyed(u64),
    /// A task queued without a key; never collides.
    Anonymous(u64),
}

#[derive(Default)]
pub struct DeferredQueue {
    tasks: VecDeque<(TaskId, DeferredTask)>,
    queued: HashSet<TaskId>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` unless `id` is already pending. Returns whether it was
    /// queued.
    pub fn push(&mut self, id: TaskId, task: DeferredTask) -> bool {
        if !self.queued.insert(id) {
            return false;
        }
        self.tasks.push_back((id, task));
        true
    }

    pub fn pop(&mut self) -> Option<(TaskId, DeferredTask)> {
        let (id, task) = self.tasks.pop_front()?;
        self.queued.remove(&id);
        Some((id, task))
    }

    /// Drops a pending task. Returns whether one was pending.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        if !self.queued.remove(&id) {
            return false;
        }
        self.tasks.retain(|(queued, _)| *queued != id);
        true
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.queued.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|(id, _)| id))
            .finish()
    }
}
