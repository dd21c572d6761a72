//! Task record: an ordered back-stack of activities.

use crate::types::{ActivityId, Intent, StackId, TaskId, UserId};

/// An ordered sequence of activities sharing a back-stack history.
///
/// A task belongs to exactly one stack; removing its last activity destroys
/// the task.
#[derive(Debug)]
pub struct TaskRecord {
    /// This record's id.
    pub id: TaskId,
    /// Externally visible task number, unique across all stacks.
    pub task_num: i32,
    /// Owning stack.
    pub stack: StackId,
    /// Activities, bottom to top.
    pub activities: Vec<ActivityId>,
    /// The intent that created the task.
    pub root_intent: Intent,
    /// Task affinity used to match launches into existing tasks.
    pub affinity: Option<String>,
    /// Logical user the task belongs to.
    pub user: UserId,
}

impl TaskRecord {
    /// Creates an empty task.
    #[must_use]
    pub fn new(
        id: TaskId,
        task_num: i32,
        stack: StackId,
        root_intent: Intent,
        affinity: Option<String>,
        user: UserId,
    ) -> Self {
        Self {
            id,
            task_num,
            stack,
            activities: Vec::new(),
            root_intent,
            affinity,
            user,
        }
    }

    /// Returns the topmost activity, if any.
    #[must_use]
    pub fn top_activity(&self) -> Option<ActivityId> {
        self.activities.last().copied()
    }

    /// Returns the root (bottom) activity, if any.
    #[must_use]
    pub fn root_activity(&self) -> Option<ActivityId> {
        self.activities.first().copied()
    }

    /// Returns true if `activity` sits at the task's root position.
    #[must_use]
    pub fn is_root(&self, activity: ActivityId) -> bool {
        self.root_activity() == Some(activity)
    }

    /// Appends an activity on top.
    pub fn push_activity(&mut self, activity: ActivityId) {
        self.activities.push(activity);
    }

    /// Removes an activity wherever it sits; returns true if it was present.
    pub fn remove_activity(&mut self, activity: ActivityId) -> bool {
        let before = self.activities.len();
        self.activities.retain(|&a| a != activity);
        self.activities.len() != before
    }

    /// Returns true if the task holds no activities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}
