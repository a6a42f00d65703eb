//! Execution plans: a goal plus ordered tasks with dependencies. Status
//! transitions are monotonic, with one exception — an in-progress task may
//! be requeued back to pending.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn can_transition(self, to: TaskStatus) -> bool {
        match (self, to) {
            (a, b) if a == b => true,
            // The one sanctioned backward edge: explicit requeue.
            (Self::InProgress, Self::Pending) => true,
            (Self::Pending, Self::InProgress | Self::Skipped | Self::Blocked) => true,
            (Self::Blocked, Self::Pending | Self::Skipped | Self::Failed) => true,
            (Self::InProgress, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            attempts: 0,
            result: None,
        }
    }

    pub fn depends_on(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            goal: goal.into(),
            tasks,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// The next task that can start: pending, with every dependency either
    /// completed or skipped. Tasks are considered in plan order.
    pub fn next_ready(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| {
            t.status == TaskStatus::Pending
                && t.depends_on.iter().all(|dep| {
                    self.task(dep)
                        .map(|d| matches!(d.status, TaskStatus::Completed | TaskStatus::Skipped))
                        .unwrap_or(false)
                })
        })
    }

    /// Validated status transition. Illegal transitions are programmer
    /// errors and throw.
    pub fn set_status(&mut self, id: &str, to: TaskStatus) -> Result<(), AgentError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| AgentError::Invariant(format!("unknown task id: {id}")))?;
        if !task.status.can_transition(to) {
            return Err(AgentError::Invariant(format!(
                "illegal task transition {:?} -> {:?} for {id}",
                task.status, to
            )));
        }
        if to == TaskStatus::InProgress {
            task.attempts += 1;
        }
        task.status = to;
        Ok(())
    }

    pub fn set_result(&mut self, id: &str, result: impl Into<String>) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
            task.result = Some(result.into());
        }
    }

    /// Mark pending tasks whose dependencies failed as blocked.
    pub fn propagate_blocks(&mut self) {
        let failed: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();
        for task in &mut self.tasks {
            if task.status == TaskStatus::Pending
                && task.depends_on.iter().any(|d| failed.contains(d))
            {
                task.status = TaskStatus::Blocked;
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.status.is_terminal() || t.status == TaskStatus::Blocked)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}
