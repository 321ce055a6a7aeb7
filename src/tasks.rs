//! Task records served by the data endpoint, and the built-in defaults.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
}

impl Priority {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Medium => "medium",
      Self::High => "high",
    }
  }
}

/// A single task record as found in `data.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
  pub id: u64,
  pub task: String,
  pub completed: bool,
  pub priority: Priority,
}

impl Task {
  fn new(id: u64, task: &str, completed: bool, priority: Priority) -> Self {
    Self {
      id,
      task: task.to_string(),
      completed,
      priority,
    }
  }
}

/// The six records the worker answers with when neither network nor cache can.
pub fn default_tasks() -> Vec<Task> {
  vec![
    Task::new(1, "Buy groceries for the week", false, Priority::High),
    Task::new(2, "Finish the project report", false, Priority::High),
    Task::new(3, "Call the dentist for an appointment", true, Priority::Medium),
    Task::new(4, "Review pending emails", false, Priority::Medium),
    Task::new(5, "Exercise for 30 minutes", true, Priority::Low),
    Task::new(6, "Read a book for 20 minutes", false, Priority::Low),
  ]
}

/// Local copy used by the page-side loader when the response cannot be used: the
/// first five default tasks.
pub fn local_tasks() -> Vec<Task> {
  let mut tasks = default_tasks();
  tasks.truncate(5);
  tasks
}

/// Immutable fallback payload, encoded once at construction.
#[derive(Debug, Clone)]
pub struct FallbackPayload {
  tasks: Arc<[Task]>,
  encoded: Bytes,
}

impl FallbackPayload {
  pub fn new(tasks: Vec<Task>) -> serde_json::Result<Self> {
    let encoded = Bytes::from(serde_json::to_vec(&tasks)?);
    Ok(Self {
      tasks: tasks.into(),
      encoded,
    })
  }

  pub fn tasks(&self) -> &[Task] {
    &self.tasks
  }

  /// JSON encoding of the payload.
  pub fn body(&self) -> Bytes {
    self.encoded.clone()
  }
}

impl Default for FallbackPayload {
  fn default() -> Self {
    // Serializing plain structs with derived impls cannot fail.
    let tasks = default_tasks();
    let encoded = Bytes::from(serde_json::to_vec(&tasks).unwrap_or_default());
    Self {
      tasks: tasks.into(),
      encoded,
    }
  }
}

/// Dashboard counters for a task list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
  pub total: usize,
  pub pending: usize,
  pub completed: usize,
  /// High priority tasks that are still pending
  pub urgent: usize,
}

impl TaskStats {
  pub fn from_tasks(tasks: &[Task]) -> Self {
    let completed = tasks.iter().filter(|t| t.completed).count();
    let urgent = tasks
      .iter()
      .filter(|t| t.priority == Priority::High && !t.completed)
      .count();

    Self {
      total: tasks.len(),
      pending: tasks.len() - completed,
      completed,
      urgent,
    }
  }
}
