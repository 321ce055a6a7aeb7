//! Page-side task loader: the consumer of the data endpoint.
//!
//! The worker guarantees a response but not its content, so the loader keeps its own
//! local copy for error statuses and unparseable bodies.

use tracing::{info, warn};

use crate::error::Result;
use crate::http::{Request, ResponseSource};
use crate::tasks::{local_tasks, Task, TaskStats};
use crate::worker::ServiceWorker;

/// Where a loaded task list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
  /// Answer from the worker (network, cache or worker fallback)
  Worker(ResponseSource),
  /// The loader's own default copy
  LocalCopy,
}

#[derive(Debug, Clone)]
pub struct LoadedTasks {
  pub tasks: Vec<Task>,
  pub source: TaskSource,
}

impl LoadedTasks {
  pub fn stats(&self) -> TaskStats {
    TaskStats::from_tasks(&self.tasks)
  }

  fn local() -> Self {
    Self {
      tasks: local_tasks(),
      source: TaskSource::LocalCopy,
    }
  }
}

/// Fetch the task list through the worker.
pub async fn load_tasks(worker: &ServiceWorker) -> Result<LoadedTasks> {
  let request = Request::get_path(worker.origin(), &worker.config().data_endpoint)?;
  let response = worker.fetch(request).await?;

  if !response.ok() {
    warn!(status = response.status(), "Could not load tasks, using local copy");
    return Ok(LoadedTasks::local());
  }

  let source = response.source();
  match response.json::<Vec<Task>>() {
    Ok(tasks) => {
      info!(count = tasks.len(), source = source.as_str(), "Tasks loaded");
      Ok(LoadedTasks {
        tasks,
        source: TaskSource::Worker(source),
      })
    }
    Err(e) => {
      warn!(error = %e, "Malformed task data, using local copy");
      Ok(LoadedTasks::local())
    }
  }
}
