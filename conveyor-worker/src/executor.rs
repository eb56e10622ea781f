// Copyright 2024 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::model::{TaskId, TaskRecord, VersionMap};
use crate::store::{StoreError, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a supervised task execution ended. Handler failures are task
/// outcomes, recorded on the task row, not execution errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    HandlerFailed,
    Aborted,
}

pub struct TaskContext<'a> {
    pub task: &'a TaskRecord,
    pub task_store: &'a dyn TaskStore,
    pub working_dir: &'a Path,
}

/// A task payload. Handlers are looked up by the name stored on the
/// task row and run inside the task process (or inline for immediate
/// tasks).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext<'_>) -> anyhow::Result<()>;
}

/// Maps task names to handlers and declares the module versions this
/// worker provides, used for task compatibility checks.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    versions: VersionMap,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.declare_version("core", env!("CARGO_PKG_VERSION"));
        registry.register("noop", Arc::new(NoOpHandler));
        registry.register("fail", Arc::new(FailHandler));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn declare_version(&mut self, module: impl Into<String>, version: impl Into<String>) {
        self.versions.insert(module.into(), version.into());
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn versions(&self) -> &VersionMap {
        &self.versions
    }
}

/// Loads and runs one task, recording its final state on the task row.
///
/// `abort` is the cooperative abort hint; when it completes first the
/// handler future is dropped and the task is failed. The caller owns the
/// claim and resource locks throughout.
pub async fn execute_task(
    task_store: &dyn TaskStore,
    registry: &TaskRegistry,
    task_id: &TaskId,
    working_dir: &Path,
    abort: impl Future<Output = ()> + Send,
) -> Result<TaskOutcome, ExecuteError> {
    let task = task_store
        .task(task_id)
        .await?
        .ok_or(ExecuteError::TaskNotFound(*task_id))?;

    let Some(handler) = registry.handler(&task.name) else {
        let error = format!("No handler registered for task '{}'", task.name);
        warn!("Task {} in domain {}: {error}", task.id, task.domain_name);
        task_store.set_task_failed(task_id, &error).await?;
        return Ok(TaskOutcome::HandlerFailed);
    };

    task_store.set_task_started(task_id).await?;
    info!(
        "Executing task {} ({}) in domain: {}",
        task.id, task.name, task.domain_name
    );

    let context = TaskContext {
        task: &task,
        task_store,
        working_dir,
    };
    let run = handler.run(context);
    tokio::pin!(run);
    tokio::pin!(abort);

    let outcome = tokio::select! {
        result = &mut run => match result {
            Ok(()) => {
                task_store.set_task_completed(task_id).await?;
                TaskOutcome::Completed
            }
            Err(error) => {
                warn!("Task {} failed: {error:#}", task.id);
                task_store
                    .set_task_failed(task_id, &format!("{error:#}"))
                    .await?;
                TaskOutcome::HandlerFailed
            }
        },
        _ = &mut abort => {
            info!("Aborting task {} on shutdown request", task.id);
            task_store
                .set_task_failed(task_id, "Task aborted during worker shutdown")
                .await?;
            TaskOutcome::Aborted
        }
    };

    info!("Task {} finished: {outcome:?}", task.id);
    Ok(outcome)
}

/// Does nothing beyond one store round trip and a short pause; used by
/// seeded periodic schedules and smoke tests.
struct NoOpHandler;

#[async_trait]
impl TaskHandler for NoOpHandler {
    async fn run(&self, ctx: TaskContext<'_>) -> anyhow::Result<()> {
        ctx.task_store
            .count_tasks_not_final_older_than(Duration::ZERO)
            .await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }
}

struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    async fn run(&self, _ctx: TaskContext<'_>) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("intentional failure"))
    }
}
