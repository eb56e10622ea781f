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

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use assert2::check;
use async_trait::async_trait;

use conveyor_worker::executor::{
    execute_task, ExecuteError, TaskContext, TaskHandler, TaskOutcome, TaskRegistry,
};
use conveyor_worker::model::{NewTask, TaskId, TaskState};
use conveyor_worker::store::memory::InMemoryTaskStore;
use conveyor_worker::store::TaskStore;

struct HangingHandler;

#[async_trait]
impl TaskHandler for HangingHandler {
    async fn run(&self, _ctx: TaskContext<'_>) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtin_handlers();
    registry.register("hang", Arc::new(HangingHandler));
    registry
}

#[tokio::test]
#[tracing::instrument]
async fn completed_task_reaches_a_final_state() {
    let store = InMemoryTaskStore::new();
    let working_dir = tempfile::tempdir().unwrap();
    let task = store.insert_task(NewTask::named("noop")).await.unwrap();

    let outcome = execute_task(&store, &registry(), &task.id, working_dir.path(), pending())
        .await
        .unwrap();

    check!(outcome == TaskOutcome::Completed);
    let task = store.task(&task.id).await.unwrap().unwrap();
    check!(task.state == TaskState::Completed);
    check!(task.started_at.is_some());
    check!(task.finished_at.is_some());
}

#[tokio::test]
#[tracing::instrument]
async fn handler_errors_are_recorded_on_the_task_row() {
    let store = InMemoryTaskStore::new();
    let working_dir = tempfile::tempdir().unwrap();
    let task = store.insert_task(NewTask::named("fail")).await.unwrap();

    let outcome = execute_task(&store, &registry(), &task.id, working_dir.path(), pending())
        .await
        .unwrap();

    check!(outcome == TaskOutcome::HandlerFailed);
    let task = store.task(&task.id).await.unwrap().unwrap();
    check!(task.state == TaskState::Failed);
    check!(task.error.as_deref().unwrap_or("").contains("intentional failure"));
}

#[tokio::test]
#[tracing::instrument]
async fn unregistered_task_names_fail_the_task() {
    let store = InMemoryTaskStore::new();
    let working_dir = tempfile::tempdir().unwrap();
    let task = store
        .insert_task(NewTask::named("no-such-task"))
        .await
        .unwrap();

    let outcome = execute_task(&store, &registry(), &task.id, working_dir.path(), pending())
        .await
        .unwrap();

    check!(outcome == TaskOutcome::HandlerFailed);
    let task = store.task(&task.id).await.unwrap().unwrap();
    check!(task.state == TaskState::Failed);
    check!(task.error.as_deref().unwrap_or("").contains("No handler registered"));
}

#[tokio::test]
#[tracing::instrument]
async fn missing_task_rows_are_an_execution_error() {
    let store = InMemoryTaskStore::new();
    let working_dir = tempfile::tempdir().unwrap();

    let result = execute_task(
        &store,
        &registry(),
        &TaskId::new(),
        working_dir.path(),
        pending(),
    )
    .await;

    check!(matches!(result, Err(ExecuteError::TaskNotFound(_))));
}

#[tokio::test]
#[tracing::instrument]
async fn abort_hint_fails_the_running_task() {
    let store = InMemoryTaskStore::new();
    let working_dir = tempfile::tempdir().unwrap();
    let task = store.insert_task(NewTask::named("hang")).await.unwrap();

    let abort = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let outcome = execute_task(&store, &registry(), &task.id, working_dir.path(), abort)
        .await
        .unwrap();

    check!(outcome == TaskOutcome::Aborted);
    let task = store.task(&task.id).await.unwrap().unwrap();
    check!(task.state == TaskState::Failed);
    check!(task.error.as_deref().unwrap_or("").contains("aborted"));
}
