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

pub mod config;
pub mod executor;
pub mod housekeeping;
pub mod locks;
pub mod metrics;
pub mod model;
pub mod signals;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use conveyor_common::db::create_postgres_pool;
use conveyor_common::redis::RedisPool;

use crate::config::WorkerServiceConfig;
use crate::executor::{execute_task, TaskOutcome, TaskRegistry};
use crate::model::TaskId;
use crate::storage::redis::RedisLockStorage;
use crate::storage::LockStorage;
use crate::store::db::DbTaskStore;
use crate::store::TaskStore;
use crate::worker::Worker;

/// Starts the worker process: connects the lock service and the task
/// store, runs migrations, seeds configured schedules, installs signal
/// handlers and enters the worker loop.
pub async fn run(config: WorkerServiceConfig, burst: bool) -> anyhow::Result<()> {
    let redis_pool = RedisPool::configured(&config.lock_store).await?;
    let lock_storage: Arc<dyn LockStorage> = Arc::new(RedisLockStorage::new(redis_pool));

    let db_pool = create_postgres_pool(&config.db).await?;
    sqlx::migrate!("./db/migration/postgres")
        .run(&db_pool)
        .await?;
    let task_store: Arc<dyn TaskStore> = Arc::new(DbTaskStore::new(db_pool));

    let registry = Arc::new(TaskRegistry::with_builtin_handlers());

    for schedule in &config.schedules {
        task_store
            .upsert_schedule(
                &schedule.name,
                &schedule.task_name,
                schedule.dispatch_interval,
            )
            .await?;
        info!(
            "Seeded schedule '{}' dispatching '{}' every {:?}",
            schedule.name, schedule.task_name, schedule.dispatch_interval
        );
    }

    let shutdown = signals::install(config.task_grace_interval)?;

    let mut worker = Worker::new(
        worker::worker_name(),
        config,
        task_store,
        lock_storage,
        registry,
        shutdown,
    )
    .await?;
    worker.run(burst).await
}

/// Entry point of the forked task process (`execute-task` subcommand).
///
/// Runs exactly one task and reports only through the task row and the
/// exit code; the supervising worker owns the claim and resource locks.
/// SIGUSR1 is the cooperative abort hint delivered by the supervisor.
pub async fn run_task_child(
    config: WorkerServiceConfig,
    task_id: TaskId,
    working_dir: PathBuf,
) -> anyhow::Result<i32> {
    let db_pool = create_postgres_pool(&config.db).await?;
    let task_store = DbTaskStore::new(db_pool);
    let registry = TaskRegistry::with_builtin_handlers();

    let mut abort_signal = signal(SignalKind::user_defined1())?;
    let abort = async move {
        abort_signal.recv().await;
    };

    let outcome = execute_task(&task_store, &registry, &task_id, &working_dir, abort).await?;
    Ok(match outcome {
        TaskOutcome::Completed | TaskOutcome::HandlerFailed => 0,
        TaskOutcome::Aborted => 1,
    })
}
