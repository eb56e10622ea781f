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

pub mod db;
pub mod memory;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{NewTask, TaskId, TaskRecord, TaskScheduleRecord, VersionMap, WorkerRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal(message.into())
    }
}

/// Housekeeping activities, each coordinated across the worker fleet by
/// a named non-blocking advisory lock in the task store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdvisoryLock {
    Scheduling,
    WorkerCleanup,
    TaskMetrics,
}

impl AdvisoryLock {
    pub fn key(&self) -> i32 {
        match self {
            AdvisoryLock::Scheduling => 1,
            AdvisoryLock::WorkerCleanup => 2,
            AdvisoryLock::TaskMetrics => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdvisoryLock::Scheduling => "scheduling",
            AdvisoryLock::WorkerCleanup => "worker-cleanup",
            AdvisoryLock::TaskMetrics => "task-metrics",
        }
    }
}

/// Holding one of the advisory locks. Dropping the guard releases it;
/// `release` does so explicitly so errors are observable.
#[async_trait]
pub trait AdvisoryLockGuard: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

/// The authoritative relational store: tasks, worker registry and the
/// periodic schedule table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Waiting tasks in creation order, excluding the given ids, with
    /// the domain name joined in for logging.
    async fn waiting_tasks(
        &self,
        limit: usize,
        exclude: &HashSet<TaskId>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn insert_task(&self, new_task: NewTask) -> Result<TaskRecord, StoreError>;

    async fn set_task_started(&self, id: &TaskId) -> Result<(), StoreError>;

    async fn set_task_completed(&self, id: &TaskId) -> Result<(), StoreError>;

    /// Idempotent: a no-op returning `false` when the task is already in
    /// a final state.
    async fn set_task_failed(&self, id: &TaskId, error: &str) -> Result<bool, StoreError>;

    /// The subset of `ids` still in a non-final state.
    async fn incomplete_tasks_of(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, StoreError>;

    async fn count_tasks_not_final_older_than(&self, age: Duration) -> Result<i64, StoreError>;

    async fn upsert_worker(&self, name: &str, versions: &VersionMap) -> Result<(), StoreError>;

    /// Refreshes the worker's heartbeat; `false` when the registry row
    /// is gone.
    async fn touch_worker(&self, name: &str) -> Result<bool, StoreError>;

    async fn delete_worker(&self, name: &str) -> Result<(), StoreError>;

    async fn online_worker_count(&self, ttl: Duration) -> Result<usize, StoreError>;

    /// Workers whose heartbeat is older than the TTL.
    async fn missing_workers(&self, ttl: Duration) -> Result<Vec<WorkerRecord>, StoreError>;

    async fn upsert_schedule(
        &self,
        name: &str,
        task_name: &str,
        dispatch_interval: Duration,
    ) -> Result<(), StoreError>;

    async fn due_schedules(&self, now: DateTime<Utc>)
        -> Result<Vec<TaskScheduleRecord>, StoreError>;

    async fn mark_schedule_dispatched(
        &self,
        id: &Uuid,
        next_dispatch: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Non-blocking try-acquire; `None` means another worker holds the
    /// lock this tick.
    async fn try_advisory_lock(
        &self,
        lock: AdvisoryLock,
    ) -> Result<Option<Box<dyn AdvisoryLockGuard>>, StoreError>;
}
