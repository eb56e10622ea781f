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

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::model::{
    NewTask, TaskId, TaskRecord, TaskScheduleRecord, TaskState, VersionMap, WorkerRecord,
};
use crate::store::{AdvisoryLock, AdvisoryLockGuard, StoreError, TaskStore};

const TASK_COLUMNS: &str = "t.id, t.name, t.state, t.created_at, t.started_at, t.finished_at, \
     t.reserved_resources, t.immediate, t.versions, d.name AS domain_name, t.error";

const FINAL_STATES_SQL: &str = "('completed', 'failed', 'canceled', 'skipped')";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    state: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    reserved_resources: Vec<String>,
    immediate: bool,
    versions: Json<VersionMap>,
    domain_name: String,
    error: Option<String>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(TaskRecord {
            id: TaskId(row.id),
            name: row.name,
            state: TaskState::from_str(&row.state).map_err(StoreError::internal)?,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            reserved_resources: row.reserved_resources,
            immediate: row.immediate,
            versions: row.versions.0,
            domain_name: row.domain_name,
            error: row.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    name: String,
    app_type: String,
    last_heartbeat: DateTime<Utc>,
    versions: Json<VersionMap>,
}

impl From<WorkerRow> for WorkerRecord {
    fn from(row: WorkerRow) -> Self {
        WorkerRecord {
            name: row.name,
            app_type: row.app_type,
            last_heartbeat: row.last_heartbeat,
            versions: row.versions.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskScheduleRow {
    id: Uuid,
    name: String,
    task_name: String,
    dispatch_interval_ms: i64,
    next_dispatch: DateTime<Utc>,
}

impl From<TaskScheduleRow> for TaskScheduleRecord {
    fn from(row: TaskScheduleRow) -> Self {
        TaskScheduleRecord {
            id: row.id,
            name: row.name,
            task_name: row.task_name,
            dispatch_interval: Duration::from_millis(row.dispatch_interval_ms.max(0) as u64),
            next_dispatch: row.next_dispatch,
        }
    }
}

pub struct DbTaskStore {
    pool: PgPool,
}

impl DbTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn cutoff(age: Duration) -> Result<DateTime<Utc>, StoreError> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| StoreError::internal(format!("invalid duration: {e}")))?;
        Ok(Utc::now() - age)
    }

    async fn domain_id(&self, name: &str) -> Result<Uuid, StoreError> {
        sqlx::query("INSERT INTO domains (id, name) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
            .bind(Uuid::new_v4())
            .bind(name)
            .execute(&self.pool)
            .await?;
        let id: Uuid = sqlx::query_scalar("SELECT id FROM domains WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }
}

struct DbAdvisoryLockGuard {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AdvisoryLockGuard for DbAdvisoryLockGuard {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        // xact-scoped locks release with the transaction
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for DbTaskStore {
    async fn waiting_tasks(
        &self,
        limit: usize,
        exclude: &HashSet<TaskId>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let exclude: Vec<Uuid> = exclude.iter().map(|id| id.0).collect();
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} \
             FROM tasks t JOIN domains d ON d.id = t.domain_id \
             WHERE t.state = 'waiting' AND t.id <> ALL($1) \
             ORDER BY t.created_at \
             LIMIT $2"
        ))
        .bind(&exclude)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} \
             FROM tasks t JOIN domains d ON d.id = t.domain_id \
             WHERE t.id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRecord::try_from).transpose()
    }

    async fn insert_task(&self, new_task: NewTask) -> Result<TaskRecord, StoreError> {
        let domain_id = self.domain_id(&new_task.domain_name).await?;
        let id = TaskId::new();
        sqlx::query(
            "INSERT INTO tasks \
             (id, name, state, created_at, reserved_resources, immediate, versions, domain_id) \
             VALUES ($1, $2, 'waiting', now(), $3, $4, $5, $6)",
        )
        .bind(id.0)
        .bind(&new_task.name)
        .bind(&new_task.reserved_resources)
        .bind(new_task.immediate)
        .bind(Json(&new_task.versions))
        .bind(domain_id)
        .execute(&self.pool)
        .await?;
        self.task(&id)
            .await?
            .ok_or_else(|| StoreError::internal(format!("inserted task {id} not found")))
    }

    async fn set_task_started(&self, id: &TaskId) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET state = 'running', started_at = now() WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_completed(&self, id: &TaskId) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET state = 'completed', finished_at = now() WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_failed(&self, id: &TaskId, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET state = 'failed', finished_at = now(), error = $2 \
             WHERE id = $1 AND state NOT IN {FINAL_STATES_SQL}"
        ))
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn incomplete_tasks_of(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, StoreError> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let rows: Vec<Uuid> = sqlx::query_scalar(&format!(
            "SELECT id FROM tasks WHERE id = ANY($1) AND state NOT IN {FINAL_STATES_SQL}"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TaskId).collect())
    }

    async fn count_tasks_not_final_older_than(&self, age: Duration) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM tasks \
             WHERE state NOT IN {FINAL_STATES_SQL} AND created_at < $1"
        ))
        .bind(Self::cutoff(age)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn upsert_worker(&self, name: &str, versions: &VersionMap) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workers (name, app_type, last_heartbeat, versions) \
             VALUES ($1, 'worker', now(), $2) \
             ON CONFLICT (name) \
             DO UPDATE SET last_heartbeat = now(), versions = EXCLUDED.versions",
        )
        .bind(name)
        .bind(Json(versions))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_worker(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat = now() WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_worker(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn online_worker_count(&self, ttl: Duration) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workers \
             WHERE app_type = 'worker' AND last_heartbeat >= $1",
        )
        .bind(Self::cutoff(ttl)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn missing_workers(&self, ttl: Duration) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            "SELECT name, app_type, last_heartbeat, versions FROM workers \
             WHERE last_heartbeat < $1 \
             ORDER BY name",
        )
        .bind(Self::cutoff(ttl)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WorkerRecord::from).collect())
    }

    async fn upsert_schedule(
        &self,
        name: &str,
        task_name: &str,
        dispatch_interval: Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_schedules (id, name, task_name, dispatch_interval_ms, next_dispatch) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (name) \
             DO UPDATE SET task_name = EXCLUDED.task_name, \
                           dispatch_interval_ms = EXCLUDED.dispatch_interval_ms",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(task_name)
        .bind(dispatch_interval.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskScheduleRecord>, StoreError> {
        let rows: Vec<TaskScheduleRow> = sqlx::query_as(
            "SELECT id, name, task_name, dispatch_interval_ms, next_dispatch \
             FROM task_schedules \
             WHERE next_dispatch <= $1 \
             ORDER BY name",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TaskScheduleRecord::from).collect())
    }

    async fn mark_schedule_dispatched(
        &self,
        id: &Uuid,
        next_dispatch: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_schedules SET next_dispatch = $2 WHERE id = $1")
            .bind(id)
            .bind(next_dispatch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_advisory_lock(
        &self,
        lock: AdvisoryLock,
    ) -> Result<Option<Box<dyn AdvisoryLockGuard>>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1, $2)")
            .bind(0i32)
            .bind(lock.key())
            .fetch_one(&mut *tx)
            .await?;
        if acquired {
            Ok(Some(Box::new(DbAdvisoryLockGuard { tx })))
        } else {
            tx.rollback().await?;
            Ok(None)
        }
    }
}
