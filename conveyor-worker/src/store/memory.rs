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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    NewTask, TaskId, TaskRecord, TaskScheduleRecord, TaskState, VersionMap, WorkerRecord,
};
use crate::store::{AdvisoryLock, AdvisoryLockGuard, StoreError, TaskStore};

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, TaskRecord>,
    workers: HashMap<String, WorkerRecord>,
    schedules: HashMap<String, TaskScheduleRecord>,
    advisory_locks: HashSet<AdvisoryLock>,
}

/// In-process task store used by the test suites.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites a worker's heartbeat, letting tests age a worker into
    /// the missing state without waiting out the TTL.
    pub fn set_worker_heartbeat(&self, name: &str, last_heartbeat: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(name) {
            worker.last_heartbeat = last_heartbeat;
        }
    }

    /// Backdates a task's creation time, for queue-depth and ordering
    /// tests.
    pub fn set_task_created_at(&self, id: &TaskId, created_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(id) {
            task.created_at = created_at;
        }
    }

    pub fn task_state(&self, id: &TaskId) -> Option<TaskState> {
        let state = self.state.lock().unwrap();
        state.tasks.get(id).map(|task| task.state)
    }

    pub fn worker_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.workers.keys().cloned().collect();
        names.sort();
        names
    }

    fn update_task(
        &self,
        id: &TaskId,
        update: impl FnOnce(&mut TaskRecord),
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.tasks.get_mut(id) {
            Some(task) => {
                update(task);
                Ok(())
            }
            None => Err(StoreError::internal(format!("no such task: {id}"))),
        }
    }
}

struct InMemoryAdvisoryLockGuard {
    state: Arc<Mutex<State>>,
    lock: AdvisoryLock,
}

impl Drop for InMemoryAdvisoryLockGuard {
    fn drop(&mut self) {
        self.state.lock().unwrap().advisory_locks.remove(&self.lock);
    }
}

#[async_trait]
impl AdvisoryLockGuard for InMemoryAdvisoryLockGuard {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn waiting_tasks(
        &self,
        limit: usize,
        exclude: &HashSet<TaskId>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut waiting: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Waiting && !exclude.contains(&task.id))
            .cloned()
            .collect();
        waiting.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        waiting.truncate(limit);
        Ok(waiting)
    }

    async fn task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.tasks.get(id).cloned())
    }

    async fn insert_task(&self, new_task: NewTask) -> Result<TaskRecord, StoreError> {
        let task = TaskRecord {
            id: TaskId::new(),
            name: new_task.name,
            state: TaskState::Waiting,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            reserved_resources: new_task.reserved_resources,
            immediate: new_task.immediate,
            versions: new_task.versions,
            domain_name: new_task.domain_name,
            error: None,
        };
        let mut state = self.state.lock().unwrap();
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn set_task_started(&self, id: &TaskId) -> Result<(), StoreError> {
        self.update_task(id, |task| {
            task.state = TaskState::Running;
            task.started_at = Some(Utc::now());
        })
    }

    async fn set_task_completed(&self, id: &TaskId) -> Result<(), StoreError> {
        self.update_task(id, |task| {
            task.state = TaskState::Completed;
            task.finished_at = Some(Utc::now());
        })
    }

    async fn set_task_failed(&self, id: &TaskId, error: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.tasks.get_mut(id) {
            Some(task) if !task.state.is_final() => {
                task.state = TaskState::Failed;
                task.finished_at = Some(Utc::now());
                task.error = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incomplete_tasks_of(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(id)
                    .map(|task| !task.state.is_final())
                    .unwrap_or(false)
            })
            .copied()
            .collect())
    }

    async fn count_tasks_not_final_older_than(&self, age: Duration) -> Result<i64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age)
                .map_err(|e| StoreError::internal(format!("invalid age: {e}")))?;
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|task| !task.state.is_final() && task.created_at < cutoff)
            .count() as i64)
    }

    async fn upsert_worker(&self, name: &str, versions: &VersionMap) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.workers.insert(
            name.to_string(),
            WorkerRecord {
                name: name.to_string(),
                app_type: "worker".to_string(),
                last_heartbeat: Utc::now(),
                versions: versions.clone(),
            },
        );
        Ok(())
    }

    async fn touch_worker(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.workers.get_mut(name) {
            Some(worker) => {
                worker.last_heartbeat = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_worker(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.workers.remove(name);
        Ok(())
    }

    async fn online_worker_count(&self, ttl: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::internal(format!("invalid ttl: {e}")))?;
        let state = self.state.lock().unwrap();
        Ok(state
            .workers
            .values()
            .filter(|worker| worker.last_heartbeat >= cutoff)
            .count())
    }

    async fn missing_workers(&self, ttl: Duration) -> Result<Vec<WorkerRecord>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::internal(format!("invalid ttl: {e}")))?;
        let state = self.state.lock().unwrap();
        let mut missing: Vec<WorkerRecord> = state
            .workers
            .values()
            .filter(|worker| worker.last_heartbeat < cutoff)
            .cloned()
            .collect();
        missing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(missing)
    }

    async fn upsert_schedule(
        &self,
        name: &str,
        task_name: &str,
        dispatch_interval: Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.schedules.get_mut(name) {
            Some(schedule) => {
                schedule.task_name = task_name.to_string();
                schedule.dispatch_interval = dispatch_interval;
            }
            None => {
                state.schedules.insert(
                    name.to_string(),
                    TaskScheduleRecord {
                        id: Uuid::new_v4(),
                        name: name.to_string(),
                        task_name: task_name.to_string(),
                        dispatch_interval,
                        next_dispatch: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskScheduleRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<TaskScheduleRecord> = state
            .schedules
            .values()
            .filter(|schedule| schedule.next_dispatch <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(due)
    }

    async fn mark_schedule_dispatched(
        &self,
        id: &Uuid,
        next_dispatch: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for schedule in state.schedules.values_mut() {
            if schedule.id == *id {
                schedule.next_dispatch = next_dispatch;
            }
        }
        Ok(())
    }

    async fn try_advisory_lock(
        &self,
        lock: AdvisoryLock,
    ) -> Result<Option<Box<dyn AdvisoryLockGuard>>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.advisory_locks.insert(lock) {
            Ok(Some(Box::new(InMemoryAdvisoryLockGuard {
                state: self.state.clone(),
                lock,
            })))
        } else {
            Ok(None)
        }
    }
}
