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
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::model::{NewTask, TaskId};
use crate::signals::to_chrono;
use crate::store::{AdvisoryLock, AdvisoryLockGuard};
use crate::worker::Worker;

/// Age a task must reach before it counts into the queue-depth gauge,
/// filtering out tasks that are just passing through.
const METRIC_TASK_AGE: Duration = Duration::from_secs(5);

impl Worker {
    /// Periodic maintenance, invoked on every supervisor wake and before
    /// each idle sleep. Performs its work at most once per heartbeat
    /// period; every failure degrades to skipping one cycle.
    pub async fn beat(&mut self) {
        let now = Utc::now();
        if now - self.last_heartbeat < to_chrono(self.config.heartbeat_period()) {
            return;
        }
        self.last_heartbeat = now;

        self.handle_worker_heartbeat().await;

        self.ignored_task_countdown = self.ignored_task_countdown.saturating_sub(1);
        if self.ignored_task_countdown == 0 {
            self.ignored_task_countdown = self.config.ignored_tasks_cleanup_interval.max(1);
            if !self.ignored_task_ids.is_empty() {
                self.cleanup_ignored_tasks().await;
            }
        }

        self.worker_cleanup_countdown = self.worker_cleanup_countdown.saturating_sub(1);
        if self.worker_cleanup_countdown == 0 {
            self.worker_cleanup_countdown = self.config.worker_cleanup_interval.max(1);
            self.app_worker_cleanup().await;
        }

        self.dispatch_scheduled_tasks().await;

        if self.config.metrics.enabled {
            self.metric_heartbeat_countdown = self.metric_heartbeat_countdown.saturating_sub(1);
            if self.metric_heartbeat_countdown == 0 {
                self.metric_heartbeat_countdown = self.config.metric_heartbeat_interval.max(1);
                self.record_waiting_tasks_metric().await;
            }
        }

        self.refresh_worker_count().await;
    }

    /// Losing the registry row (or the database) means this worker must
    /// not keep competing for tasks; it shuts down instead.
    async fn handle_worker_heartbeat(&mut self) {
        match self.task_store.touch_worker(&self.name).await {
            Ok(true) => {
                debug!("Worker heartbeat from '{}'", self.name);
            }
            Ok(false) => {
                error!("The registry row of worker {} is gone", self.name);
                self.shutdown_requested = true;
            }
            Err(db_error) => {
                error!(
                    "Updating the heartbeat of worker {} failed: {db_error}",
                    self.name
                );
                self.shutdown_requested = true;
            }
        }
    }

    /// Drops ignored task ids whose tasks reached a final state, so
    /// re-enqueued incompatible work is not shadowed forever.
    async fn cleanup_ignored_tasks(&mut self) {
        let ids: Vec<TaskId> = self.ignored_task_ids.iter().copied().collect();
        match self.task_store.incomplete_tasks_of(&ids).await {
            Ok(incomplete) => {
                let incomplete: HashSet<TaskId> = incomplete.into_iter().collect();
                self.ignored_task_ids.retain(|id| incomplete.contains(id));
            }
            Err(db_error) => {
                warn!("Failed to prune the ignored task list: {db_error}");
            }
        }
    }

    /// Removes registry rows of missing processes, reclaiming their
    /// claims and resource locks and failing their abandoned tasks.
    /// Coordinated by the worker-cleanup advisory lock so a single
    /// worker sweeps per tick.
    async fn app_worker_cleanup(&self) {
        let Some(guard) = self.advisory_guard(AdvisoryLock::WorkerCleanup).await else {
            return;
        };

        match self.task_store.missing_workers(self.config.worker_ttl).await {
            Ok(missing) => {
                for missing_worker in &missing {
                    warn!(
                        "Cleanup record of missing {} process {}.",
                        missing_worker.app_type, missing_worker.name
                    );
                    if let Err(cleanup_error) =
                        self.cleanup_locks_for_worker(&missing_worker.name).await
                    {
                        error!(
                            "Error cleaning up locks for worker {}: {cleanup_error}",
                            missing_worker.name
                        );
                    }
                    if let Err(db_error) =
                        self.task_store.delete_worker(&missing_worker.name).await
                    {
                        warn!(
                            "Failed to delete the registry row of missing worker {}: {db_error}",
                            missing_worker.name
                        );
                    }
                }
            }
            Err(db_error) => {
                warn!("Failed to query missing workers: {db_error}");
            }
        }

        self.release_guard(guard).await;
    }

    /// Reclaims everything a missing worker left behind in the lock
    /// service: for each task claim it held, the task's exclusive
    /// resource locks are released under the missing worker's name, the
    /// task is failed unless already final, and the claim is deleted.
    async fn cleanup_locks_for_worker(&self, missing_worker: &str) -> anyhow::Result<()> {
        let claimed = self.locks.claims_owned_by(missing_worker).await?;
        let mut tasks_failed = 0;

        for task_id in claimed {
            match self.task_store.task(&task_id).await? {
                Some(task) => {
                    let exclusive = task.resources().exclusive;
                    if !exclusive.is_empty() {
                        self.locks
                            .release_for_owner(missing_worker, &exclusive)
                            .await?;
                        info!(
                            "Released {} resource locks for task {task_id} from missing worker {missing_worker}",
                            exclusive.len()
                        );
                    }
                    if !task.state.is_final() {
                        let diagnostic =
                            format!("Task failed because worker {missing_worker} went missing");
                        if self.task_store.set_task_failed(&task_id, &diagnostic).await? {
                            tasks_failed += 1;
                            warn!(
                                "Marked task {task_id} (state={}) as failed, was supervised by missing worker {missing_worker}",
                                task.state
                            );
                        }
                    }
                }
                None => {
                    warn!(
                        "Task {task_id} locked by missing worker {missing_worker} not found in the task store"
                    );
                }
            }
            self.locks.delete_claim(&task_id).await?;
        }

        if tasks_failed > 0 {
            info!("Cleanup for missing worker {missing_worker}: failed {tasks_failed} tasks");
        }
        Ok(())
    }

    /// Consumes due schedule rows and enqueues their tasks, under the
    /// scheduling advisory lock.
    async fn dispatch_scheduled_tasks(&self) {
        let Some(guard) = self.advisory_guard(AdvisoryLock::Scheduling).await else {
            return;
        };

        let now = Utc::now();
        match self.task_store.due_schedules(now).await {
            Ok(due) => {
                for schedule in due {
                    match self
                        .task_store
                        .insert_task(NewTask::named(&schedule.task_name))
                        .await
                    {
                        Ok(task) => {
                            info!(
                                "Dispatched schedule '{}' as task {}",
                                schedule.name, task.id
                            );
                            let next = now + to_chrono(schedule.dispatch_interval);
                            if let Err(db_error) = self
                                .task_store
                                .mark_schedule_dispatched(&schedule.id, next)
                                .await
                            {
                                warn!(
                                    "Failed to advance schedule '{}': {db_error}",
                                    schedule.name
                                );
                            }
                        }
                        Err(db_error) => {
                            warn!(
                                "Failed to dispatch schedule '{}': {db_error}",
                                schedule.name
                            );
                        }
                    }
                }
            }
            Err(db_error) => {
                warn!("Failed to query due schedules: {db_error}");
            }
        }

        self.release_guard(guard).await;
    }

    /// Queue-depth gauge: tasks waiting or running for longer than the
    /// metric age, minus the live workers that should be draining them.
    async fn record_waiting_tasks_metric(&self) {
        let Some(guard) = self.advisory_guard(AdvisoryLock::TaskMetrics).await else {
            return;
        };

        match self
            .task_store
            .count_tasks_not_final_older_than(METRIC_TASK_AGE)
            .await
        {
            Ok(task_count) => {
                let waiting_tasks = task_count - self.num_workers as i64;
                metrics::record_waiting_tasks(waiting_tasks);
                debug!(
                    "Waiting tasks metric: {waiting_tasks} ({task_count} tasks older than {METRIC_TASK_AGE:?} - {} workers)",
                    self.num_workers
                );
            }
            Err(db_error) => {
                warn!("Failed to count tasks for the queue-depth gauge: {db_error}");
            }
        }

        self.release_guard(guard).await;
    }

    /// Refreshes the cached worker count driving the idle sleep length.
    async fn refresh_worker_count(&mut self) {
        match self
            .task_store
            .online_worker_count(self.config.worker_ttl)
            .await
        {
            Ok(count) => {
                self.num_workers = count.max(1);
            }
            Err(db_error) => {
                warn!("Failed to count online workers: {db_error}");
            }
        }
    }

    async fn advisory_guard(&self, lock: AdvisoryLock) -> Option<Box<dyn AdvisoryLockGuard>> {
        match self.task_store.try_advisory_lock(lock).await {
            Ok(guard) => guard,
            Err(db_error) => {
                warn!("Failed to take the {} advisory lock: {db_error}", lock.name());
                None
            }
        }
    }

    async fn release_guard(&self, guard: Box<dyn AdvisoryLockGuard>) {
        if let Err(db_error) = guard.release().await {
            warn!("Failed to release an advisory lock: {db_error}");
        }
    }
}
