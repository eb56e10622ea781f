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
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::WorkerServiceConfig;
use crate::executor::{execute_task, TaskOutcome, TaskRegistry};
use crate::locks::{AcquireOutcome, HeldLocks, TaskLocks};
use crate::metrics;
use crate::model::{unmatched_versions, TaskId, TaskRecord, VersionMap};
use crate::signals::{to_chrono, ShutdownSignal};
use crate::storage::LockStorage;
use crate::store::TaskStore;
use crate::supervisor::TaskChild;

/// Stable per-process worker identity.
pub fn worker_name() -> String {
    format!(
        "{}@{}",
        std::process::id(),
        gethostname::gethostname().to_string_lossy()
    )
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Signal { channel_closed: bool },
    Timeout,
}

/// A worker process competing with its peers for waiting tasks.
///
/// One logical control loop; the only concurrency inside the process is
/// the signal listener and the forked task child. Parallelism comes from
/// running many workers.
pub struct Worker {
    pub(crate) name: String,
    pub(crate) versions: VersionMap,
    pub(crate) config: WorkerServiceConfig,
    pub(crate) task_store: Arc<dyn TaskStore>,
    pub(crate) locks: TaskLocks,
    registry: Arc<TaskRegistry>,

    shutdown: watch::Receiver<ShutdownSignal>,
    shutdown_channel_closed: bool,
    applied_signal: ShutdownSignal,
    pub(crate) shutdown_requested: bool,
    /// `None` means wait for the in-flight task indefinitely.
    grace_deadline: Option<DateTime<Utc>>,

    pub(crate) last_heartbeat: DateTime<Utc>,
    pub(crate) ignored_task_ids: HashSet<TaskId>,
    pub(crate) ignored_task_countdown: u32,
    pub(crate) worker_cleanup_countdown: u32,
    pub(crate) metric_heartbeat_countdown: u32,
    pub(crate) num_workers: usize,

    working_dir: PathBuf,
}

impl Worker {
    /// Registers the worker in the task store and prepares its working
    /// directory. Registration failure is fatal for the process.
    pub async fn new(
        name: String,
        config: WorkerServiceConfig,
        task_store: Arc<dyn TaskStore>,
        lock_storage: Arc<dyn LockStorage>,
        registry: Arc<TaskRegistry>,
        shutdown: watch::Receiver<ShutdownSignal>,
    ) -> anyhow::Result<Worker> {
        let versions = registry.versions().clone();

        task_store
            .upsert_worker(&name, &versions)
            .await
            .with_context(|| format!("failed to register worker {name}"))?;

        let working_dir = config.working_dir.join(&name);
        std::fs::create_dir_all(&working_dir)
            .with_context(|| format!("failed to create working directory {working_dir:?}"))?;

        // Random initial countdown staggers the cleanup sweeps of
        // workers started together.
        let cleanup_interval = config.worker_cleanup_interval.max(1);
        let worker_cleanup_countdown =
            rand::rng().random_range((cleanup_interval / 10).max(1)..=cleanup_interval);

        info!("Worker {name} registered");

        Ok(Worker {
            name,
            versions,
            ignored_task_countdown: config.ignored_tasks_cleanup_interval.max(1),
            metric_heartbeat_countdown: config.metric_heartbeat_interval.max(1),
            worker_cleanup_countdown,
            config,
            task_store,
            locks: TaskLocks::new(lock_storage),
            registry,
            shutdown,
            shutdown_channel_closed: false,
            applied_signal: ShutdownSignal::None,
            shutdown_requested: false,
            grace_deadline: None,
            last_heartbeat: Utc::now(),
            ignored_task_ids: HashSet::new(),
            num_workers: 1,
            working_dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ignored_task_ids(&self) -> &HashSet<TaskId> {
        &self.ignored_task_ids
    }

    /// Main worker loop. In burst mode tasks are processed until the
    /// queue is empty and the worker exits without idle sleeping.
    pub async fn run(&mut self, burst: bool) -> anyhow::Result<()> {
        info!(
            "Worker {} started{}",
            self.name,
            if burst { " in burst mode" } else { "" }
        );

        if burst {
            self.handle_tasks().await;
        } else {
            loop {
                self.refresh_shutdown();
                if self.shutdown_requested {
                    break;
                }
                self.handle_tasks().await;
                self.refresh_shutdown();
                if self.shutdown_requested {
                    break;
                }
                self.sleep().await;
            }
        }

        self.shutdown().await
    }

    /// Picks and supervises tasks until no more are claimable.
    pub async fn handle_tasks(&mut self) {
        loop {
            self.refresh_shutdown();
            if self.shutdown_requested {
                return;
            }

            let Some((task, held)) = self.fetch_task().await else {
                return;
            };

            let unmatched = unmatched_versions(&task.versions, &self.versions);
            if !unmatched.is_empty() {
                info!(
                    "Incompatible versions to execute task {} in domain: {} by worker {}: {}",
                    task.id,
                    task.domain_name,
                    self.name,
                    unmatched.join(",")
                );
                self.ignored_task_ids.insert(task.id);
                self.release_task_locks(&task.id, &held).await;
                return;
            }

            if task.immediate {
                self.supervise_immediate_task(&task).await;
            } else {
                self.supervise_task(&task).await;
            }
            self.release_task_locks(&task.id, &held).await;
        }
    }

    /// One pass over the waiting batch: claim first (one cheap round
    /// trip), then the all-or-nothing resource acquisition. Resources
    /// seen blocked in this pass short-circuit every later task that
    /// needs them, without further lock service round trips.
    async fn fetch_task(&mut self) -> Option<(TaskRecord, HeldLocks)> {
        let waiting = match self
            .task_store
            .waiting_tasks(self.config.fetch_task_limit, &self.ignored_task_ids)
            .await
        {
            Ok(tasks) => tasks,
            Err(error) => {
                warn!("Failed to query waiting tasks: {error}");
                return None;
            }
        };

        let mut blocked_resources: HashSet<String> = HashSet::new();

        for task in waiting {
            let resources = task.resources();

            if let Some(blocked) = resources
                .iter_all()
                .find(|resource| blocked_resources.contains(*resource))
            {
                debug!("Task {} skipped: needs blocked resource {blocked}", task.id);
                continue;
            }

            match self.locks.claim(&task.id, &self.name).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Worker {} skipped task {} - another worker holds the task lock",
                        self.name, task.id
                    );
                    continue;
                }
                Err(error) => {
                    debug!("Claim attempt for task {} failed: {error}", task.id);
                    continue;
                }
            }

            info!(
                "Worker {} acquired task lock for task {} in domain: {}",
                self.name, task.id, task.domain_name
            );

            match self.locks.acquire(&self.name, &resources).await {
                Ok(AcquireOutcome::Acquired(held)) => {
                    info!(
                        "Worker {} acquired all resources for task {} in domain: {}",
                        self.name, task.id, task.domain_name
                    );
                    return Some((task, held));
                }
                Ok(AcquireOutcome::Blocked(blockers)) => {
                    self.drop_claim(&task.id).await;
                    debug!(
                        "Worker {} failed to acquire resource locks for task {} (blocked: {blockers:?}), released task lock",
                        self.name, task.id
                    );
                    blocked_resources.extend(blockers);
                }
                Err(error) => {
                    debug!(
                        "Resource lock acquisition for task {} failed: {error}",
                        task.id
                    );
                    self.drop_claim(&task.id).await;
                }
            }
        }

        None
    }

    async fn drop_claim(&self, task_id: &TaskId) {
        if let Err(error) = self.locks.release_claim(task_id, &self.name).await {
            warn!("Failed to release task lock for {task_id}: {error}");
        }
    }

    async fn release_task_locks(&self, task_id: &TaskId, held: &HeldLocks) {
        if let Err(error) = self.locks.release(&self.name, held).await {
            warn!("Failed to release resource locks for task {task_id}: {error}");
        }
        self.drop_claim(task_id).await;
    }

    /// Runs an immediate task inline, without forking.
    async fn supervise_immediate_task(&mut self, task: &TaskRecord) {
        info!(
            "WORKER IMMEDIATE EXECUTION: Worker {} executing immediate task {} in domain: {}",
            self.name, task.id, task.domain_name
        );
        let started = Instant::now();
        match execute_task(
            self.task_store.as_ref(),
            &self.registry,
            &task.id,
            &self.working_dir,
            std::future::pending(),
        )
        .await
        {
            Ok(outcome) => {
                metrics::record_task_execution_time(started.elapsed());
                metrics::record_task_process_exit(outcome == TaskOutcome::Completed);
            }
            Err(error) => {
                metrics::record_task_process_exit(false);
                warn!("Failed to execute immediate task {}: {error}", task.id);
            }
        }
    }

    /// Forks the task child and supervises it.
    async fn supervise_task(&mut self, task: &TaskRecord) {
        info!(
            "WORKER DEFERRED EXECUTION: Worker {} executing deferred task {} in domain: {}",
            self.name, task.id, task.domain_name
        );

        let task_dir = match tempfile::Builder::new()
            .prefix("task-")
            .tempdir_in(&self.working_dir)
        {
            Ok(dir) => dir,
            Err(error) => {
                warn!(
                    "Failed to create working directory for task {}: {error}",
                    task.id
                );
                return;
            }
        };

        let mut child = match TaskChild::spawn(&task.id, task_dir.path()) {
            Ok(child) => child,
            Err(error) => {
                warn!("Failed to spawn task process for task {}: {error}", task.id);
                return;
            }
        };

        self.supervise_child(&mut child, task).await;
    }

    /// Multiplexed wait on {child exit, shutdown signal, heartbeat
    /// deadline}. Every wake heartbeats; shutdown requests apply the
    /// grace rules before the child is aborted and finally killed.
    pub async fn supervise_child(&mut self, child: &mut TaskChild, task: &TaskRecord) {
        let heartbeat_period = self.config.heartbeat_period();
        let mut abort_sent = false;

        loop {
            let wake = tokio::select! {
                status = child.wait() => Wake::Exited(status),
                result = self.shutdown.changed(), if !self.shutdown_channel_closed => {
                    Wake::Signal { channel_closed: result.is_err() }
                }
                _ = tokio::time::sleep(heartbeat_period) => Wake::Timeout,
            };

            if let Wake::Signal {
                channel_closed: true,
            } = wake
            {
                self.shutdown_channel_closed = true;
            }

            self.refresh_shutdown();
            self.beat().await;

            if let Wake::Exited(status) = wake {
                metrics::record_task_execution_time(child.elapsed());
                match status {
                    Ok(status) if status.success() => {
                        metrics::record_task_process_exit(true);
                    }
                    Ok(status) => {
                        metrics::record_task_process_exit(false);
                        warn!(
                            "Task process for {} exited with non zero status: {status}",
                            task.id
                        );
                    }
                    Err(error) => {
                        metrics::record_task_process_exit(false);
                        warn!("Failed to wait for task process for {}: {error}", task.id);
                    }
                }
                return;
            }

            if self.shutdown_requested {
                match self.grace_deadline {
                    None => {
                        info!(
                            "Worker shutdown requested, waiting for task {} in domain: {} to finish",
                            task.id, task.domain_name
                        );
                    }
                    Some(deadline) if Utc::now() < deadline => {
                        info!(
                            "Worker shutdown requested, waiting for task {} in domain: {} until {deadline}",
                            task.id, task.domain_name
                        );
                    }
                    Some(_) => {
                        if abort_sent {
                            info!(
                                "Killing task process for {} after unanswered abort hint",
                                task.id
                            );
                            child.kill().await;
                        } else {
                            info!(
                                "Aborting current task {} in domain: {} due to worker shutdown",
                                task.id, task.domain_name
                            );
                            child.abort().await;
                            abort_sent = true;
                        }
                        self.grace_deadline =
                            Some(Utc::now() + to_chrono(self.config.task_kill_interval));
                    }
                }
            }
        }
    }

    /// Idle pause scaled by fleet size: `N_workers x 10ms` plus jitter,
    /// so pollers spread out instead of hammering the store in lock
    /// step. Always heartbeats before sleeping.
    async fn sleep(&mut self) {
        let base_ms = self.num_workers as f64 * 10.0;
        let jitter_ms = rand::rng().random_range(0.5..1.5);
        let sleep_for = Duration::from_secs_f64((base_ms + jitter_ms) / 1000.0);

        debug!(
            "Worker {} sleeping for {sleep_for:?} (workers={})",
            self.name, self.num_workers
        );

        self.beat().await;
        tokio::time::sleep(sleep_for).await;
    }

    pub(crate) fn refresh_shutdown(&mut self) {
        if self.shutdown_channel_closed {
            return;
        }
        let current = *self.shutdown.borrow_and_update();
        if current == self.applied_signal {
            return;
        }
        self.applied_signal = current;
        match current {
            ShutdownSignal::None => {}
            ShutdownSignal::Graceful => {
                self.shutdown_requested = true;
                self.grace_deadline = None;
            }
            ShutdownSignal::Forced { grace_deadline } => {
                self.shutdown_requested = true;
                self.grace_deadline = Some(grace_deadline);
            }
        }
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Err(error) = self.task_store.delete_worker(&self.name).await {
            warn!(
                "Failed to delete the registry row of worker {}: {error}",
                self.name
            );
        }
        info!("Worker {} was shut down", self.name);
        Ok(())
    }
}
