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

use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::model::TaskId;

/// A forked task execution process.
///
/// The child is this worker binary re-invoked with the `execute-task`
/// subcommand; it reports nothing back but its exit status, all task
/// state lands on the task row.
pub struct TaskChild {
    child: Child,
    task_id: TaskId,
    started_at: Instant,
}

impl TaskChild {
    pub fn spawn(task_id: &TaskId, working_dir: &Path) -> anyhow::Result<TaskChild> {
        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command
            .arg("execute-task")
            .arg("--task-id")
            .arg(task_id.to_string())
            .arg("--working-dir")
            .arg(working_dir);
        Self::spawn_with(command, *task_id)
    }

    pub fn spawn_with(mut command: Command, task_id: TaskId) -> anyhow::Result<TaskChild> {
        command.kill_on_drop(true);
        let child = command.spawn()?;
        debug!(
            "Spawned task process {} for task {task_id}",
            child.id().unwrap_or(0)
        );
        Ok(TaskChild {
            child,
            task_id,
            started_at: Instant::now(),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancel safe; losing the race in a `select!` leaves the child
    /// running and the wait can be retried.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Delivers the cooperative abort hint (SIGUSR1) to the task
    /// process tree. The child decides how to wind down; nothing is
    /// torn down here.
    pub async fn abort(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let config = kill_tree::Config {
            signal: "SIGUSR1".to_string(),
            ..kill_tree::Config::default()
        };
        match kill_tree::tokio::kill_tree_with_config(pid, &config).await {
            Ok(_) => debug!("Sent abort hint to task process {pid}"),
            Err(error) => warn!("Failed to send abort hint to task process {pid}: {error}"),
        }
    }

    /// Hard kill, the escalation once the abort hint went unanswered.
    pub async fn kill(&mut self) {
        let task_id = self.task_id;
        if let Err(error) = self.child.kill().await {
            warn!("Failed to kill task process for task {task_id}: {error}");
        }
    }
}
