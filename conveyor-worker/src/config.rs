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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conveyor_common::config::{
    ConfigExample, ConfigLoader, DbPostgresConfig, HasConfigExamples, RedisConfig,
};
use conveyor_common::tracing::TracingConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerServiceConfig {
    pub tracing: TracingConfig,
    pub db: DbPostgresConfig,
    pub lock_store: RedisConfig,
    pub metrics: MetricsConfig,

    /// A worker whose heartbeat is older than this is considered
    /// missing; the heartbeat period is a third of it.
    #[serde(with = "humantime_serde")]
    pub worker_ttl: Duration,
    /// How long an in-flight task may keep running after a forced
    /// shutdown request before it is aborted.
    #[serde(with = "humantime_serde")]
    pub task_grace_interval: Duration,
    /// Delay between abort escalations against the task process.
    #[serde(with = "humantime_serde")]
    pub task_kill_interval: Duration,

    pub fetch_task_limit: usize,
    /// Heartbeats between peer-cleanup sweeps.
    pub worker_cleanup_interval: u32,
    /// Heartbeats between prunings of the ignored-task list.
    pub ignored_tasks_cleanup_interval: u32,
    /// Heartbeats between queue-depth gauge emissions.
    pub metric_heartbeat_interval: u32,

    pub working_dir: PathBuf,
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

/// A periodic task seeded into the schedule table at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub task_name: String,
    #[serde(with = "humantime_serde")]
    pub dispatch_interval: Duration,
}

impl WorkerServiceConfig {
    pub fn heartbeat_period(&self) -> Duration {
        self.worker_ttl / 3
    }
}

impl Default for WorkerServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            db: DbPostgresConfig::default(),
            lock_store: RedisConfig::default(),
            metrics: MetricsConfig::default(),
            worker_ttl: Duration::from_secs(30),
            task_grace_interval: Duration::from_secs(600),
            task_kill_interval: Duration::from_secs(1),
            fetch_task_limit: 20,
            worker_cleanup_interval: 50,
            ignored_tasks_cleanup_interval: 100,
            metric_heartbeat_interval: 3,
            working_dir: PathBuf::from("workdir"),
            schedules: vec![],
        }
    }
}

impl HasConfigExamples<WorkerServiceConfig> for WorkerServiceConfig {
    fn examples() -> Vec<ConfigExample<WorkerServiceConfig>> {
        vec![(
            "with-metrics-and-schedule",
            WorkerServiceConfig {
                metrics: MetricsConfig { enabled: true },
                schedules: vec![ScheduleConfig {
                    name: "periodic-noop".to_string(),
                    task_name: "noop".to_string(),
                    dispatch_interval: Duration::from_secs(3600),
                }],
                ..WorkerServiceConfig::default()
            },
        )]
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerServiceConfig> {
    ConfigLoader::new_with_examples(Path::new("config/worker.toml"))
}
