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

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resource entries carrying this prefix request shared access; all
/// others are exclusive.
pub const SHARED_RESOURCE_PREFIX: &str = "shared:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskId(Uuid::parse_str(s)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
    Skipped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
            TaskState::Skipped => "skipped",
        }
    }

    /// Final states are never left again; a task in one of them must not
    /// be failed or restarted by housekeeping.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Skipped
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskState::Waiting),
            "running" => Ok(TaskState::Running),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "canceled" => Ok(TaskState::Canceled),
            "skipped" => Ok(TaskState::Skipped),
            other => Err(format!("invalid task state: {other}")),
        }
    }
}

/// A task's reserved resources split by access mode, with the `shared:`
/// prefix stripped from the shared entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskResources {
    pub exclusive: Vec<String>,
    pub shared: Vec<String>,
}

impl TaskResources {
    pub fn parse(reserved_resources: &[String]) -> TaskResources {
        let mut resources = TaskResources::default();
        for record in reserved_resources {
            match record.strip_prefix(SHARED_RESOURCE_PREFIX) {
                Some(shared) => resources.shared.push(shared.to_string()),
                None => resources.exclusive.push(record.to_string()),
            }
        }
        resources
    }

    pub fn is_empty(&self) -> bool {
        self.exclusive.is_empty() && self.shared.is_empty()
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &String> {
        self.exclusive.iter().chain(self.shared.iter())
    }
}

pub type VersionMap = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reserved_resources: Vec<String>,
    pub immediate: bool,
    pub versions: VersionMap,
    pub domain_name: String,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn resources(&self) -> TaskResources {
        TaskResources::parse(&self.reserved_resources)
    }
}

#[derive(Clone, Debug, Default)]
pub struct NewTask {
    pub name: String,
    pub reserved_resources: Vec<String>,
    pub immediate: bool,
    pub versions: VersionMap,
    pub domain_name: String,
}

impl NewTask {
    pub fn named(name: impl Into<String>) -> NewTask {
        NewTask {
            name: name.into(),
            domain_name: "default".to_string(),
            ..NewTask::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerRecord {
    pub name: String,
    pub app_type: String,
    pub last_heartbeat: DateTime<Utc>,
    pub versions: VersionMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskScheduleRecord {
    pub id: Uuid,
    pub name: String,
    pub task_name: String,
    pub dispatch_interval: Duration,
    pub next_dispatch: DateTime<Utc>,
}

/// Version requirements the worker does not satisfy, as diagnostic
/// strings. Empty means the task is compatible. A requirement that does
/// not parse as semver counts as unsatisfied.
pub fn unmatched_versions(required: &VersionMap, provided: &VersionMap) -> Vec<String> {
    required
        .iter()
        .filter(|(module, minimum)| {
            match (
                provided.get(*module).map(|v| semver::Version::parse(v)),
                semver::Version::parse(minimum),
            ) {
                (Some(Ok(have)), Ok(need)) => have < need,
                _ => true,
            }
        })
        .map(|(module, minimum)| {
            format!(
                "task: {module}>={minimum} worker: {}",
                provided
                    .get(module)
                    .map(|v| v.as_str())
                    .unwrap_or("missing")
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;

    fn versions(pairs: &[(&str, &str)]) -> VersionMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resources_split_by_shared_prefix() {
        let records = vec![
            "repositories/1".to_string(),
            "shared:remotes/2".to_string(),
            "shared:remotes/3".to_string(),
        ];
        let resources = TaskResources::parse(&records);
        check!(resources.exclusive == vec!["repositories/1".to_string()]);
        check!(resources.shared == vec!["remotes/2".to_string(), "remotes/3".to_string()]);
        check!(!resources.is_empty());
        check!(TaskResources::parse(&[]).is_empty());
    }

    #[test]
    fn final_states() {
        check!(!TaskState::Waiting.is_final());
        check!(!TaskState::Running.is_final());
        check!(TaskState::Completed.is_final());
        check!(TaskState::Failed.is_final());
        check!(TaskState::Canceled.is_final());
        check!(TaskState::Skipped.is_final());
    }

    #[test]
    fn task_state_round_trips_through_str() {
        for state in [
            TaskState::Waiting,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
            TaskState::Skipped,
        ] {
            check!(state.as_str().parse() == Ok(state));
        }
        check!("borked".parse::<TaskState>().is_err());
    }

    #[test]
    fn version_compatibility() {
        let worker = versions(&[("core", "3.50.1"), ("scan", "1.2.0")]);

        check!(unmatched_versions(&versions(&[("core", "3.49.0")]), &worker).is_empty());
        check!(unmatched_versions(&versions(&[("core", "3.50.1")]), &worker).is_empty());

        let too_new = unmatched_versions(&versions(&[("core", "3.51.0")]), &worker);
        check!(too_new == vec!["task: core>=3.51.0 worker: 3.50.1".to_string()]);

        let missing = unmatched_versions(&versions(&[("other", "1.0.0")]), &worker);
        check!(missing == vec!["task: other>=1.0.0 worker: missing".to_string()]);

        let garbage = unmatched_versions(&versions(&[("core", "not-a-version")]), &worker);
        check!(garbage.len() == 1);
    }
}
