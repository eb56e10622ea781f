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

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::model::{TaskId, TaskResources};
use crate::storage::{LockStorage, LockStorageError, ResourceLockKeys};

pub const EXCLUSIVE_KEY_PREFIX: &str = "resource-exclusive:";
pub const SHARED_KEY_PREFIX: &str = "resource-shared:";
pub const TASK_CLAIM_KEY_PREFIX: &str = "task:";

/// Safety net for claims of crashed workers that peer cleanup misses.
pub const TASK_CLAIM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Resource names are arbitrarily long; hashing keeps the derived keys
/// within the lock service key limits.
fn resource_hash(resource: &str) -> String {
    blake3::hash(resource.as_bytes()).to_hex().to_string()
}

pub fn exclusive_key(resource: &str) -> String {
    format!("{EXCLUSIVE_KEY_PREFIX}{}", resource_hash(resource))
}

pub fn shared_key(resource: &str) -> String {
    format!("{SHARED_KEY_PREFIX}{}", resource_hash(resource))
}

pub fn claim_key(task_id: &TaskId) -> String {
    format!("{TASK_CLAIM_KEY_PREFIX}{task_id}")
}

fn lock_keys(resource: &str) -> ResourceLockKeys {
    ResourceLockKeys {
        exclusive_key: exclusive_key(resource),
        shared_key: shared_key(resource),
    }
}

/// The resource locks held for one task: resource names, sorted and
/// deduplicated, as acquired.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeldLocks {
    pub exclusive: Vec<String>,
    pub shared: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AcquireOutcome {
    Acquired(HeldLocks),
    /// The resource names that were found locked; nothing was mutated.
    Blocked(Vec<String>),
}

/// Resource lock and task claim protocols over the lock service.
#[derive(Clone)]
pub struct TaskLocks {
    storage: Arc<dyn LockStorage>,
}

impl TaskLocks {
    pub fn new(storage: Arc<dyn LockStorage>) -> Self {
        Self { storage }
    }

    /// Acquires every lock a task needs, or none. Resources are sorted
    /// before the attempt so concurrent workers probe conflicting sets
    /// in the same order and cannot deadlock each other.
    pub async fn acquire(
        &self,
        owner: &str,
        resources: &TaskResources,
    ) -> Result<AcquireOutcome, LockStorageError> {
        if resources.is_empty() {
            return Ok(AcquireOutcome::Acquired(HeldLocks::default()));
        }

        let mut exclusive = resources.exclusive.clone();
        exclusive.sort();
        exclusive.dedup();
        let mut shared = resources.shared.clone();
        shared.sort();
        shared.dedup();

        let exclusive_keys: Vec<ResourceLockKeys> =
            exclusive.iter().map(|resource| lock_keys(resource)).collect();
        let shared_keys: Vec<ResourceLockKeys> =
            shared.iter().map(|resource| lock_keys(resource)).collect();

        let resource_of_key: HashMap<String, String> = exclusive
            .iter()
            .chain(shared.iter())
            .map(|resource| (exclusive_key(resource), resource.clone()))
            .collect();

        let blocked_keys = self
            .storage
            .acquire_resource_locks(owner, &exclusive_keys, &shared_keys)
            .await?;

        if blocked_keys.is_empty() {
            Ok(AcquireOutcome::Acquired(HeldLocks { exclusive, shared }))
        } else {
            let blocked = blocked_keys
                .iter()
                .map(|key| {
                    resource_of_key
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| key.clone())
                })
                .collect();
            Ok(AcquireOutcome::Blocked(blocked))
        }
    }

    pub async fn release(&self, owner: &str, held: &HeldLocks) -> Result<(), LockStorageError> {
        let exclusive_keys: Vec<ResourceLockKeys> =
            held.exclusive.iter().map(|resource| lock_keys(resource)).collect();
        let shared_keys: Vec<ResourceLockKeys> =
            held.shared.iter().map(|resource| lock_keys(resource)).collect();
        self.storage
            .release_resource_locks(owner, &exclusive_keys, &shared_keys)
            .await
    }

    /// Releases exclusive locks on behalf of another (missing) worker
    /// during peer cleanup. Only locks still owned by that worker are
    /// touched.
    pub async fn release_for_owner(
        &self,
        owner: &str,
        exclusive_resources: &[String],
    ) -> Result<(), LockStorageError> {
        let exclusive_keys: Vec<ResourceLockKeys> = exclusive_resources
            .iter()
            .map(|resource| lock_keys(resource))
            .collect();
        self.storage
            .release_resource_locks(owner, &exclusive_keys, &[])
            .await
    }

    /// Single-writer claim on a task. One round trip; the cheap first
    /// gate before the resource lock script runs.
    pub async fn claim(&self, task_id: &TaskId, owner: &str) -> Result<bool, LockStorageError> {
        self.storage
            .set_if_absent(&claim_key(task_id), owner, Some(TASK_CLAIM_TTL))
            .await
    }

    pub async fn release_claim(
        &self,
        task_id: &TaskId,
        owner: &str,
    ) -> Result<bool, LockStorageError> {
        self.storage
            .compare_and_delete(&claim_key(task_id), owner)
            .await
    }

    /// Unconditional claim removal, used by peer cleanup after the
    /// owner was verified to be a missing worker.
    pub async fn delete_claim(&self, task_id: &TaskId) -> Result<(), LockStorageError> {
        self.storage.delete(&claim_key(task_id)).await
    }

    /// Task ids whose claim is held by `owner`, discovered by scanning
    /// the claim keyspace.
    pub async fn claims_owned_by(&self, owner: &str) -> Result<Vec<TaskId>, LockStorageError> {
        let mut claimed = Vec::new();
        for key in self.storage.scan_keys("task:*").await? {
            let Some(raw_id) = key.strip_prefix(TASK_CLAIM_KEY_PREFIX) else {
                continue;
            };
            let Ok(task_id) = TaskId::from_str(raw_id) else {
                debug!("Ignoring malformed claim key {key}");
                continue;
            };
            if self.storage.get(&key).await?.as_deref() == Some(owner) {
                claimed.push(task_id);
            }
        }
        Ok(claimed)
    }
}
