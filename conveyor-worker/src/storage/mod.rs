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

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

/// The pair of lock-service keys derived from one resource name.
///
/// Both keys are always carried together: deciding whether a resource is
/// free requires looking at its exclusive key and its shared set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceLockKeys {
    pub exclusive_key: String,
    pub shared_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LockStorageError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Minimal lock-service surface needed by the claim and resource lock
/// protocols. Backed by Redis in production and by an in-process model
/// of the same atomic semantics in tests.
#[async_trait]
pub trait LockStorage: Send + Sync {
    /// SET-if-absent with optional TTL. Returns whether the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, LockStorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LockStorageError>;

    /// Unconditional delete.
    async fn delete(&self, key: &str) -> Result<(), LockStorageError>;

    /// Deletes `key` only while it still holds `expected`. Atomic on the
    /// server. Returns whether the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str)
        -> Result<bool, LockStorageError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, LockStorageError>;

    async fn set_size(&self, key: &str) -> Result<usize, LockStorageError>;

    /// The atomic all-or-nothing acquisition step.
    ///
    /// Checks every exclusive entry for an existing exclusive holder or a
    /// non-empty shared set, and every shared entry for an exclusive
    /// holder; only when all checks pass are all keys written, in a single
    /// atomic unit. Returns the blocked exclusive key names (empty on
    /// success). Callers pass entries sorted by resource name.
    async fn acquire_resource_locks(
        &self,
        owner: &str,
        exclusive: &[ResourceLockKeys],
        shared: &[ResourceLockKeys],
    ) -> Result<Vec<String>, LockStorageError>;

    /// Atomic release: exclusive keys are deleted only while owned by
    /// `owner`; `owner` is removed from each shared set and emptied sets
    /// are deleted, without a window for a concurrent SADD to be lost.
    async fn release_resource_locks(
        &self,
        owner: &str,
        exclusive: &[ResourceLockKeys],
        shared: &[ResourceLockKeys],
    ) -> Result<(), LockStorageError>;

    /// Non-blocking key scan; `pattern` supports a single `*` wildcard.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LockStorageError>;
}
