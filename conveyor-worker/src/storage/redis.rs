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

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::{AsyncCommands, Script};

use conveyor_common::redis::RedisPool;

use crate::storage::{LockStorage, LockStorageError, ResourceLockKeys};

lazy_static! {
    /// KEYS: for each resource an (exclusive_key, shared_key) pair,
    /// exclusive resources first. ARGV: owner, number of exclusive pairs.
    /// Evaluated as one unit under the server's single-threaded execution
    /// guarantee, so either every lock is written or none is.
    static ref ACQUIRE_SCRIPT: Script = Script::new(
        r#"
        local owner = ARGV[1]
        local num_exclusive = tonumber(ARGV[2])
        local total = #KEYS / 2
        for i = 1, num_exclusive do
            if redis.call('EXISTS', KEYS[2 * i - 1]) == 1
                or redis.call('SCARD', KEYS[2 * i]) > 0 then
                return { KEYS[2 * i - 1] }
            end
        end
        for i = num_exclusive + 1, total do
            if redis.call('EXISTS', KEYS[2 * i - 1]) == 1 then
                return { KEYS[2 * i - 1] }
            end
        end
        for i = 1, num_exclusive do
            redis.call('SET', KEYS[2 * i - 1], owner)
        end
        for i = num_exclusive + 1, total do
            redis.call('SADD', KEYS[2 * i], owner)
        end
        return {}
        "#,
    );

    /// KEYS: exclusive keys first, then shared keys. ARGV: owner, number
    /// of exclusive keys. The SREM/DEL pair runs atomically so a
    /// concurrent SADD cannot end up deleted with the emptied set.
    static ref RELEASE_SCRIPT: Script = Script::new(
        r#"
        local owner = ARGV[1]
        local num_exclusive = tonumber(ARGV[2])
        for i = 1, num_exclusive do
            if redis.call('GET', KEYS[i]) == owner then
                redis.call('DEL', KEYS[i])
            end
        end
        for i = num_exclusive + 1, #KEYS do
            redis.call('SREM', KEYS[i], owner)
            if redis.call('SCARD', KEYS[i]) == 0 then
                redis.call('DEL', KEYS[i])
            end
        end
        return 1
        "#,
    );

    static ref COMPARE_AND_DELETE_SCRIPT: Script = Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    );
}

pub struct RedisLockStorage {
    pool: RedisPool,
}

impl RedisLockStorage {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStorage for RedisLockStorage {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, LockStorageError> {
        let mut conn = self.pool.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.pool.prefixed(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs());
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStorageError> {
        let mut conn = self.pool.connection();
        let value: Option<String> = conn.get(self.pool.prefixed(key)).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), LockStorageError> {
        let mut conn = self.pool.connection();
        let _: () = conn.del(self.pool.prefixed(key)).await?;
        Ok(())
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, LockStorageError> {
        let mut conn = self.pool.connection();
        let deleted: i32 = COMPARE_AND_DELETE_SCRIPT
            .key(self.pool.prefixed(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, LockStorageError> {
        let mut conn = self.pool.connection();
        let mut members: Vec<String> = conn.smembers(self.pool.prefixed(key)).await?;
        members.sort();
        Ok(members)
    }

    async fn set_size(&self, key: &str) -> Result<usize, LockStorageError> {
        let mut conn = self.pool.connection();
        let size: usize = conn.scard(self.pool.prefixed(key)).await?;
        Ok(size)
    }

    async fn acquire_resource_locks(
        &self,
        owner: &str,
        exclusive: &[ResourceLockKeys],
        shared: &[ResourceLockKeys],
    ) -> Result<Vec<String>, LockStorageError> {
        let mut conn = self.pool.connection();
        let mut invocation = ACQUIRE_SCRIPT.prepare_invoke();
        for keys in exclusive.iter().chain(shared.iter()) {
            invocation
                .key(self.pool.prefixed(&keys.exclusive_key))
                .key(self.pool.prefixed(&keys.shared_key));
        }
        invocation.arg(owner).arg(exclusive.len());
        let blocked: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(blocked
            .iter()
            .map(|key| self.pool.strip_prefix(key).to_string())
            .collect())
    }

    async fn release_resource_locks(
        &self,
        owner: &str,
        exclusive: &[ResourceLockKeys],
        shared: &[ResourceLockKeys],
    ) -> Result<(), LockStorageError> {
        if exclusive.is_empty() && shared.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.connection();
        let mut invocation = RELEASE_SCRIPT.prepare_invoke();
        for keys in exclusive {
            invocation.key(self.pool.prefixed(&keys.exclusive_key));
        }
        for keys in shared {
            invocation.key(self.pool.prefixed(&keys.shared_key));
        }
        invocation.arg(owner).arg(exclusive.len());
        let _: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LockStorageError> {
        let mut conn = self.pool.connection();
        let mut keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> =
                conn.scan_match(self.pool.prefixed(pattern)).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(self.pool.strip_prefix(&key).to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
