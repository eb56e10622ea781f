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
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::storage::{LockStorage, LockStorageError, ResourceLockKeys};

#[derive(Clone, Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, HashSet<String>>,
}

impl State {
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        let expired = match self.strings.get(key) {
            Some(entry) => matches!(entry.expires_at, Some(deadline) if deadline <= Instant::now()),
            None => return None,
        };
        if expired {
            self.strings.remove(key);
            None
        } else {
            self.strings.get(key)
        }
    }

    fn set_len(&self, key: &str) -> usize {
        self.sets.get(key).map(|members| members.len()).unwrap_or(0)
    }
}

/// All operations share one mutex, modelling the single-threaded
/// execution guarantee of the Redis server the production backend runs
/// its scripts under.
#[derive(Default)]
pub struct InMemoryLockStorage {
    state: Mutex<State>,
}

impl InMemoryLockStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStorage for InMemoryLockStorage {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, LockStorageError> {
        let mut state = self.state.lock().unwrap();
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStorageError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.live_string(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), LockStorageError> {
        let mut state = self.state.lock().unwrap();
        state.strings.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, LockStorageError> {
        let mut state = self.state.lock().unwrap();
        let owned = matches!(state.live_string(key), Some(entry) if entry.value == expected);
        if owned {
            state.strings.remove(key);
        }
        Ok(owned)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, LockStorageError> {
        let state = self.state.lock().unwrap();
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn set_size(&self, key: &str) -> Result<usize, LockStorageError> {
        let state = self.state.lock().unwrap();
        Ok(state.set_len(key))
    }

    async fn acquire_resource_locks(
        &self,
        owner: &str,
        exclusive: &[ResourceLockKeys],
        shared: &[ResourceLockKeys],
    ) -> Result<Vec<String>, LockStorageError> {
        let mut state = self.state.lock().unwrap();

        for keys in exclusive {
            if state.live_string(&keys.exclusive_key).is_some()
                || state.set_len(&keys.shared_key) > 0
            {
                return Ok(vec![keys.exclusive_key.clone()]);
            }
        }
        for keys in shared {
            if state.live_string(&keys.exclusive_key).is_some() {
                return Ok(vec![keys.exclusive_key.clone()]);
            }
        }

        for keys in exclusive {
            state.strings.insert(
                keys.exclusive_key.clone(),
                StringEntry {
                    value: owner.to_string(),
                    expires_at: None,
                },
            );
        }
        for keys in shared {
            state
                .sets
                .entry(keys.shared_key.clone())
                .or_default()
                .insert(owner.to_string());
        }

        Ok(vec![])
    }

    async fn release_resource_locks(
        &self,
        owner: &str,
        exclusive: &[ResourceLockKeys],
        shared: &[ResourceLockKeys],
    ) -> Result<(), LockStorageError> {
        let mut state = self.state.lock().unwrap();

        for keys in exclusive {
            if matches!(state.live_string(&keys.exclusive_key), Some(entry) if entry.value == owner)
            {
                state.strings.remove(&keys.exclusive_key);
            }
        }
        for keys in shared {
            if let Some(members) = state.sets.get_mut(&keys.shared_key) {
                members.remove(owner);
                if members.is_empty() {
                    state.sets.remove(&keys.shared_key);
                }
            }
        }

        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LockStorageError> {
        let mut state = self.state.lock().unwrap();

        let expired: Vec<String> = state
            .strings
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.expires_at, Some(deadline) if deadline <= Instant::now())
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.strings.remove(&key);
        }

        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.sets.keys())
            .filter(|key| matches_pattern(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}
