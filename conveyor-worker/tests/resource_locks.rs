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

use std::sync::Arc;

use assert2::check;

use conveyor_worker::locks::{
    exclusive_key, shared_key, AcquireOutcome, HeldLocks, TaskLocks,
};
use conveyor_worker::model::{TaskId, TaskResources};
use conveyor_worker::storage::memory::InMemoryLockStorage;
use conveyor_worker::storage::LockStorage;

fn resources(records: &[&str]) -> TaskResources {
    let records: Vec<String> = records.iter().map(|r| r.to_string()).collect();
    TaskResources::parse(&records)
}

fn setup() -> (Arc<InMemoryLockStorage>, TaskLocks) {
    let storage = Arc::new(InMemoryLockStorage::new());
    let locks = TaskLocks::new(storage.clone());
    (storage, locks)
}

async fn acquired(locks: &TaskLocks, owner: &str, records: &[&str]) -> HeldLocks {
    match locks.acquire(owner, &resources(records)).await.unwrap() {
        AcquireOutcome::Acquired(held) => held,
        AcquireOutcome::Blocked(blocked) => panic!("unexpectedly blocked on {blocked:?}"),
    }
}

async fn blocked(locks: &TaskLocks, owner: &str, records: &[&str]) -> Vec<String> {
    match locks.acquire(owner, &resources(records)).await.unwrap() {
        AcquireOutcome::Acquired(held) => panic!("unexpectedly acquired {held:?}"),
        AcquireOutcome::Blocked(blocked) => blocked,
    }
}

#[tokio::test]
#[tracing::instrument]
async fn acquire_then_release_leaves_no_keys() {
    let (storage, locks) = setup();

    let held = acquired(&locks, "w1", &["repo/1", "shared:remote/2"]).await;
    check!(held.exclusive == vec!["repo/1".to_string()]);
    check!(held.shared == vec!["remote/2".to_string()]);
    check!(storage.get(&exclusive_key("repo/1")).await.unwrap() == Some("w1".to_string()));
    check!(storage.set_members(&shared_key("remote/2")).await.unwrap() == vec!["w1".to_string()]);

    locks.release("w1", &held).await.unwrap();
    check!(storage.scan_keys("*").await.unwrap().is_empty());
}

#[tokio::test]
#[tracing::instrument]
async fn empty_resource_list_acquires_nothing() {
    let (storage, locks) = setup();

    let held = acquired(&locks, "w1", &[]).await;
    check!(held == HeldLocks::default());
    check!(storage.scan_keys("*").await.unwrap().is_empty());

    locks.release("w1", &held).await.unwrap();
    check!(storage.scan_keys("*").await.unwrap().is_empty());
}

#[tokio::test]
#[tracing::instrument]
async fn exclusive_holder_blocks_exclusive_and_shared() {
    let (_storage, locks) = setup();

    let held = acquired(&locks, "w1", &["repo/1"]).await;

    check!(blocked(&locks, "w2", &["repo/1"]).await == vec!["repo/1".to_string()]);
    check!(blocked(&locks, "w2", &["shared:repo/1"]).await == vec!["repo/1".to_string()]);

    locks.release("w1", &held).await.unwrap();
    let _ = acquired(&locks, "w2", &["repo/1"]).await;
}

#[tokio::test]
#[tracing::instrument]
async fn shared_holders_block_exclusive_but_not_each_other() {
    let (storage, locks) = setup();

    let h1 = acquired(&locks, "w1", &["shared:repo/1"]).await;
    let h2 = acquired(&locks, "w2", &["shared:repo/1"]).await;
    let h3 = acquired(&locks, "w3", &["shared:repo/1"]).await;

    check!(storage.set_size(&shared_key("repo/1")).await.unwrap() == 3);
    check!(storage.get(&exclusive_key("repo/1")).await.unwrap() == None);
    check!(blocked(&locks, "w4", &["repo/1"]).await == vec!["repo/1".to_string()]);

    locks.release("w1", &h1).await.unwrap();
    locks.release("w2", &h2).await.unwrap();
    check!(storage.set_size(&shared_key("repo/1")).await.unwrap() == 1);
    check!(blocked(&locks, "w4", &["repo/1"]).await == vec!["repo/1".to_string()]);

    locks.release("w3", &h3).await.unwrap();
    check!(storage.scan_keys("*").await.unwrap().is_empty());
    let _ = acquired(&locks, "w4", &["repo/1"]).await;
}

#[tokio::test]
#[tracing::instrument]
async fn acquisition_is_all_or_nothing() {
    let (storage, locks) = setup();

    let _held_b = acquired(&locks, "w1", &["b"]).await;

    // w2 needs a and b; b is taken, so a must stay untouched
    check!(blocked(&locks, "w2", &["a", "b"]).await == vec!["b".to_string()]);
    check!(storage.get(&exclusive_key("a")).await.unwrap() == None);

    check!(blocked(&locks, "w2", &["shared:b", "a"]).await == vec!["b".to_string()]);
    check!(storage.get(&exclusive_key("a")).await.unwrap() == None);
    check!(storage.set_size(&shared_key("b")).await.unwrap() == 0);
}

#[tokio::test]
#[tracing::instrument]
async fn release_only_touches_locks_owned_by_the_caller() {
    let (storage, locks) = setup();

    let held = acquired(&locks, "w1", &["repo/1"]).await;

    // a release under the wrong name must not free w1's lock
    locks.release("w2", &held).await.unwrap();
    check!(storage.get(&exclusive_key("repo/1")).await.unwrap() == Some("w1".to_string()));

    locks.release("w1", &held).await.unwrap();
    check!(storage.get(&exclusive_key("repo/1")).await.unwrap() == None);
}

#[tokio::test]
#[tracing::instrument]
async fn peer_release_for_missing_owner() {
    let (storage, locks) = setup();

    let _held = acquired(&locks, "w1", &["repo/1", "repo/2"]).await;

    locks
        .release_for_owner("w1", &["repo/1".to_string(), "repo/2".to_string()])
        .await
        .unwrap();
    check!(storage.scan_keys("resource-exclusive:*").await.unwrap().is_empty());

    // releasing again is a no-op
    locks
        .release_for_owner("w1", &["repo/1".to_string(), "repo/2".to_string()])
        .await
        .unwrap();
    check!(storage.scan_keys("*").await.unwrap().is_empty());
}

#[tokio::test]
#[tracing::instrument]
async fn duplicate_resource_entries_acquire_once() {
    let (storage, locks) = setup();

    let held = acquired(&locks, "w1", &["repo/1", "repo/1", "shared:r", "shared:r"]).await;
    check!(held.exclusive == vec!["repo/1".to_string()]);
    check!(held.shared == vec!["r".to_string()]);

    locks.release("w1", &held).await.unwrap();
    check!(storage.scan_keys("*").await.unwrap().is_empty());
}

#[tokio::test]
#[tracing::instrument]
async fn claim_is_single_writer() {
    let (storage, locks) = setup();
    let task_id = TaskId::new();

    check!(locks.claim(&task_id, "w1").await.unwrap());
    check!(!locks.claim(&task_id, "w2").await.unwrap());

    // only the holder can release
    check!(!locks.release_claim(&task_id, "w2").await.unwrap());
    check!(locks.release_claim(&task_id, "w1").await.unwrap());
    check!(storage.scan_keys("task:*").await.unwrap().is_empty());

    check!(locks.claim(&task_id, "w2").await.unwrap());
}

#[tokio::test]
#[tracing::instrument]
async fn claims_owned_by_filters_by_owner() {
    let (_storage, locks) = setup();
    let t1 = TaskId::new();
    let t2 = TaskId::new();
    let t3 = TaskId::new();

    check!(locks.claim(&t1, "w1").await.unwrap());
    check!(locks.claim(&t2, "w2").await.unwrap());
    check!(locks.claim(&t3, "w1").await.unwrap());

    let mut owned = locks.claims_owned_by("w1").await.unwrap();
    owned.sort();
    let mut expected = vec![t1, t3];
    expected.sort();
    check!(owned == expected);
    check!(locks.claims_owned_by("w3").await.unwrap().is_empty());
}

/// Interleaved acquisition over overlapping resource sets: with sorted
/// all-or-nothing acquisition two workers can never both win an
/// exclusive resource, and every round ends with a clean keyspace.
#[tokio::test]
#[tracing::instrument]
async fn interleaved_acquisition_never_double_grants() {
    let (storage, locks) = setup();
    let pool = ["a", "b", "c", "shared:d", "shared:e"];

    for round in 0u32..50 {
        // rotate two overlapping subsets through the pool
        let r1: Vec<&str> = pool
            .iter()
            .enumerate()
            .filter(|(i, _)| (i + round as usize) % 2 == 0)
            .map(|(_, r)| *r)
            .collect();
        let r2: Vec<&str> = pool
            .iter()
            .enumerate()
            .filter(|(i, _)| (i + round as usize / 2) % 3 != 0)
            .map(|(_, r)| *r)
            .collect();

        let res1 = resources(&r1);
        let res2 = resources(&r2);
        let (o1, o2) = tokio::join!(locks.acquire("w1", &res1), locks.acquire("w2", &res2));
        let o1 = o1.unwrap();
        let o2 = o2.unwrap();

        let exclusive_overlap = r1
            .iter()
            .any(|r| !r.starts_with("shared:") && r2.contains(r));
        if exclusive_overlap {
            let both_won = matches!(&o1, AcquireOutcome::Acquired(_))
                && matches!(&o2, AcquireOutcome::Acquired(_));
            check!(!both_won);
        }

        if let AcquireOutcome::Acquired(held) = &o1 {
            locks.release("w1", held).await.unwrap();
        }
        if let AcquireOutcome::Acquired(held) = &o2 {
            locks.release("w2", held).await.unwrap();
        }
        check!(storage.scan_keys("*").await.unwrap().is_empty());
    }
}
