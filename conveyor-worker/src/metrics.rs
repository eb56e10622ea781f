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

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec,
    IntGauge, Registry,
};

lazy_static! {
    static ref WAITING_TASKS: IntGauge = register_int_gauge!(
        "conveyor_waiting_tasks",
        "Number of waiting and running tasks minus the number of live workers"
    )
    .unwrap();
    static ref TASK_PROCESS_EXITS: IntCounterVec = register_int_counter_vec!(
        "conveyor_task_process_exits_total",
        "Task process exits by outcome",
        &["outcome"]
    )
    .unwrap();
    static ref TASK_EXECUTION_SECONDS: Histogram = register_histogram!(
        "conveyor_task_execution_seconds",
        "Wall time of supervised task executions",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    record_waiting_tasks(0);
    prometheus::default_registry().clone()
}

pub fn record_waiting_tasks(value: i64) {
    WAITING_TASKS.set(value);
}

pub fn waiting_tasks() -> i64 {
    WAITING_TASKS.get()
}

pub fn record_task_process_exit(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    TASK_PROCESS_EXITS.with_label_values(&[outcome]).inc();
}

pub fn record_task_execution_time(elapsed: Duration) {
    TASK_EXECUTION_SECONDS.observe(elapsed.as_secs_f64());
}
