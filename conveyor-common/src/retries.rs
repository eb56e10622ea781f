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

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Runs `action` until it succeeds, the error is not retriable, or
/// `config.max_attempts` is exhausted. Delays grow exponentially from
/// `min_delay` up to `max_delay`, with optional jitter.
pub async fn with_retries<In, F, G, R, E>(
    target: &'static str,
    op: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    i: &In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    In: ?Sized,
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'a + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let mut attempts: u32 = 0;
    let mut delay = config.min_delay;

    loop {
        attempts += 1;
        match action(i).await {
            Ok(result) => {
                if attempts > 1 {
                    debug!("[{target}] {op} succeeded after {attempts} attempts");
                }
                return Ok(result);
            }
            Err(error) if attempts < config.max_attempts && is_retriable(&error) => {
                let sleep_for = match config.max_jitter_factor {
                    Some(factor) if factor > 0.0 => {
                        delay.mul_f64(1.0 + rand::rng().random_range(0.0..factor))
                    }
                    _ => delay,
                };
                let op_id = op_id.as_deref().unwrap_or("-");
                warn!(
                    "[{target}] {op} ({op_id}) attempt {attempts}/{} failed: {error}, retrying in {sleep_for:?}",
                    config.max_attempts
                );
                tokio::time::sleep(sleep_for).await;
                delay = std::cmp::min(config.max_delay, delay.mul_f64(config.multiplier));
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retries(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            max_jitter_factor: None,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "flaky",
            None,
            &fast_retries(5),
            &calls,
            |calls| {
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(42)
                    }
                })
            },
            |_| true,
        )
        .await;

        check!(result == Ok(42));
        check!(calls.load(Ordering::SeqCst) == 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "hopeless",
            None,
            &fast_retries(3),
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("still broken".to_string())
                })
            },
            |_| true,
        )
        .await;

        check!(result == Err("still broken".to_string()));
        check!(calls.load(Ordering::SeqCst) == 3);
    }

    #[tokio::test]
    async fn non_retriable_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "fatal",
            None,
            &fast_retries(5),
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                })
            },
            |_| false,
        )
        .await;

        check!(result == Err("fatal".to_string()));
        check!(calls.load(Ordering::SeqCst) == 1);
    }
}
