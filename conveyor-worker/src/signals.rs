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

use chrono::{DateTime, Utc};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Shutdown state published to the worker loop and the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    None,
    /// Wait indefinitely for the in-flight task to finish.
    Graceful,
    /// Abort the in-flight task once the deadline passes.
    Forced { grace_deadline: DateTime<Utc> },
}

impl ShutdownSignal {
    pub fn requested(&self) -> bool {
        !matches!(self, ShutdownSignal::None)
    }
}

/// Installs the process signal handlers.
///
/// SIGHUP and SIGTERM request a graceful shutdown that waits for the
/// in-flight task indefinitely. SIGINT requests a forced shutdown with a
/// grace window; once a forced shutdown was requested, any further
/// signal terminates the process immediately.
pub fn install(grace_interval: Duration) -> std::io::Result<watch::Receiver<ShutdownSignal>> {
    let (tx, rx) = watch::channel(ShutdownSignal::None);

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let mut forced = false;
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    if forced {
                        fatal_exit();
                    }
                    info!("Worker was requested to shut down gracefully (SIGHUP)");
                    let _ = tx.send(ShutdownSignal::Graceful);
                }
                _ = terminate.recv() => {
                    if forced {
                        fatal_exit();
                    }
                    info!("Worker was requested to shut down gracefully (SIGTERM)");
                    let _ = tx.send(ShutdownSignal::Graceful);
                }
                _ = interrupt.recv() => {
                    if forced {
                        fatal_exit();
                    }
                    forced = true;
                    info!("Worker was requested to shut down (SIGINT)");
                    let grace_deadline = Utc::now() + to_chrono(grace_interval);
                    let _ = tx.send(ShutdownSignal::Forced { grace_deadline });
                }
            }
        }
    });

    Ok(rx)
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}

fn fatal_exit() -> ! {
    info!("Worker was killed");
    std::process::exit(130)
}
