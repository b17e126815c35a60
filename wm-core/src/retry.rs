// Copyright 2024-2025 Golem Cloud
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

use crate::error::{WorkflowError, WorkflowResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Polling schedule where the waiting overhead stays proportional to the
/// elapsed time: the next delay is `clamp(elapsed * overhead_rate,
/// first_delay, max_delay)`.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub first_delay: Duration,
    pub max_delay: Duration,
    pub overhead_rate: f64,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn for_transactions() -> Self {
        Self {
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(120),
            overhead_rate: 0.2,
            timeout: Duration::from_secs(12 * 60 * 60),
        }
    }

    pub fn for_engine_provisioning() -> Self {
        Self {
            first_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            overhead_rate: 0.5,
            timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn for_engine_deletion() -> Self {
        Self {
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            overhead_rate: 0.2,
            timeout: Duration::from_secs(10 * 60),
        }
    }

    /// The first delay gives the ingestion service time to start the job; the
    /// cap keeps the warehouse from suspending between polls.
    pub fn for_data_streams() -> Self {
        Self {
            first_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(55),
            overhead_rate: 0.5,
            timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn for_coordinator_startup() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            overhead_rate: 0.5,
            timeout: Duration::from_secs(30 * 60),
        }
    }

    fn next_delay(&self, elapsed: Duration) -> Duration {
        let proportional = elapsed.mul_f64(self.overhead_rate);
        proportional.clamp(self.first_delay, self.max_delay)
    }
}

/// Poll `check` until it reports a terminal value, the overall timeout
/// elapses, or the cancellation token fires. Each iteration sleeps before
/// checking, so a freshly started remote operation is given `first_delay` to
/// make progress.
pub async fn poll_with_overhead<F, Fut, T>(
    operation: &str,
    config: &PollConfig,
    token: &CancellationToken,
    mut check: F,
) -> WorkflowResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WorkflowResult<Option<T>>>,
{
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            return Err(WorkflowError::RetryTimeout {
                operation: operation.to_string(),
                timeout_secs: config.timeout.as_secs(),
            });
        }
        let delay = config.next_delay(elapsed).min(config.timeout - elapsed);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => {
                return Err(WorkflowError::Cancelled {
                    operation: operation.to_string(),
                });
            }
        }
        debug!(
            "Polling '{operation}' after {}ms",
            started.elapsed().as_millis()
        );
        if let Some(value) = check().await? {
            return Ok(value);
        }
    }
}
