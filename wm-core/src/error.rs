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

use thiserror::Error;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Failure modes of a workflow run. Step-level errors propagate to the
/// executor, which records remote step state (best effort) and re-raises.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request '{method} {url}' failed: {source}")]
    Transport {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response for '{method} {url}': {status}\n{payload}")]
    UnexpectedResponse {
        method: String,
        url: String,
        status: u16,
        payload: String,
    },

    #[error("transaction '{txn_id}' did not complete successfully or has problems: {state}")]
    TransactionFailure { txn_id: String, state: String },

    #[error("'{engine}' has already running write transaction")]
    ConcurrentWriteAttempt { engine: String },

    #[error("step '{step}' did not finish within {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("command:\n{command}\nfailed with exit status '{status}'")]
    CommandExecutionFailure { command: String, status: String },

    #[error("'{operation}' did not complete within {timeout_secs}s")]
    RetryTimeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("'{operation}' was cancelled")]
    Cancelled { operation: String },

    #[error("data stream for '{source_table}' has failed, health status: {health}")]
    DataStreamFailure {
        source_table: String,
        health: String,
    },

    #[error("workflow failed, failed steps: [{}]", failed_steps.join(", "))]
    StepsFailed { failed_steps: Vec<String> },

    #[error("failed to list '{path}': {source}")]
    ObjectStore {
        path: String,
        #[source]
        source: object_store::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn transport(method: &str, url: &url::Url, source: reqwest::Error) -> Self {
        Self::Transport {
            method: method.to_string(),
            url: url.to_string(),
            source,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
