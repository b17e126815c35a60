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

use crate::config::EnvConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::executor::WorkflowConfig;
use crate::steps::{StepContext, StepFactory, StepMeta, WorkflowStep};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

/// Runs an arbitrary shell command as a workflow step. A non-zero exit status
/// fails the step with the command and status attached.
pub struct ExecuteCommandStep {
    meta: StepMeta,
    command: String,
}

#[async_trait]
impl WorkflowStep for ExecuteCommandStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(&self, _ctx: &StepContext) -> WorkflowResult<()> {
        info!("Executing command: {}", self.command);
        self.meta.check_stop()?;
        let mut child = Command::new("sh").arg("-c").arg(&self.command).spawn()?;
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(WorkflowError::CommandExecutionFailure {
                        command: self.command.clone(),
                        status: status
                            .code()
                            .map(|code| code.to_string())
                            .unwrap_or_else(|| "killed by signal".to_string()),
                    })
                }
            }
            _ = self.meta.stop.cancelled() => {
                let _ = child.start_kill();
                Err(WorkflowError::Cancelled {
                    operation: format!("command of step '{}'", self.meta.name),
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteCommandSpec {
    command: String,
}

pub struct ExecuteCommandStepFactory;

impl StepFactory for ExecuteCommandStepFactory {
    fn create(
        &self,
        _env: &EnvConfig,
        _config: &WorkflowConfig,
        meta: StepMeta,
        raw: &serde_json::Value,
    ) -> WorkflowResult<Box<dyn WorkflowStep>> {
        let spec: ExecuteCommandSpec = serde_json::from_value(raw.clone())?;
        Ok(Box::new(ExecuteCommandStep {
            meta,
            command: spec.command,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RaiConfig, WorkflowStepState};
    use crate::testing::FakeRaiClient;
    use std::sync::Arc;
    use test_r::test;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn step(command: &str) -> ExecuteCommandStep {
        ExecuteCommandStep {
            meta: StepMeta {
                idt: Uuid::new_v4(),
                name: "command".to_string(),
                type_name: "ExecuteCommand".to_string(),
                state: WorkflowStepState::Init,
                execution_time: 0.0,
                engine_size: None,
                stop: CancellationToken::new(),
            },
            command: command.to_string(),
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            env: Arc::new(EnvConfig::load_for_tests()),
            rai: Arc::new(FakeRaiClient::default()),
            rai_config: RaiConfig {
                engine: "loader".to_string(),
                database: "loader_db".to_string(),
            },
        }
    }

    #[test]
    async fn successful_command_completes_the_step() {
        assert!(step("true").execute(&ctx()).await.is_ok());
    }

    #[test]
    async fn failing_command_carries_the_exit_status() {
        let result = step("exit 3").execute(&ctx()).await;
        match result {
            Err(WorkflowError::CommandExecutionFailure { command, status }) => {
                assert_eq!(command, "exit 3");
                assert_eq!(status, "3");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    async fn cancelled_step_stops_the_command() {
        let step = step("sleep 30");
        step.meta.stop.cancel();
        let result = step.execute(&ctx()).await;
        assert!(matches!(result, Err(WorkflowError::Cancelled { .. })));
    }
}
