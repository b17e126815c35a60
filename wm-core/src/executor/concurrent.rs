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
use crate::coordinator::CoordinatorClient;
use crate::error::{WorkflowError, WorkflowResult};
use crate::executor::{load_workflow_steps, WorkflowConfig};
use crate::manager::ResourceManager;
use crate::rai::RaiClient;
use crate::steps::{default_factories, StepContext, StepFactories, WorkflowStep};
use crate::model::{Transition, TransitionType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info};

type StepCompletion = (String, WorkflowResult<()>);

/// Petri-net executor: the remote coordinator decides which steps may start,
/// and steps run in parallel on a worker pool. The executor never fabricates
/// transitions; it only fires what the coordinator handed out.
pub struct ConcurrentWorkflowExecutor {
    env: Arc<EnvConfig>,
    rai: Arc<dyn RaiClient>,
    coordinator: Arc<dyn CoordinatorClient>,
    config: WorkflowConfig,
    manager: ResourceManager,
    steps: HashMap<String, Arc<dyn WorkflowStep>>,
    workflow_id: String,
}

impl ConcurrentWorkflowExecutor {
    pub async fn init(
        env: Arc<EnvConfig>,
        coordinator: Arc<dyn CoordinatorClient>,
        config: WorkflowConfig,
        manager: ResourceManager,
        workflow_id: String,
        extra_factories: StepFactories,
    ) -> WorkflowResult<ConcurrentWorkflowExecutor> {
        let rai = manager.client();
        let rai_config = manager.rai_config(None);
        let mut factories = default_factories();
        factories.extend(extra_factories);
        let steps = load_workflow_steps(&env, &rai, &rai_config, &config, &factories).await?;
        let steps = steps
            .into_iter()
            .map(|step| {
                let name = step.meta().name.clone();
                (name, Arc::from(step))
            })
            .collect();
        Ok(ConcurrentWorkflowExecutor {
            env,
            rai,
            coordinator,
            config,
            manager,
            steps,
            workflow_id,
        })
    }

    pub fn manager_mut(&mut self) -> &mut ResourceManager {
        &mut self.manager
    }

    pub async fn run(&mut self) -> WorkflowResult<()> {
        let recovering = self.config.recover || self.config.recover_step.is_some();
        let mut enabled = if recovering {
            let enabled = self.coordinator.enabled_transitions(&self.workflow_id).await?;
            let retries: Vec<Transition> = enabled
                .iter()
                .filter(|transition| transition.transition_type == TransitionType::Retry)
                .cloned()
                .collect();
            if retries.is_empty() {
                enabled
            } else {
                info!("Recovering: firing {} retry transition(s)", retries.len());
                self.coordinator
                    .fire_transitions(&self.workflow_id, &retries)
                    .await?
            }
        } else {
            self.coordinator.activate_workflow(&self.workflow_id).await?
        };

        let mut pool: JoinSet<StepCompletion> = JoinSet::new();
        loop {
            enabled = self.start_enabled_steps(enabled, &mut pool).await?;
            let Some(joined) = pool.join_next().await else {
                break;
            };
            // completions observed in one wait cycle are fired as a batch
            let mut completions = vec![unwrap_completion(joined)?];
            while let Some(joined) = pool.try_join_next() {
                completions.push(unwrap_completion(joined)?);
            }

            let mut failed_steps = Vec::new();
            let mut to_fire = Vec::new();
            for (step_name, result) in completions {
                let outcome = match result {
                    Ok(()) => TransitionType::Confirm,
                    Err(err) => {
                        error!("Step '{step_name}' failed: {err}");
                        failed_steps.push(step_name.clone());
                        TransitionType::Fail
                    }
                };
                let transition = enabled
                    .iter()
                    .find(|transition| {
                        transition.step == step_name && transition.transition_type == outcome
                    })
                    .cloned()
                    .ok_or_else(|| {
                        WorkflowError::configuration(format!(
                            "coordinator offers no {outcome:?} transition for step '{step_name}'"
                        ))
                    })?;
                to_fire.push(transition);
            }
            enabled = self
                .coordinator
                .fire_transitions(&self.workflow_id, &to_fire)
                .await?;

            if !failed_steps.is_empty() {
                for step in self.steps.values() {
                    step.meta().stop.cancel();
                }
                while pool.join_next().await.is_some() {}
                failed_steps.sort();
                return Err(WorkflowError::StepsFailed { failed_steps });
            }
        }
        Ok(())
    }

    /// Fires every enabled Start transition and submits the started steps to
    /// the worker pool. Engine scoping happens here, never inside a worker.
    async fn start_enabled_steps(
        &mut self,
        enabled: Vec<Transition>,
        pool: &mut JoinSet<StepCompletion>,
    ) -> WorkflowResult<Vec<Transition>> {
        let starts: Vec<Transition> = enabled
            .iter()
            .filter(|transition| transition.transition_type == TransitionType::Start)
            .cloned()
            .collect();
        if starts.is_empty() {
            return Ok(enabled);
        }
        let enabled_after = self
            .coordinator
            .fire_transitions(&self.workflow_id, &starts)
            .await?;
        for transition in &starts {
            let step = self
                .steps
                .get(&transition.step)
                .ok_or_else(|| {
                    WorkflowError::configuration(format!(
                        "workflow step '{}' is not defined",
                        transition.step
                    ))
                })?
                .clone();
            let meta = step.meta().clone();
            let rai_config = match &meta.engine_size {
                Some(size) => {
                    self.manager.add_engine(size).await?;
                    self.manager.rai_config(Some(size))
                }
                None => self.manager.rai_config(None),
            };
            let ctx = StepContext {
                env: self.env.clone(),
                rai: self.rai.clone(),
                rai_config,
            };
            let timeout = self.config.timeout_for(&meta.name);
            info!("Starting step '{}'", meta.name);
            pool.spawn(async move {
                let name = meta.name.clone();
                let result = match timeout {
                    Some(timeout_secs) => {
                        tokio::select! {
                            result = step.execute(&ctx) => result,
                            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                                meta.stop.cancel();
                                Err(WorkflowError::StepTimeout {
                                    step: name.clone(),
                                    timeout_secs,
                                })
                            }
                        }
                    }
                    None => step.execute(&ctx).await,
                };
                (name, result)
            });
        }
        Ok(enabled_after)
    }
}

fn unwrap_completion(
    joined: Result<StepCompletion, tokio::task::JoinError>,
) -> WorkflowResult<StepCompletion> {
    joined.map_err(|err| {
        WorkflowError::configuration(format!("step worker task failed: {err}"))
    })
}
