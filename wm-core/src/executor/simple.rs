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
use crate::executor::{
    format_duration, init_workflow, load_workflow_steps, print_timings, StepFilter, WorkflowConfig,
};
use crate::manager::ResourceManager;
use crate::model::WorkflowStepState;
use crate::queries;
use crate::rai::{RaiClient, RaiClientExt};
use crate::steps::{default_factories, StepContext, StepFactories, WorkflowStep};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Linear executor: walks the step sequence in declaration order, keeping the
/// authoritative step state in the remote database.
pub struct WorkflowExecutor {
    env: Arc<EnvConfig>,
    rai: Arc<dyn RaiClient>,
    config: WorkflowConfig,
    manager: ResourceManager,
    steps: Vec<Box<dyn WorkflowStep>>,
}

impl WorkflowExecutor {
    /// Prepares the workflow: on a fresh run the shared models and batch
    /// config are (re)installed, then the steps are built from the remote
    /// workflow description.
    pub async fn init(
        env: Arc<EnvConfig>,
        config: WorkflowConfig,
        manager: ResourceManager,
        extra_factories: StepFactories,
    ) -> WorkflowResult<WorkflowExecutor> {
        let rai = manager.client();
        let rai_config = manager.rai_config(None);
        if !config.recover && config.recover_step.is_none() {
            init_workflow(
                &rai,
                &rai_config,
                &config.batch_config,
                config.step_params.rel_config_dir()?,
            )
            .await?;
        }
        let mut factories = default_factories();
        factories.extend(extra_factories);
        let steps = load_workflow_steps(&env, &rai, &rai_config, &config, &factories).await?;
        Ok(WorkflowExecutor {
            env,
            rai,
            config,
            manager,
            steps,
        })
    }

    pub fn manager_mut(&mut self) -> &mut ResourceManager {
        &mut self.manager
    }

    pub async fn print_timings(&self) -> WorkflowResult<()> {
        print_timings(
            &self.rai,
            &self.manager.rai_config(None),
            &self.config.batch_config.name,
        )
        .await
    }

    pub async fn run(&mut self) -> WorkflowResult<()> {
        let base_config = self.manager.rai_config(None);
        let never = CancellationToken::new();
        let mut filter = StepFilter::new(&self.config);
        for index in 0..self.steps.len() {
            let meta = self.steps[index].meta().clone();
            if !filter.should_run(&meta.name, meta.state) {
                info!("Skipping step {} (id='{}')", meta.name, meta.idt);
                continue;
            }

            // state write failures must not block the run
            if let Err(err) = self
                .rai
                .execute_query_str(
                    &base_config,
                    queries::update_step_state(
                        &meta.idt,
                        &WorkflowStepState::InProgress.to_string(),
                    ),
                    false,
                    true,
                    &never,
                )
                .await
            {
                warn!(
                    "Failed to record IN_PROGRESS state for step '{}': {err}",
                    meta.name
                );
            }

            let scoped_config = match &meta.engine_size {
                Some(size) => {
                    self.manager.add_engine(size).await?;
                    self.manager.rai_config(Some(size))
                }
                None => base_config.clone(),
            };
            let ctx = StepContext {
                env: self.env.clone(),
                rai: self.rai.clone(),
                rai_config: scoped_config,
            };

            let started = Instant::now();
            let step = &self.steps[index];
            let result = match self.config.timeout_for(&meta.name) {
                Some(timeout_secs) => {
                    tokio::select! {
                        result = step.execute(&ctx) => result,
                        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                            warn!("Step '{}' exceeded its timeout of {timeout_secs}s, signalling stop", meta.name);
                            meta.stop.cancel();
                            Err(WorkflowError::StepTimeout {
                                step: meta.name.clone(),
                                timeout_secs,
                            })
                        }
                    }
                }
                None => step.execute(&ctx).await,
            };

            let next_engine_size = self
                .steps
                .get(index + 1)
                .and_then(|next| next.meta().engine_size.clone());

            match result {
                Ok(()) => {
                    let execution_time = started.elapsed().as_secs_f64();
                    let query = format!(
                        "{}\n{}",
                        queries::update_step_state(
                            &meta.idt,
                            &WorkflowStepState::Success.to_string()
                        ),
                        queries::update_execution_time(&meta.idt, execution_time)
                    );
                    self.rai
                        .execute_query_str(&base_config, query, false, false, &never)
                        .await?;
                    if let Some(size) = &meta.engine_size {
                        if next_engine_size.as_deref() != Some(size.as_str()) {
                            self.manager.remove_engine(size).await?;
                        }
                    }
                    info!(
                        "{} (id='{}') finished in {}",
                        meta.name,
                        meta.idt,
                        format_duration(execution_time)
                    );
                }
                Err(err @ WorkflowError::StepTimeout { .. }) => {
                    // the in-flight write transaction may still hold the
                    // database, so the step state is left untouched
                    self.release_engine_best_effort(&meta.engine_size).await;
                    return Err(err);
                }
                Err(err) => {
                    if let Err(state_err) = self
                        .rai
                        .execute_query_str(
                            &base_config,
                            queries::update_step_state(
                                &meta.idt,
                                &WorkflowStepState::Failed.to_string(),
                            ),
                            false,
                            true,
                            &never,
                        )
                        .await
                    {
                        warn!(
                            "Failed to record FAILED state for step '{}': {state_err}",
                            meta.name
                        );
                    }
                    self.release_engine_best_effort(&meta.engine_size).await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn release_engine_best_effort(&mut self, engine_size: &Option<String>) {
        if let Some(size) = engine_size {
            if let Err(err) = self.manager.remove_engine(size).await {
                warn!("Failed to remove engine of size '{size}': {err}");
            }
        }
    }
}
