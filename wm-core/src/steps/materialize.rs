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
use crate::error::WorkflowResult;
use crate::executor::WorkflowConfig;
use crate::queries;
use crate::rai::RaiClientExt;
use crate::steps::{StepContext, StepFactory, StepMeta, WorkflowStep};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

/// Forces evaluation of derived relations by counting them, either in one
/// transaction or one per relation.
pub struct MaterializeStep {
    meta: StepMeta,
    relations: Vec<String>,
    materialize_jointly: bool,
}

#[async_trait]
impl WorkflowStep for MaterializeStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(&self, ctx: &StepContext) -> WorkflowResult<()> {
        info!("Executing Materialize step..");
        if self.materialize_jointly {
            ctx.rai
                .execute_query_str(
                    &ctx.rai_config,
                    queries::materialize(&self.relations),
                    false,
                    false,
                    &self.meta.stop,
                )
                .await?;
        } else {
            for relation in &self.relations {
                self.meta.check_stop()?;
                ctx.rai
                    .execute_query_str(
                        &ctx.rai_config,
                        queries::materialize(std::slice::from_ref(relation)),
                        false,
                        false,
                        &self.meta.stop,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaterializeSpec {
    relations: Vec<String>,
    materialize_jointly: bool,
}

pub struct MaterializeStepFactory;

impl StepFactory for MaterializeStepFactory {
    fn create(
        &self,
        _env: &EnvConfig,
        _config: &WorkflowConfig,
        meta: StepMeta,
        raw: &serde_json::Value,
    ) -> WorkflowResult<Box<dyn WorkflowStep>> {
        let spec: MaterializeSpec = serde_json::from_value(raw.clone())?;
        Ok(Box::new(MaterializeStep {
            meta,
            relations: spec.relations,
            materialize_jointly: spec.materialize_jointly,
        }))
    }
}
