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
use crate::rai::RaiClientExt;
use crate::steps::{build_models, StepContext, StepFactory, StepMeta, WorkflowStep};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

pub struct InstallModelsStep {
    meta: StepMeta,
    rel_config_dir: PathBuf,
    model_files: Vec<String>,
}

#[async_trait]
impl WorkflowStep for InstallModelsStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(&self, ctx: &StepContext) -> WorkflowResult<()> {
        info!("Executing InstallModels step..");
        self.meta.check_stop()?;
        let models = build_models(&self.model_files, &self.rel_config_dir)?;
        ctx.rai
            .install_models(&ctx.rai_config, &models, &self.meta.stop)
            .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallModelsSpec {
    model_files: Vec<String>,
}

pub struct InstallModelsStepFactory;

impl StepFactory for InstallModelsStepFactory {
    fn create(
        &self,
        _env: &EnvConfig,
        config: &WorkflowConfig,
        meta: StepMeta,
        raw: &serde_json::Value,
    ) -> WorkflowResult<Box<dyn WorkflowStep>> {
        let spec: InstallModelsSpec = serde_json::from_value(raw.clone())?;
        let rel_config_dir = config.step_params.rel_config_dir()?.to_path_buf();
        Ok(Box::new(InstallModelsStep {
            meta,
            rel_config_dir,
            model_files: spec.model_files,
        }))
    }
}
