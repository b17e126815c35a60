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

pub mod configure_sources;
pub mod execute_command;
pub mod export;
pub mod install_models;
pub mod load_data;
pub mod materialize;

use crate::config::EnvConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::executor::WorkflowConfig;
use crate::model::{RaiConfig, WorkflowStepState};
use crate::rai::RaiClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

pub const CONFIGURE_SOURCES: &str = "ConfigureSources";
pub const INSTALL_MODELS: &str = "InstallModels";
pub const LOAD_DATA: &str = "LoadData";
pub const MATERIALIZE: &str = "Materialize";
pub const EXPORT: &str = "Export";
pub const EXECUTE_COMMAND: &str = "ExecuteCommand";

/// Runtime identity and bookkeeping of one workflow step, shared by every
/// step type. The stop token is the step's cooperative cancellation signal.
#[derive(Debug, Clone)]
pub struct StepMeta {
    pub idt: Uuid,
    pub name: String,
    pub type_name: String,
    pub state: WorkflowStepState,
    pub execution_time: f64,
    pub engine_size: Option<String>,
    pub stop: CancellationToken,
}

impl StepMeta {
    pub fn check_stop(&self) -> WorkflowResult<()> {
        if self.stop.is_cancelled() {
            Err(WorkflowError::Cancelled {
                operation: format!("step '{}'", self.name),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStepMeta {
    idt: Uuid,
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    state: Option<WorkflowStepState>,
    #[serde(default)]
    execution_time: f64,
    #[serde(default)]
    engine_size: Option<String>,
}

/// Everything a step needs to run: the environment, the query client and the
/// compute context the executor scoped for it.
pub struct StepContext {
    pub env: Arc<EnvConfig>,
    pub rai: Arc<dyn RaiClient>,
    pub rai_config: RaiConfig,
}

#[async_trait]
pub trait WorkflowStep: Send + Sync {
    fn meta(&self) -> &StepMeta;

    async fn execute(&self, ctx: &StepContext) -> WorkflowResult<()>;
}

/// Builds one step type from its raw remote description. Factories validate
/// their required parameters before any remote side-effect happens.
pub trait StepFactory: Send + Sync {
    fn create(
        &self,
        env: &EnvConfig,
        config: &WorkflowConfig,
        meta: StepMeta,
        raw: &serde_json::Value,
    ) -> WorkflowResult<Box<dyn WorkflowStep>>;
}

pub type StepFactories = HashMap<String, Arc<dyn StepFactory>>;

pub fn default_factories() -> StepFactories {
    let mut factories: StepFactories = HashMap::new();
    factories.insert(
        CONFIGURE_SOURCES.to_string(),
        Arc::new(configure_sources::ConfigureSourcesStepFactory),
    );
    factories.insert(
        INSTALL_MODELS.to_string(),
        Arc::new(install_models::InstallModelsStepFactory),
    );
    factories.insert(LOAD_DATA.to_string(), Arc::new(load_data::LoadDataStepFactory));
    factories.insert(
        MATERIALIZE.to_string(),
        Arc::new(materialize::MaterializeStepFactory),
    );
    factories.insert(EXPORT.to_string(), Arc::new(export::ExportStepFactory));
    factories.insert(
        EXECUTE_COMMAND.to_string(),
        Arc::new(execute_command::ExecuteCommandStepFactory),
    );
    factories
}

/// Builds a step from its remote description, or `None` for step types no
/// factory is registered for (those are skipped with a warning).
pub fn build_step(
    env: &EnvConfig,
    config: &WorkflowConfig,
    factories: &StepFactories,
    raw: &serde_json::Value,
) -> WorkflowResult<Option<Box<dyn WorkflowStep>>> {
    let raw_meta: RawStepMeta = serde_json::from_value(raw.clone())?;
    let Some(factory) = factories.get(&raw_meta.type_name) else {
        warn!("Step type '{}' is not supported", raw_meta.type_name);
        return Ok(None);
    };
    let meta = StepMeta {
        idt: raw_meta.idt,
        name: raw_meta.name,
        type_name: raw_meta.type_name,
        state: raw_meta.state.unwrap_or(WorkflowStepState::Init),
        execution_time: raw_meta.execution_time,
        engine_size: raw_meta.engine_size.map(|size| size.to_uppercase()),
        stop: CancellationToken::new(),
    };
    factory.create(env, config, meta, raw).map(Some)
}

/// Reads model files relative to the configured model directory, keyed by
/// their relative name.
pub fn build_models(files: &[String], root: &Path) -> WorkflowResult<Vec<(String, String)>> {
    let mut models = Vec::new();
    for file in files {
        let path = root.join(file);
        let content = std::fs::read_to_string(&path).map_err(|err| {
            WorkflowError::configuration(format!(
                "failed to read model file '{}': {err}",
                path.display()
            ))
        })?;
        models.push((file.clone(), content));
    }
    Ok(models)
}
