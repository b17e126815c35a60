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

pub mod concurrent;
pub mod simple;

use crate::config::EnvConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{BatchConfig, RaiConfig, WorkflowStepState};
use crate::queries;
use crate::rai::{RaiClient, RaiClientExt};
use crate::steps::{build_step, StepFactories, WorkflowStep};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use walkdir::WalkDir;

/// Parameters shared by the step factories, assembled from the CLI flags.
#[derive(Debug, Clone, Default)]
pub struct StepParams {
    pub rel_config_dir: Option<PathBuf>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub force_reimport: bool,
    pub force_reimport_not_chunk_partitioned: bool,
    pub collapse_partitions_on_load: bool,
}

impl StepParams {
    pub fn rel_config_dir(&self) -> WorkflowResult<&Path> {
        self.rel_config_dir.as_deref().ok_or_else(|| {
            WorkflowError::configuration("`rel_config_dir` parameter is required".to_string())
        })
    }
}

/// One workflow run as requested by the user: the batch config plus the run
/// mode flags. `recover_step` has priority over `recover`; `selected_steps`
/// is mutually exclusive with `recover_step` (validated at the CLI).
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub batch_config: BatchConfig,
    pub recover: bool,
    pub recover_step: Option<String>,
    pub selected_steps: Vec<String>,
    pub step_params: StepParams,
    pub step_timeouts: HashMap<String, u64>,
}

impl WorkflowConfig {
    pub fn timeout_for(&self, step_name: &str) -> Option<u64> {
        self.step_timeouts.get(step_name).copied()
    }
}

/// Decides which steps of the sequence actually run, depending on the
/// selected-steps / recover-step / recover modes.
pub struct StepFilter {
    selected_steps: Vec<String>,
    recover: bool,
    recover_step: Option<String>,
    recover_step_reached: bool,
}

impl StepFilter {
    pub fn new(config: &WorkflowConfig) -> Self {
        Self {
            selected_steps: config.selected_steps.clone(),
            recover: config.recover,
            recover_step: config.recover_step.clone(),
            recover_step_reached: false,
        }
    }

    pub fn should_run(&mut self, name: &str, state: WorkflowStepState) -> bool {
        if !self.selected_steps.is_empty() {
            return self.selected_steps.iter().any(|step| step == name);
        }
        if let Some(recover_step) = &self.recover_step {
            if !self.recover_step_reached && name == recover_step {
                self.recover_step_reached = true;
            }
            return self.recover_step_reached;
        }
        if self.recover && state == WorkflowStepState::Success {
            return false;
        }
        true
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInfo {
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
    #[serde(default)]
    pub total_time: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowInfoStep {
    idt: String,
    name: String,
    #[serde(default)]
    execution_time: f64,
}

/// Builds the runtime steps from the workflow description held by the remote
/// database.
pub async fn load_workflow_steps(
    env: &Arc<EnvConfig>,
    rai: &Arc<dyn RaiClient>,
    rai_config: &RaiConfig,
    config: &WorkflowConfig,
    factories: &StepFactories,
) -> WorkflowResult<Vec<Box<dyn WorkflowStep>>> {
    let info = read_workflow_info(rai, rai_config, &config.batch_config.name).await?;
    if info.steps.is_empty() {
        return Err(WorkflowError::configuration(format!(
            "config `{}` doesn't have workflow steps",
            config.batch_config.name
        )));
    }
    let mut steps = Vec::new();
    for raw in &info.steps {
        if let Some(step) = build_step(env, config, factories, raw)? {
            steps.push(step);
        }
    }
    Ok(steps)
}

pub async fn read_workflow_info(
    rai: &Arc<dyn RaiClient>,
    rai_config: &RaiConfig,
    batch_config_name: &str,
) -> WorkflowResult<WorkflowInfo> {
    let relation = queries::build_relation_path(queries::WORKFLOW_JSON_REL, &[batch_config_name]);
    let never = CancellationToken::new();
    rai.execute_relation_json(rai_config, &relation, true, &never)
        .await?
        .ok_or_else(|| {
            WorkflowError::configuration(format!(
                "config `{batch_config_name}` is not registered in the database"
            ))
        })
}

/// Installs the shared workflow models, loads the batch config and resets the
/// step states. Runs at `init` time and again on plain (non-recovery) runs.
pub async fn init_workflow(
    rai: &Arc<dyn RaiClient>,
    rai_config: &RaiConfig,
    batch_config: &BatchConfig,
    rel_config_dir: &Path,
) -> WorkflowResult<()> {
    let models = collect_models(rel_config_dir)?;
    let never = CancellationToken::new();
    if !models.is_empty() {
        info!("Installing {} workflow models", models.len());
        rai.install_models(rai_config, &models, &never).await?;
    }
    let relation = queries::build_relation_path(queries::BATCH_CONFIG_REL, &[&batch_config.name]);
    rai.load_json(rai_config, &relation, &batch_config.content, &never)
        .await?;
    rai.execute_query_str(
        rai_config,
        queries::init_workflow_steps(&batch_config.name),
        false,
        false,
        &never,
    )
    .await?;
    Ok(())
}

/// All `.rel` files under the model directory, keyed by their relative path.
fn collect_models(rel_config_dir: &Path) -> WorkflowResult<Vec<(String, String)>> {
    let mut models = Vec::new();
    if !rel_config_dir.is_dir() {
        return Ok(models);
    }
    for entry in WalkDir::new(rel_config_dir).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            WorkflowError::configuration(format!(
                "failed to scan model directory '{}': {err}",
                rel_config_dir.display()
            ))
        })?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|e| e.to_str()) != Some("rel")
        {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(rel_config_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let content = std::fs::read_to_string(entry.path())?;
        models.push((name, content));
    }
    Ok(models)
}

/// Logs the per-step and total execution times recorded in the remote
/// database.
pub async fn print_timings(
    rai: &Arc<dyn RaiClient>,
    rai_config: &RaiConfig,
    batch_config_name: &str,
) -> WorkflowResult<()> {
    let info = read_workflow_info(rai, rai_config, batch_config_name).await?;
    for raw in &info.steps {
        if let Ok(step) = serde_json::from_value::<WorkflowInfoStep>(raw.clone()) {
            info!(
                "{} (id='{}') finished in {}",
                step.name,
                step.idt,
                format_duration(step.execution_time)
            );
        }
    }
    info!(
        "Total workflow execution time is {}",
        format_duration(info.total_time)
    );
    Ok(())
}

pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours != 0 {
        format!("[{hours}h {minutes}m {seconds}s]")
    } else if minutes != 0 {
        format!("[{minutes}m {seconds}s]")
    } else {
        format!("[{seconds}s]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_r::test;

    fn config(
        selected: &[&str],
        recover: bool,
        recover_step: Option<&str>,
    ) -> WorkflowConfig {
        WorkflowConfig {
            batch_config: BatchConfig {
                name: "default".to_string(),
                content: "{}".to_string(),
            },
            recover,
            recover_step: recover_step.map(str::to_string),
            selected_steps: selected.iter().map(|s| s.to_string()).collect(),
            step_params: StepParams::default(),
            step_timeouts: HashMap::new(),
        }
    }

    #[test]
    fn plain_run_executes_everything() {
        let mut filter = StepFilter::new(&config(&[], false, None));
        assert!(filter.should_run("a", WorkflowStepState::Success));
        assert!(filter.should_run("b", WorkflowStepState::Failed));
    }

    #[test]
    fn selected_steps_run_exclusively() {
        let mut filter = StepFilter::new(&config(&["b"], false, None));
        assert!(!filter.should_run("a", WorkflowStepState::Init));
        assert!(filter.should_run("b", WorkflowStepState::Success));
        assert!(!filter.should_run("c", WorkflowStepState::Init));
    }

    #[test]
    fn recover_skips_successful_prefix() {
        let mut filter = StepFilter::new(&config(&[], true, None));
        assert!(!filter.should_run("a", WorkflowStepState::Success));
        assert!(filter.should_run("b", WorkflowStepState::Failed));
        assert!(filter.should_run("c", WorkflowStepState::Init));
    }

    #[test]
    fn recover_step_skips_until_reached_then_runs_the_rest() {
        let mut filter = StepFilter::new(&config(&[], false, Some("b")));
        assert!(!filter.should_run("a", WorkflowStepState::Success));
        assert!(filter.should_run("b", WorkflowStepState::Success));
        assert!(filter.should_run("c", WorkflowStepState::Init));
    }

    #[test]
    fn durations_render_like_the_remote_timings() {
        assert_eq!(format_duration(5.4), "[5s]");
        assert_eq!(format_duration(65.0), "[1m 5s]");
        assert_eq!(format_duration(3723.0), "[1h 2m 3s]");
    }

    #[test]
    fn models_are_collected_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("batch_config").join("workflow");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("config.rel"), "def a = 1").unwrap();
        std::fs::write(nested.join("workflow.rel"), "def b = 2").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a model").unwrap();
        let models = collect_models(dir.path()).unwrap();
        let names: Vec<&str> = models.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["batch_config/workflow/workflow.rel", "config.rel"]);
    }
}
