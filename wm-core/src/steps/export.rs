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
use crate::model::{ContainerParams, Export, FileType};
use crate::queries;
use crate::rai::RaiClientExt;
use crate::steps::{StepContext, StepFactory, StepMeta, WorkflowStep};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Writes export relations to their configured containers, gated by snapshot
/// validity.
pub struct ExportStep {
    meta: StepMeta,
    exports: Vec<Export>,
    export_jointly: bool,
    end_date: String,
}

#[async_trait]
impl WorkflowStep for ExportStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(&self, ctx: &StepContext) -> WorkflowResult<()> {
        info!("Executing Export step..");
        let mut active: Vec<&Export> = Vec::new();
        for export in &self.exports {
            self.meta.check_stop()?;
            if self.should_export(ctx, export).await? {
                active.push(export);
            } else {
                info!(
                    "Skipping export of '{}', its snapshot is still valid",
                    export.relation
                );
            }
        }
        if self.export_jointly {
            // group by container, preserving declaration order
            let mut groups: Vec<(String, Vec<&Export>)> = Vec::new();
            for export in active {
                match groups.iter_mut().find(|(name, _)| *name == export.container.name) {
                    Some((_, group)) => group.push(export),
                    None => groups.push((export.container.name.clone(), vec![export])),
                }
            }
            for (_, group) in groups {
                self.meta.check_stop()?;
                self.export_group(ctx, &group).await?;
            }
        } else {
            for export in active {
                self.meta.check_stop()?;
                self.export_group(ctx, &[export]).await?;
            }
        }
        Ok(())
    }
}

impl ExportStep {
    /// An export with a snapshot binding is skipped while the bound snapshot
    /// is still strictly valid past the end date. A missing expiration date
    /// always exports.
    async fn should_export(&self, ctx: &StepContext, export: &Export) -> WorkflowResult<bool> {
        let Some(binding) = export.snapshot_binding.as_deref() else {
            return Ok(true);
        };
        let expiration = ctx
            .rai
            .execute_query_take_single(
                &ctx.rai_config,
                &queries::snapshot_expiration_date(binding),
                true,
                true,
                &self.meta.stop,
            )
            .await?;
        Ok(should_export_with(expiration.as_deref(), &self.end_date))
    }

    async fn export_group(&self, ctx: &StepContext, exports: &[&Export]) -> WorkflowResult<()> {
        let container = &exports[0].container;
        match &container.params {
            ContainerParams::Local(params) => {
                let outputs = ctx
                    .rai
                    .execute_query_csv(
                        &ctx.rai_config,
                        &queries::export_relations_local(exports),
                        &self.meta.stop,
                    )
                    .await?;
                save_csv_output(&outputs, Path::new(&params.data_path))?;
            }
            ContainerParams::Azure(params) => {
                ctx.rai
                    .execute_query_str(
                        &ctx.rai_config,
                        queries::export_relations_azure(params, exports, &self.end_date),
                        false,
                        false,
                        &self.meta.stop,
                    )
                    .await?;
            }
            ContainerParams::Snowflake(_) => {
                warn!(
                    "Export to warehouse container '{}' is not supported",
                    container.name
                );
            }
        }
        Ok(())
    }
}

fn should_export_with(expiration_date: Option<&str>, end_date: &str) -> bool {
    match expiration_date {
        Some(expiration) => expiration <= end_date,
        None => true,
    }
}

/// Writes relation-keyed CSV strings under the local export root. Path-like
/// relation ids are flattened into file names.
fn save_csv_output(outputs: &HashMap<String, String>, data_path: &Path) -> WorkflowResult<()> {
    std::fs::create_dir_all(data_path)?;
    for (name, content) in outputs {
        let file_name = format!("{}.csv", name.replace("/:", "_"));
        std::fs::write(data_path.join(file_name), content)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportSpec {
    export_jointly: bool,
    default_container: String,
    exports: Vec<ExportEntrySpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportEntrySpec {
    #[serde(rename = "type")]
    file_type: String,
    config_rel_name: String,
    relative_path: String,
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    snapshot_binding: Option<String>,
    #[serde(default)]
    offset_by_number_of_days: u32,
    #[serde(default)]
    meta_key: Vec<String>,
    #[serde(default)]
    future: bool,
}

pub struct ExportStepFactory;

impl StepFactory for ExportStepFactory {
    fn create(
        &self,
        env: &EnvConfig,
        config: &WorkflowConfig,
        meta: StepMeta,
        raw: &serde_json::Value,
    ) -> WorkflowResult<Box<dyn WorkflowStep>> {
        let spec: ExportSpec = serde_json::from_value(raw.clone())?;
        let end_date = config.step_params.end_date.clone().ok_or_else(|| {
            WorkflowError::configuration(format!(
                "end date is required for export step '{}'",
                meta.name
            ))
        })?;
        let mut exports = Vec::new();
        for entry in spec.exports {
            if entry.future {
                continue;
            }
            let file_type = match FileType::parse(&entry.file_type) {
                Ok(file_type) => file_type,
                Err(_) => {
                    warn!(
                        "Unsupported file type '{}', skipping export '{}'",
                        entry.file_type, entry.config_rel_name
                    );
                    continue;
                }
            };
            let container_name = entry
                .container
                .as_deref()
                .unwrap_or(&spec.default_container);
            exports.push(Export {
                meta_key: entry.meta_key,
                relation: entry.config_rel_name,
                relative_path: entry.relative_path,
                file_type,
                snapshot_binding: entry.snapshot_binding,
                container: env.container(container_name)?.clone(),
                offset_by_number_of_days: entry.offset_by_number_of_days,
            });
        }
        Ok(Box::new(ExportStep {
            meta,
            exports,
            export_jointly: spec.export_jointly,
            end_date,
        }))
    }
}
