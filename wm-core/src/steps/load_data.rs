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
use crate::model::{
    Container, ContainerParams, ContainerType, FileType, MissedResource, ResourcePart,
};
use crate::queries::{self, QueryWithInputs};
use crate::rai::RaiClientExt;
use crate::steps::{StepContext, StepFactory, StepMeta, WorkflowStep};
use crate::warehouse::WarehouseClient;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

/// Loads every missed resource reported by the remote database after source
/// configuration. Local and object-store resources load synchronously in
/// declaration order; warehouse resources start server-side streams that are
/// awaited together at the end.
pub struct LoadDataStep {
    meta: StepMeta,
    collapse_partitions_on_load: bool,
}

#[async_trait]
impl WorkflowStep for LoadDataStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(&self, ctx: &StepContext) -> WorkflowResult<()> {
        info!("Executing LoadData step..");
        self.meta.check_stop()?;

        // drop catalog entries matching the invalidation set first
        ctx.rai
            .execute_query_str(
                &ctx.rai_config,
                queries::DELETE_REFRESHED_SOURCES_DATA,
                false,
                false,
                &self.meta.stop,
            )
            .await?;

        let missed: Option<Vec<MissedResource>> = ctx
            .rai
            .execute_relation_json(
                &ctx.rai_config,
                queries::MISSED_RESOURCES_REL,
                false,
                &self.meta.stop,
            )
            .await?;
        let missed = missed.unwrap_or_default();
        if missed.is_empty() {
            info!("Missed resources list is empty");
            return Ok(());
        }

        let (sync_resources, async_resources) = partition_resources(&ctx.env, missed)?;

        for (container, resource) in &sync_resources {
            self.meta.check_stop()?;
            self.load_sync_resource(ctx, container, resource).await?;
        }
        self.load_async_resources(ctx, &async_resources).await
    }
}

/// Splits missed resources into the synchronously loaded class (local,
/// object store) and the asynchronously synced class (warehouse), keeping
/// declaration order within each class.
fn partition_resources(
    env: &EnvConfig,
    missed: Vec<MissedResource>,
) -> WorkflowResult<(
    Vec<(Container, MissedResource)>,
    Vec<(Container, MissedResource)>,
)> {
    let mut sync_resources = Vec::new();
    let mut async_resources = Vec::new();
    for resource in missed {
        let container = env.container(&resource.container)?.clone();
        match container.container_type() {
            ContainerType::Snowflake => async_resources.push((container, resource)),
            _ => sync_resources.push((container, resource)),
        }
    }
    Ok((sync_resources, async_resources))
}

impl LoadDataStep {
    async fn load_sync_resource(
        &self,
        ctx: &StepContext,
        container: &Container,
        resource: &MissedResource,
    ) -> WorkflowResult<()> {
        let file_type = match FileType::parse(&resource.file_type) {
            Ok(file_type) => file_type,
            Err(_) => {
                error!(
                    "Unsupported file type '{}', skipping source '{}'",
                    resource.file_type, resource.source
                );
                return Ok(());
            }
        };
        if resource.is_date_partitioned {
            if self.collapse_partitions_on_load {
                let parts: Vec<&ResourcePart> = resource
                    .dates
                    .iter()
                    .flat_map(|date| &date.resources)
                    .collect();
                let first = resource.dates.first().map(|d| d.date.as_str()).unwrap_or("-");
                let last = resource.dates.last().map(|d| d.date.as_str()).unwrap_or("-");
                info!(
                    "Loading '{}' from all partitions simultaneously, range {first} to {last}",
                    resource.source
                );
                self.load_parts(ctx, container, resource, file_type, &parts)
                    .await?;
            } else {
                info!("Loading '{}' one partition at a time", resource.source);
                for date in &resource.dates {
                    self.meta.check_stop()?;
                    info!("Loading partition for date {}", date.date);
                    let parts: Vec<&ResourcePart> = date.resources.iter().collect();
                    self.load_parts(ctx, container, resource, file_type, &parts)
                        .await?;
                }
            }
        } else {
            info!("Loading master source '{}'", resource.source);
            let parts: Vec<&ResourcePart> = resource.resources.iter().collect();
            self.load_parts(ctx, container, resource, file_type, &parts)
                .await?;
        }
        Ok(())
    }

    async fn load_parts(
        &self,
        ctx: &StepContext,
        container: &Container,
        resource: &MissedResource,
        file_type: FileType,
        parts: &[&ResourcePart],
    ) -> WorkflowResult<()> {
        if parts.is_empty() {
            return Ok(());
        }
        let query = match self.build_load_query(container, resource, file_type, parts).await? {
            Some(query) => query,
            None => return Ok(()),
        };
        ctx.rai
            .execute_query(&ctx.rai_config, query, false, false, &self.meta.stop)
            .await?;
        Ok(())
    }

    async fn build_load_query(
        &self,
        container: &Container,
        resource: &MissedResource,
        file_type: FileType,
        parts: &[&ResourcePart],
    ) -> WorkflowResult<Option<QueryWithInputs>> {
        if resource.is_multi_part && !matches!(file_type, FileType::Csv | FileType::Jsonl) {
            error!(
                "Multi-part loads support only CSV and JSONL, skipping source '{}'",
                resource.source
            );
            return Ok(None);
        }
        let query = match &container.params {
            ContainerParams::Local(_) => {
                if resource.is_multi_part {
                    info!("Loading {} shards from local files", parts.len());
                    let mut contents = Vec::with_capacity(parts.len());
                    for (fallback_index, part) in parts.iter().enumerate() {
                        let index = part.part_index.unwrap_or(fallback_index as i64 + 1);
                        let data = tokio::fs::read_to_string(&part.uri).await?;
                        contents.push((index, data));
                    }
                    queries::local_load_multipart(&resource.source, file_type, &contents)
                } else {
                    info!("Loading from local file");
                    let data = tokio::fs::read_to_string(&parts[0].uri).await?;
                    queries::local_load_simple(&resource.source, file_type, data)
                }
            }
            ContainerParams::Azure(params) => {
                if resource.is_multi_part {
                    info!("Loading {} shards from object store files", parts.len());
                    let uris: Vec<(i64, String)> = parts
                        .iter()
                        .enumerate()
                        .map(|(fallback_index, part)| {
                            (
                                part.part_index.unwrap_or(fallback_index as i64 + 1),
                                part.uri.clone(),
                            )
                        })
                        .collect();
                    queries::azure_load_multipart(&resource.source, file_type, &uris, params)
                        .into()
                } else {
                    info!("Loading from object store file");
                    queries::azure_load_simple(&resource.source, file_type, &parts[0].uri, params)
                        .into()
                }
            }
            ContainerParams::Snowflake(_) => {
                return Err(WorkflowError::configuration(format!(
                    "warehouse source '{}' cannot be loaded synchronously",
                    resource.source
                )))
            }
        };
        Ok(Some(query))
    }

    /// Starts all warehouse streams sequentially (two engines must not write
    /// the same database at once), then awaits them together. Every stream
    /// that was started is deleted afterwards, success or fail.
    async fn load_async_resources(
        &self,
        ctx: &StepContext,
        resources: &[(Container, MissedResource)],
    ) -> WorkflowResult<()> {
        let mut streams = Vec::new();
        for (container, resource) in resources {
            self.meta.check_stop()?;
            let ContainerParams::Snowflake(params) = &container.params else {
                continue;
            };
            let Some(part) = resource.resources.first() else {
                error!("Warehouse source '{}' has no resources", resource.source);
                continue;
            };
            info!(
                "Starting warehouse data stream for '{}' from '{}'",
                resource.source, part.uri
            );
            let client = WarehouseClient::new(params.clone())?;
            client
                .begin_data_sync(&ctx.rai_config, &part.uri, &resource.source)
                .await?;
            streams.push((client, part.uri.clone()));
        }
        if streams.is_empty() {
            return Ok(());
        }

        info!("Waiting for {} warehouse data stream(s)", streams.len());
        let awaits = streams.iter().map(|(client, source_table)| async move {
            let result = client.await_data_sync(source_table, &self.meta.stop).await;
            if let Err(err) = client.delete_data_stream(source_table).await {
                error!("Failed to delete data stream for '{source_table}': {err}");
            }
            result
        });
        let results = futures::future::join_all(awaits).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LoadDataSpec {}

pub struct LoadDataStepFactory;

impl StepFactory for LoadDataStepFactory {
    fn create(
        &self,
        _env: &EnvConfig,
        config: &WorkflowConfig,
        meta: StepMeta,
        raw: &serde_json::Value,
    ) -> WorkflowResult<Box<dyn WorkflowStep>> {
        let _spec: LoadDataSpec = serde_json::from_value(raw.clone())?;
        Ok(Box::new(LoadDataStep {
            meta,
            collapse_partitions_on_load: config.step_params.collapse_partitions_on_load,
        }))
    }
}
