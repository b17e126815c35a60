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
use crate::model::{DeclaredSources, FileType, Source};
use crate::paths::{self, PathsBuilder};
use crate::queries;
use crate::rai::RaiClientExt;
use crate::sources;
use crate::steps::{build_models, StepContext, StepFactory, StepMeta, WorkflowStep};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Inflates the declarative source list into concrete paths, detects expired
/// partitions and ships both the invalidation set and the new source
/// configuration to the remote database.
pub struct ConfigureSourcesStep {
    meta: StepMeta,
    config_files: Vec<String>,
    rel_config_dir: PathBuf,
    sources: Vec<Source>,
    paths_builders: HashMap<String, Arc<dyn PathsBuilder>>,
    start_date: Option<String>,
    end_date: Option<String>,
    force_reimport: bool,
    force_reimport_not_chunk_partitioned: bool,
}

#[async_trait]
impl WorkflowStep for ConfigureSourcesStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(&self, ctx: &StepContext) -> WorkflowResult<()> {
        info!("Executing ConfigureSources step..");
        self.meta.check_stop()?;
        if !self.config_files.is_empty() {
            let models = build_models(&self.config_files, &self.rel_config_dir)?;
            ctx.rai
                .install_models(&ctx.rai_config, &models, &self.meta.stop)
                .await?;
        }

        let sources = self.inflate_sources(ctx).await?;
        let expired = self.expired_partitions(ctx, &sources).await?;

        self.meta.check_stop()?;
        ctx.rai
            .execute_query_str(
                &ctx.rai_config,
                queries::discover_reimport_sources(
                    &sources,
                    &expired,
                    self.force_reimport,
                    self.force_reimport_not_chunk_partitioned,
                ),
                false,
                false,
                &self.meta.stop,
            )
            .await?;
        ctx.rai
            .execute_query_str(
                &ctx.rai_config,
                queries::populate_source_configs(&sources),
                false,
                false,
                &self.meta.stop,
            )
            .await?;
        Ok(())
    }
}

impl ConfigureSourcesStep {
    async fn inflate_sources(&self, ctx: &StepContext) -> WorkflowResult<Vec<Source>> {
        let mut sources = self.sources.clone();
        for source in &mut sources {
            self.meta.check_stop()?;
            info!("Inflating source: '{}'", source.relation);
            let days = sources::date_range(
                source,
                self.start_date.as_deref(),
                self.end_date.as_deref(),
            )?;
            if source.is_snapshot() && self.snapshot_is_valid(ctx, &source.relation).await? {
                info!(
                    "Snapshot source '{}' is still valid, skipping inflation",
                    source.relation
                );
                continue;
            }
            let builder = self.paths_builders.get(&source.container.name).ok_or_else(|| {
                WorkflowError::configuration(format!(
                    "no paths builder for container '{}'",
                    source.container.name
                ))
            })?;
            let files = builder
                .build(
                    &days,
                    &source.relative_path,
                    &source.extensions,
                    source.is_date_partitioned,
                )
                .await?;
            paths::warn_if_empty(&source.relation, &files);
            source.paths = sources::reduce_inflated_paths(source, &files);
        }
        Ok(sources)
    }

    /// A snapshot is reused while its remote expiration date reaches the end
    /// date of this run.
    async fn snapshot_is_valid(&self, ctx: &StepContext, relation: &str) -> WorkflowResult<bool> {
        let Some(end_date) = self.end_date.as_deref() else {
            return Ok(false);
        };
        let expiration = ctx
            .rai
            .execute_query_take_single(
                &ctx.rai_config,
                &queries::snapshot_expiration_date(relation),
                true,
                true,
                &self.meta.stop,
            )
            .await?;
        Ok(matches!(expiration, Some(date) if date.as_str() >= end_date))
    }

    async fn expired_partitions(
        &self,
        ctx: &StepContext,
        sources: &[Source],
    ) -> WorkflowResult<Vec<(String, String)>> {
        let declared: Option<DeclaredSources> = ctx
            .rai
            .execute_relation_json(
                &ctx.rai_config,
                queries::DECLARED_DATE_PARTITIONED_SOURCE_REL,
                true,
                &self.meta.stop,
            )
            .await?;
        let Some(declared) = declared else {
            return Ok(vec![]);
        };
        let mut expired = Vec::new();
        for source in sources {
            if !source.is_date_partitioned {
                continue;
            }
            if let Some(declared_source) = declared.get(&source.relation) {
                let days = sources::date_range(
                    source,
                    self.start_date.as_deref(),
                    self.end_date.as_deref(),
                )?;
                expired.extend(sources::expired_paths(declared_source, &days));
            }
        }
        Ok(expired)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigureSourcesSpec {
    #[serde(default)]
    config_files: Vec<String>,
    default_container: String,
    sources: Vec<SourceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceSpec {
    relation: String,
    relative_path: String,
    input_format: String,
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    extensions: Option<Vec<String>>,
    #[serde(default)]
    is_chunk_partitioned: bool,
    #[serde(default)]
    is_date_partitioned: bool,
    #[serde(default)]
    future: bool,
    #[serde(default)]
    loads_number_of_days: Option<u32>,
    #[serde(default)]
    offset_by_number_of_days: Option<u32>,
    #[serde(default)]
    snapshot_validity_days: Option<u32>,
}

pub struct ConfigureSourcesStepFactory;

impl StepFactory for ConfigureSourcesStepFactory {
    fn create(
        &self,
        env: &EnvConfig,
        config: &WorkflowConfig,
        meta: StepMeta,
        raw: &serde_json::Value,
    ) -> WorkflowResult<Box<dyn WorkflowStep>> {
        let spec: ConfigureSourcesSpec = serde_json::from_value(raw.clone())?;
        let rel_config_dir = config.step_params.rel_config_dir()?.to_path_buf();

        let mut sources = Vec::new();
        let mut relations = HashSet::new();
        for source_spec in spec.sources {
            if source_spec.future {
                continue;
            }
            if !relations.insert(source_spec.relation.clone()) {
                return Err(WorkflowError::configuration(format!(
                    "duplicate source relation '{}' in step '{}'",
                    source_spec.relation, meta.name
                )));
            }
            let container_name = source_spec
                .container
                .as_deref()
                .unwrap_or(&spec.default_container);
            let input_format = FileType::parse(&source_spec.input_format)?;
            let source = Source {
                container: env.container(container_name)?.clone(),
                extensions: source_spec
                    .extensions
                    .unwrap_or_else(|| vec![source_spec.input_format.to_lowercase()]),
                relation: source_spec.relation,
                relative_path: source_spec.relative_path,
                input_format,
                is_chunk_partitioned: source_spec.is_chunk_partitioned,
                is_date_partitioned: source_spec.is_date_partitioned,
                loads_number_of_days: source_spec.loads_number_of_days,
                offset_by_number_of_days: source_spec.offset_by_number_of_days,
                snapshot_validity_days: source_spec.snapshot_validity_days,
                paths: vec![],
            };
            source.validate()?;
            if source.is_date_partitioned && config.step_params.end_date.is_none() {
                return Err(WorkflowError::configuration(format!(
                    "end date is required for date partitioned source: {}",
                    source.relation
                )));
            }
            sources.push(source);
        }

        let paths_builders = paths::paths_builders_for_sources(&sources)?;
        Ok(Box::new(ConfigureSourcesStep {
            meta,
            config_files: spec.config_files,
            rel_config_dir,
            sources,
            paths_builders,
            start_date: config.step_params.start_date.clone(),
            end_date: config.step_params.end_date.clone(),
            force_reimport: config.step_params.force_reimport,
            force_reimport_not_chunk_partitioned: config
                .step_params
                .force_reimport_not_chunk_partitioned,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StepParams;
    use crate::model::{BatchConfig, FileMetadata, WorkflowStepState};
    use crate::testing::FakeRaiClient;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap as StdHashMap;
    use test_r::test;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct StaticPathsBuilder {
        files: Vec<FileMetadata>,
    }

    #[async_trait]
    impl PathsBuilder for StaticPathsBuilder {
        async fn build(
            &self,
            _days: &[String],
            _relative_path: &str,
            _extensions: &[String],
            _is_date_partitioned: bool,
        ) -> WorkflowResult<Vec<FileMetadata>> {
            Ok(self.files.clone())
        }
    }

    fn meta() -> StepMeta {
        StepMeta {
            idt: Uuid::new_v4(),
            name: "configure".to_string(),
            type_name: "ConfigureSources".to_string(),
            state: WorkflowStepState::Init,
            execution_time: 0.0,
            engine_size: None,
            stop: CancellationToken::new(),
        }
    }

    fn snapshot_source(validity: u32, offset: u32) -> Source {
        let env = EnvConfig::load_for_tests();
        Source {
            container: env.container("default").unwrap().clone(),
            relation: "test".to_string(),
            relative_path: "test".to_string(),
            input_format: FileType::Csv,
            extensions: vec!["csv".to_string()],
            is_chunk_partitioned: true,
            is_date_partitioned: true,
            loads_number_of_days: Some(1),
            offset_by_number_of_days: Some(offset),
            snapshot_validity_days: Some(validity),
            paths: vec![],
        }
    }

    fn step_with(
        sources: Vec<Source>,
        files: Vec<FileMetadata>,
        end_date: &str,
    ) -> ConfigureSourcesStep {
        let mut builders: StdHashMap<String, Arc<dyn PathsBuilder>> = StdHashMap::new();
        builders.insert(
            "default".to_string(),
            Arc::new(StaticPathsBuilder { files }),
        );
        ConfigureSourcesStep {
            meta: meta(),
            config_files: vec![],
            rel_config_dir: "../rel".into(),
            sources,
            paths_builders: builders,
            start_date: None,
            end_date: Some(end_date.to_string()),
            force_reimport: false,
            force_reimport_not_chunk_partitioned: false,
        }
    }

    fn ctx(client: Arc<FakeRaiClient>) -> StepContext {
        StepContext {
            env: Arc::new(EnvConfig::load_for_tests()),
            rai: client,
            rai_config: crate::model::RaiConfig {
                engine: "loader".to_string(),
                database: "loader_db".to_string(),
            },
        }
    }

    #[test]
    async fn expired_snapshot_is_reinflated_to_the_latest_day_group() {
        let client = Arc::new(
            FakeRaiClient::default().with_single_value("snapshot_validity_days", "20211231"),
        );
        let step = step_with(
            vec![snapshot_source(3, 0)],
            vec![
                FileMetadata::dated("test/test_20220103_1.csv", "20220103"),
                FileMetadata::dated("test/test_20220104_1.csv", "20220104"),
                FileMetadata::dated("test/test_20220105_1.csv", "20220105"),
                FileMetadata::dated("test/test_20220105_2.csv", "20220105"),
            ],
            "20220105",
        );
        let sources = step.inflate_sources(&ctx(client)).await.unwrap();
        assert_eq!(
            sources[0].paths,
            vec![
                "test/test_20220105_1.csv".to_string(),
                "test/test_20220105_2.csv".to_string(),
            ]
        );
    }

    #[test]
    async fn valid_snapshot_keeps_paths_empty() {
        let client = Arc::new(
            FakeRaiClient::default().with_single_value("snapshot_validity_days", "20220106"),
        );
        let step = step_with(
            vec![snapshot_source(3, 0)],
            vec![FileMetadata::dated("test/test_20220105_1.csv", "20220105")],
            "20220105",
        );
        let sources = step.inflate_sources(&ctx(client)).await.unwrap();
        assert!(sources[0].paths.is_empty());
    }

    #[test]
    async fn snapshot_expiring_on_end_date_counts_as_valid() {
        let client = Arc::new(
            FakeRaiClient::default().with_single_value("snapshot_validity_days", "20220105"),
        );
        let step = step_with(
            vec![snapshot_source(1, 0)],
            vec![FileMetadata::dated("test/test_20220105_1.csv", "20220105")],
            "20220105",
        );
        let sources = step.inflate_sources(&ctx(client)).await.unwrap();
        assert!(sources[0].paths.is_empty());
    }

    #[test]
    async fn factory_requires_end_date_for_date_partitioned_sources() {
        let env = EnvConfig::load_for_tests();
        let config = WorkflowConfig {
            batch_config: BatchConfig {
                name: "default".to_string(),
                content: "{}".to_string(),
            },
            recover: false,
            recover_step: None,
            selected_steps: vec![],
            step_params: StepParams {
                rel_config_dir: Some("../rel".into()),
                ..StepParams::default()
            },
            step_timeouts: StdHashMap::new(),
        };
        let raw = serde_json::json!({
            "idt": Uuid::new_v4().to_string(),
            "name": "configure",
            "type": "ConfigureSources",
            "configFiles": [],
            "defaultContainer": "default",
            "sources": [{
                "relation": "city_data",
                "relativePath": "city_data",
                "inputFormat": "csv",
                "isDatePartitioned": true,
                "loadsNumberOfDays": 1
            }]
        });
        let result = ConfigureSourcesStepFactory.create(&env, &config, meta(), &raw);
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[test]
    async fn factory_skips_future_sources_and_rejects_duplicates() {
        let env = EnvConfig::load_for_tests();
        let config = WorkflowConfig {
            batch_config: BatchConfig {
                name: "default".to_string(),
                content: "{}".to_string(),
            },
            recover: false,
            recover_step: None,
            selected_steps: vec![],
            step_params: StepParams {
                rel_config_dir: Some("../rel".into()),
                end_date: Some("20220105".to_string()),
                ..StepParams::default()
            },
            step_timeouts: StdHashMap::new(),
        };
        let raw = serde_json::json!({
            "idt": Uuid::new_v4().to_string(),
            "name": "configure",
            "type": "ConfigureSources",
            "configFiles": [],
            "defaultContainer": "default",
            "sources": [
                {"relation": "a", "relativePath": "a", "inputFormat": "csv"},
                {"relation": "b", "relativePath": "b", "inputFormat": "csv", "future": true},
                {"relation": "a", "relativePath": "a2", "inputFormat": "csv"}
            ]
        });
        let result = ConfigureSourcesStepFactory.create(&env, &config, meta(), &raw);
        assert!(matches!(result, Err(WorkflowError::Configuration(message)) if message.contains("duplicate")));
    }
}
