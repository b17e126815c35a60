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

use crate::error::{WorkflowError, WorkflowResult};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// File name suffixes the path builders accept. Everything else is skipped
/// with a debug log entry.
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["csv", "json", "jsonl", "csv.gz", "json.gz", "jsonl.gz"];

pub fn is_supported_file(file_name: &str) -> bool {
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|ext| file_name.ends_with(&format!(".{ext}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Csv,
    Json,
    Jsonl,
}

impl FileType {
    pub fn parse(value: &str) -> WorkflowResult<FileType> {
        match value.to_uppercase().as_str() {
            "CSV" => Ok(FileType::Csv),
            "JSON" => Ok(FileType::Json),
            "JSONL" => Ok(FileType::Jsonl),
            other => Err(WorkflowError::configuration(format!(
                "unsupported input format: '{other}'"
            ))),
        }
    }

    /// Name of the remote load relation used to ingest this file type.
    pub fn load_relation(&self) -> &'static str {
        match self {
            FileType::Csv => "load_csv",
            FileType::Json => "load_json",
            FileType::Jsonl => "load_jsonlines_general",
        }
    }
}

impl Display for FileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FileType::Csv => write!(f, "CSV"),
            FileType::Json => write!(f, "JSON"),
            FileType::Jsonl => write!(f, "JSONL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    Local,
    AzureBlob,
    Snowflake,
}

impl Display for ContainerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerType::Local => write!(f, "local"),
            ContainerType::AzureBlob => write!(f, "azure"),
            ContainerType::Snowflake => write!(f, "snowflake"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalContainerParams {
    pub data_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureContainerParams {
    pub account: String,
    pub container: String,
    #[serde(default)]
    pub sas: String,
    #[serde(default)]
    pub data_path: String,
}

impl AzureContainerParams {
    pub fn account_url(&self) -> String {
        format!("azure://{}.blob.core.windows.net", self.account)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowflakeContainerParams {
    pub account: String,
    pub user: String,
    pub password: String,
    pub role: String,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerParams {
    Local(LocalContainerParams),
    Azure(AzureContainerParams),
    Snowflake(SnowflakeContainerParams),
}

/// Handle to a storage backend. A process-wide read-only `name -> Container`
/// mapping is established at startup from the environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(flatten)]
    pub params: ContainerParams,
}

impl Container {
    pub fn container_type(&self) -> ContainerType {
        match &self.params {
            ContainerParams::Local(_) => ContainerType::Local,
            ContainerParams::Azure(_) => ContainerType::AzureBlob,
            ContainerParams::Snowflake(_) => ContainerType::Snowflake,
        }
    }
}

/// A file or table discovered by a path builder. `as_of_date` carries the
/// date-partition key in `YYYYMMDD` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub path: String,
    pub size: Option<u64>,
    pub as_of_date: Option<String>,
}

impl FileMetadata {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: None,
            as_of_date: None,
        }
    }

    pub fn dated(path: impl Into<String>, as_of_date: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: None,
            as_of_date: Some(as_of_date.into()),
        }
    }
}

/// Declarative description of an ingestible dataset, owned by the
/// ConfigureSources step that declared it.
#[derive(Debug, Clone)]
pub struct Source {
    pub container: Container,
    pub relation: String,
    pub relative_path: String,
    pub input_format: FileType,
    pub extensions: Vec<String>,
    pub is_chunk_partitioned: bool,
    pub is_date_partitioned: bool,
    pub loads_number_of_days: Option<u32>,
    pub offset_by_number_of_days: Option<u32>,
    pub snapshot_validity_days: Option<u32>,
    pub paths: Vec<String>,
}

impl Source {
    pub fn is_snapshot(&self) -> bool {
        self.snapshot_validity_days.is_some()
    }

    pub fn validate(&self) -> WorkflowResult<()> {
        if let Some(validity) = self.snapshot_validity_days {
            let days = self.loads_number_of_days.unwrap_or(0);
            if validity > 0 && days > 1 {
                return Err(WorkflowError::configuration(format!(
                    "source '{}': `loadsNumberOfDays` must not exceed 1 for snapshot sources",
                    self.relation
                )));
            }
            if days > validity && validity > 0 {
                return Err(WorkflowError::configuration(format!(
                    "source '{}': `loadsNumberOfDays` is greater than `snapshotValidityDays`",
                    self.relation
                )));
            }
            if let Some(offset) = self.offset_by_number_of_days {
                if offset > validity {
                    return Err(WorkflowError::configuration(format!(
                        "source '{}': `offsetByNumberOfDays` is greater than `snapshotValidityDays`",
                        self.relation
                    )));
                }
            }
        }
        if self.is_date_partitioned && self.loads_number_of_days.is_none() {
            return Err(WorkflowError::configuration(format!(
                "source '{}': `loadsNumberOfDays` is required for date partitioned sources",
                self.relation
            )));
        }
        Ok(())
    }

    pub fn to_paths_csv(&self) -> String {
        self.paths
            .iter()
            .map(|p| format!("{},{},{}", self.relation, self.container.name, p))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_chunk_partitioned_paths_csv(&self) -> String {
        self.paths
            .iter()
            .map(|p| format!("{},{},{}", self.relation, p, self.is_chunk_partitioned))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_formats_csv(&self) -> String {
        format!("{},{}", self.relation, self.input_format)
    }

    pub fn to_container_type_csv(&self) -> String {
        format!("{},{}", self.relation, self.container.container_type())
    }
}

/// Export destination description; `meta_key` selects keyed sub-relations.
#[derive(Debug, Clone)]
pub struct Export {
    pub meta_key: Vec<String>,
    pub relation: String,
    pub relative_path: String,
    pub file_type: FileType,
    pub snapshot_binding: Option<String>,
    pub container: Container,
    pub offset_by_number_of_days: u32,
}

/// A named batch configuration document. `content` is always canonical JSON;
/// YAML inputs are converted at load time.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub name: String,
    pub content: String,
}

impl BatchConfig {
    pub fn load(name: &str, path: &Path) -> WorkflowResult<BatchConfig> {
        let raw = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let value: serde_json::Value = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                WorkflowError::configuration(format!(
                    "failed to parse batch config '{}': {e}",
                    path.display()
                ))
            })?
        } else {
            serde_json::from_str(&raw)?
        };
        if value.get("workflow").and_then(|w| w.as_array()).is_none() {
            return Err(WorkflowError::configuration(format!(
                "batch config '{}' has no `workflow` step list",
                path.display()
            )));
        }
        Ok(BatchConfig {
            name: name.to_string(),
            content: value.to_string(),
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStepState {
    Init,
    InProgress,
    Success,
    Failed,
}

/// Remote view of a declared date-partitioned source, used to detect expired
/// partitions.
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredSource {
    pub source: String,
    #[serde(default)]
    pub dates: Vec<DeclaredDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredDate {
    pub date: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

pub type DeclaredSources = HashMap<String, DeclaredSource>;

fn yes_no<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(matches!(value.as_deref(), Some("Y") | Some("y")))
}

/// One entry of the loader feed computed by the remote database after source
/// configuration: a resource that is declared but not yet in the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct MissedResource {
    pub source: String,
    pub container: String,
    pub file_type: String,
    #[serde(default, deserialize_with = "yes_no")]
    pub is_date_partitioned: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub is_multi_part: bool,
    #[serde(default)]
    pub resources: Vec<ResourcePart>,
    #[serde(default)]
    pub dates: Vec<DatePartition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcePart {
    pub uri: String,
    #[serde(default)]
    pub part_index: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatePartition {
    pub date: String,
    #[serde(default)]
    pub resources: Vec<ResourcePart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionType {
    Start,
    Confirm,
    Fail,
    Retry,
}

/// A Petri-net transition handed out by the remote coordinator. The executor
/// only ever fires transitions it previously read from the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub workflow_id: String,
    pub step: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub transition_type: TransitionType,
}

/// Engine bookkeeping entry of the resource manager, keyed by size.
#[derive(Debug, Clone)]
pub struct EngineMeta {
    pub name: String,
    pub size: String,
    pub is_default: bool,
}

/// Compute context a step runs against. Cheap to clone; the engine field is
/// rebound per step by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaiConfig {
    pub engine: String,
    pub database: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_r::test;

    fn local_container() -> Container {
        Container {
            name: "default".to_string(),
            params: ContainerParams::Local(LocalContainerParams {
                data_path: "/data".to_string(),
            }),
        }
    }

    fn source(relation: &str) -> Source {
        Source {
            container: local_container(),
            relation: relation.to_string(),
            relative_path: relation.to_string(),
            input_format: FileType::Csv,
            extensions: vec!["csv".to_string()],
            is_chunk_partitioned: false,
            is_date_partitioned: false,
            loads_number_of_days: None,
            offset_by_number_of_days: None,
            snapshot_validity_days: None,
            paths: vec![],
        }
    }

    #[test]
    fn supported_extensions_cover_compressed_variants() {
        assert!(is_supported_file("part-1.csv"));
        assert!(is_supported_file("part-1.csv.gz"));
        assert!(is_supported_file("dump.jsonl"));
        assert!(!is_supported_file("part-1.parquet"));
        assert!(!is_supported_file("README.md"));
    }

    #[test]
    fn snapshot_source_rejects_multi_day_loads() {
        let mut src = source("city_data");
        src.is_date_partitioned = true;
        src.snapshot_validity_days = Some(3);
        src.loads_number_of_days = Some(2);
        assert!(src.validate().is_err());
    }

    #[test]
    fn snapshot_source_rejects_offset_beyond_validity() {
        let mut src = source("city_data");
        src.is_date_partitioned = true;
        src.snapshot_validity_days = Some(1);
        src.loads_number_of_days = Some(1);
        src.offset_by_number_of_days = Some(2);
        assert!(src.validate().is_err());
    }

    #[test]
    fn date_partitioned_source_requires_number_of_days() {
        let mut src = source("city_data");
        src.is_date_partitioned = true;
        assert!(src.validate().is_err());
        src.loads_number_of_days = Some(1);
        assert!(src.validate().is_ok());
    }

    #[test]
    fn missed_resource_parses_remote_flags() {
        let json = r#"{
            "source": "city_data",
            "container": "input",
            "file_type": "CSV",
            "is_date_partitioned": "Y",
            "is_multi_part": "Y",
            "dates": [
                {"date": "20230908", "resources": [
                    {"uri": "/city_data/data_dt=20230908/part-1.csv", "part_index": 1},
                    {"uri": "/city_data/data_dt=20230908/part-2.csv", "part_index": 2}
                ]}
            ]
        }"#;
        let resource: MissedResource = serde_json::from_str(json).unwrap();
        assert!(resource.is_date_partitioned);
        assert!(resource.is_multi_part);
        assert_eq!(resource.dates.len(), 1);
        assert_eq!(resource.dates[0].resources[1].part_index, Some(2));
        assert!(resource.resources.is_empty());
    }

    #[test]
    fn missed_resource_flags_default_to_false() {
        let json = r#"{
            "source": "master_data",
            "container": "input",
            "file_type": "JSON",
            "resources": [{"uri": "/master_data/master.json"}]
        }"#;
        let resource: MissedResource = serde_json::from_str(json).unwrap();
        assert!(!resource.is_date_partitioned);
        assert!(!resource.is_multi_part);
        assert_eq!(resource.resources[0].part_index, None);
    }

    #[test]
    fn step_state_uses_remote_wire_form() {
        assert_eq!(WorkflowStepState::InProgress.to_string(), "IN_PROGRESS");
        let state: WorkflowStepState = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(state, WorkflowStepState::Success);
    }

    #[test]
    fn transition_round_trip() {
        let json = r#"{
            "workflowId": "wf-1",
            "step": "load_city_data",
            "timestamp": "2023-09-08T10:00:00Z",
            "type": "Start"
        }"#;
        let transition: Transition = serde_json::from_str(json).unwrap();
        assert_eq!(transition.transition_type, TransitionType::Start);
        let back = serde_json::to_value(&transition).unwrap();
        assert_eq!(back["type"], "Start");
        assert_eq!(back["workflowId"], "wf-1");
    }

    #[test]
    fn container_config_is_tagged_by_type() {
        let toml = r#"
            name = "azure_input"
            type = "azure"
            account = "account1"
            container = "input"
            sas = "token"
            data_path = "enriched"
        "#;
        let container: Container = toml::from_str(toml).unwrap();
        assert_eq!(container.container_type(), ContainerType::AzureBlob);
        match &container.params {
            ContainerParams::Azure(params) => {
                assert_eq!(params.account_url(), "azure://account1.blob.core.windows.net")
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }
}
