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
use crate::model::{
    AzureContainerParams, Container, ContainerParams, FileMetadata, LocalContainerParams,
    SnowflakeContainerParams, Source,
};
use crate::sources::DATE_PREFIX;
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Enumerates the concrete files (or tables) behind a source. One builder
/// exists per container; the ConfigureSources step assembles a registry keyed
/// by container name.
#[async_trait]
pub trait PathsBuilder: Send + Sync {
    async fn build(
        &self,
        days: &[String],
        relative_path: &str,
        extensions: &[String],
        is_date_partitioned: bool,
    ) -> WorkflowResult<Vec<FileMetadata>>;
}

fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

fn matches_extension(file_name: &str, extensions: &[String]) -> bool {
    extensions
        .iter()
        .any(|ext| file_name.ends_with(&format!(".{}", ext.to_lowercase())))
}

pub struct LocalPathsBuilder {
    params: LocalContainerParams,
}

impl LocalPathsBuilder {
    pub fn new(params: LocalContainerParams) -> Self {
        Self { params }
    }

    fn folder_paths(
        &self,
        folder: &str,
        extensions: &[String],
        as_of_date: Option<&str>,
    ) -> WorkflowResult<Vec<FileMetadata>> {
        let folder_path = Path::new(folder);
        if !folder_path.is_dir() {
            debug!("Folder '{folder}' does not exist, skipping");
            return Ok(vec![]);
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(folder_path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type()?.is_file() || !matches_extension(&file_name, extensions) {
                debug!("Skipping unsupported file '{file_name}'");
                continue;
            }
            let size = entry.metadata()?.len();
            files.push(FileMetadata {
                path: entry.path().to_string_lossy().to_string(),
                size: Some(size),
                as_of_date: as_of_date.map(str::to_string),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[async_trait]
impl PathsBuilder for LocalPathsBuilder {
    async fn build(
        &self,
        days: &[String],
        relative_path: &str,
        extensions: &[String],
        is_date_partitioned: bool,
    ) -> WorkflowResult<Vec<FileMetadata>> {
        let base = join_path(&[&self.params.data_path, relative_path]);
        if is_date_partitioned {
            let mut files = Vec::new();
            for day in days {
                let folder = join_path(&[&base, &format!("{DATE_PREFIX}{day}")]);
                files.extend(self.folder_paths(&folder, extensions, Some(day))?);
            }
            Ok(files)
        } else {
            self.folder_paths(&base, extensions, None)
        }
    }
}

pub struct AzurePathsBuilder {
    params: AzureContainerParams,
    store: Arc<dyn ObjectStore>,
}

impl AzurePathsBuilder {
    pub fn new(params: AzureContainerParams) -> WorkflowResult<Self> {
        let store = MicrosoftAzureBuilder::new()
            .with_account(&params.account)
            .with_container_name(&params.container)
            .with_config(AzureConfigKey::SasKey, &params.sas)
            .build()
            .map_err(|err| WorkflowError::ObjectStore {
                path: params.container.clone(),
                source: err,
            })?;
        Ok(Self {
            params,
            store: Arc::new(store),
        })
    }

    async fn list_prefix(
        &self,
        prefix: &str,
        extensions: &[String],
        as_of_date: Option<&str>,
    ) -> WorkflowResult<Vec<FileMetadata>> {
        debug!("Listing blobs with prefix '{prefix}'");
        let prefix_path = ObjectPath::from(prefix);
        let entries = self
            .store
            .list(Some(&prefix_path))
            .try_collect::<Vec<_>>()
            .await
            .map_err(|err| WorkflowError::ObjectStore {
                path: prefix.to_string(),
                source: err,
            })?;
        let mut files = Vec::new();
        for entry in entries {
            let location = entry.location.to_string();
            if !matches_extension(&location, extensions) {
                debug!("Skipping unsupported blob '{location}'");
                continue;
            }
            files.push(FileMetadata {
                path: format!(
                    "{}/{}/{location}",
                    self.params.account_url(),
                    self.params.container
                ),
                size: Some(entry.size as u64),
                as_of_date: as_of_date.map(str::to_string),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[async_trait]
impl PathsBuilder for AzurePathsBuilder {
    async fn build(
        &self,
        days: &[String],
        relative_path: &str,
        extensions: &[String],
        is_date_partitioned: bool,
    ) -> WorkflowResult<Vec<FileMetadata>> {
        let base = join_path(&[&self.params.data_path, relative_path]);
        if is_date_partitioned {
            let mut files = Vec::new();
            for day in days {
                let prefix = join_path(&[&base, &format!("{DATE_PREFIX}{day}")]);
                files.extend(self.list_prefix(&prefix, extensions, Some(day)).await?);
            }
            Ok(files)
        } else {
            self.list_prefix(&base, extensions, None).await
        }
    }
}

pub struct SnowflakePathsBuilder {
    params: SnowflakeContainerParams,
}

impl SnowflakePathsBuilder {
    pub fn new(params: SnowflakeContainerParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl PathsBuilder for SnowflakePathsBuilder {
    /// Warehouse sources resolve to a single synthetic table reference; the
    /// actual data never moves through the workflow manager.
    async fn build(
        &self,
        _days: &[String],
        relative_path: &str,
        _extensions: &[String],
        _is_date_partitioned: bool,
    ) -> WorkflowResult<Vec<FileMetadata>> {
        Ok(vec![FileMetadata::new(format!(
            "{}.{}.{relative_path}",
            self.params.database, self.params.schema
        ))])
    }
}

pub fn paths_builder(container: &Container) -> WorkflowResult<Arc<dyn PathsBuilder>> {
    match &container.params {
        ContainerParams::Local(params) => Ok(Arc::new(LocalPathsBuilder::new(params.clone()))),
        ContainerParams::Azure(params) => Ok(Arc::new(AzurePathsBuilder::new(params.clone())?)),
        ContainerParams::Snowflake(params) => {
            Ok(Arc::new(SnowflakePathsBuilder::new(params.clone())))
        }
    }
}

/// One builder per distinct container used by the given sources.
pub fn paths_builders_for_sources(
    sources: &[Source],
) -> WorkflowResult<HashMap<String, Arc<dyn PathsBuilder>>> {
    let mut builders: HashMap<String, Arc<dyn PathsBuilder>> = HashMap::new();
    for source in sources {
        if !builders.contains_key(&source.container.name) {
            builders.insert(source.container.name.clone(), paths_builder(&source.container)?);
        }
    }
    Ok(builders)
}

/// Shared warn for empty listings; an empty result is non-fatal.
pub fn warn_if_empty(relation: &str, files: &[FileMetadata]) {
    if files.is_empty() {
        warn!("Path builder didn't find any file for source '{relation}'");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_r::test;

    fn write_file(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"a,b\n1,2\n").unwrap();
    }

    fn exts(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    async fn local_builder_lists_date_partitions_in_day_order() {
        let root = tempfile::tempdir().unwrap();
        for day in ["20220104", "20220105"] {
            let folder = root.path().join("city_data").join(format!("data_dt={day}"));
            std::fs::create_dir_all(&folder).unwrap();
            write_file(&folder, "part-2.csv");
            write_file(&folder, "part-1.csv");
            write_file(&folder, "ignore.parquet");
        }
        let builder = LocalPathsBuilder::new(LocalContainerParams {
            data_path: root.path().to_string_lossy().to_string(),
        });
        let files = builder
            .build(
                &["20220104".to_string(), "20220105".to_string()],
                "city_data",
                &exts(&["csv"]),
                true,
            )
            .await
            .unwrap();
        assert_eq!(files.len(), 4);
        assert_eq!(files[0].as_of_date.as_deref(), Some("20220104"));
        assert!(files[0].path.ends_with("data_dt=20220104/part-1.csv"));
        assert!(files[1].path.ends_with("data_dt=20220104/part-2.csv"));
        assert_eq!(files[2].as_of_date.as_deref(), Some("20220105"));
        assert!(files.iter().all(|f| f.size == Some(8)));
    }

    #[test]
    async fn local_builder_without_partitions_lists_base_folder() {
        let root = tempfile::tempdir().unwrap();
        let folder = root.path().join("master_data");
        std::fs::create_dir_all(&folder).unwrap();
        write_file(&folder, "master.csv");
        let builder = LocalPathsBuilder::new(LocalContainerParams {
            data_path: root.path().to_string_lossy().to_string(),
        });
        let files = builder
            .build(&[], "master_data", &exts(&["csv"]), false)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].as_of_date, None);
    }

    #[test]
    async fn local_builder_returns_empty_for_missing_folder() {
        let root = tempfile::tempdir().unwrap();
        let builder = LocalPathsBuilder::new(LocalContainerParams {
            data_path: root.path().to_string_lossy().to_string(),
        });
        let files = builder
            .build(
                &["20220105".to_string()],
                "missing",
                &exts(&["csv"]),
                true,
            )
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[test]
    async fn snowflake_builder_returns_synthetic_table_entry() {
        let builder = SnowflakePathsBuilder::new(SnowflakeContainerParams {
            account: "org-acc".to_string(),
            user: "loader".to_string(),
            password: "secret".to_string(),
            role: "loader_role".to_string(),
            warehouse: "LOADER_WH".to_string(),
            database: "SOURCE_DB".to_string(),
            schema: "PUBLIC".to_string(),
        });
        let files = builder
            .build(&[], "city_data", &exts(&["csv"]), false)
            .await
            .unwrap();
        assert_eq!(files, vec![FileMetadata::new("SOURCE_DB.PUBLIC.city_data")]);
    }

    #[test]
    fn extension_matching_is_suffix_based() {
        assert!(matches_extension("part-1.csv", &exts(&["csv"])));
        assert!(matches_extension("part-1.csv.gz", &exts(&["csv.gz"])));
        assert!(!matches_extension("part-1.csv.gz", &exts(&["csv"])));
        assert!(!matches_extension("part-1.parquet", &exts(&["csv", "json"])));
    }
}
