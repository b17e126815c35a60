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

use crate::error::WorkflowResult;
use crate::model::{EngineMeta, RaiConfig};
use crate::queries;
use crate::rai::{RaiClient, RaiClientExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Owns the lifecycle of remote engines and the database. The engine table is
/// keyed by size and only ever mutated from the executor's main loop; the
/// first registered engine adopts the base engine name and becomes the
/// default.
pub struct ResourceManager {
    rai: Arc<dyn RaiClient>,
    base: RaiConfig,
    engines: HashMap<String, EngineMeta>,
}

fn normalize_size(size: &str) -> String {
    size.to_uppercase()
}

impl ResourceManager {
    pub fn new(rai: Arc<dyn RaiClient>, engine: &str, database: &str) -> Self {
        Self {
            rai,
            base: RaiConfig {
                engine: engine.to_string(),
                database: database.to_string(),
            },
            engines: HashMap::new(),
        }
    }

    pub fn client(&self) -> Arc<dyn RaiClient> {
        self.rai.clone()
    }

    /// Compute context with the engine rebound to the managed engine of
    /// `size`, or the base engine when no engine is managed for it.
    pub fn rai_config(&self, size: Option<&str>) -> RaiConfig {
        let mut config = self.base.clone();
        if let Some(size) = size {
            if let Some(meta) = self.engines.get(&normalize_size(size)) {
                config.engine = meta.name.clone();
            }
        }
        config
    }

    pub fn engine_size(&self, size: &str) -> Option<&EngineMeta> {
        self.engines.get(&normalize_size(size))
    }

    /// Ensures an engine of the given size exists and is managed. The first
    /// engine adopts the base engine name; later sizes get synthetic names.
    pub async fn add_engine(&mut self, size: &str) -> WorkflowResult<()> {
        let size = normalize_size(size);
        if self.engines.contains_key(&size) {
            return Ok(());
        }
        let is_default = self.engines.is_empty();
        let name = if is_default {
            self.base.engine.clone()
        } else {
            format!("wm-{}-{}", size.to_lowercase(), Uuid::new_v4())
        };
        if self.rai.get_engine(&name).await?.is_none() {
            self.rai.create_engine(&name, &size).await?;
        } else {
            info!("Engine `{name}` already exists");
        }
        self.engines.insert(
            size.clone(),
            EngineMeta {
                name,
                size,
                is_default,
            },
        );
        Ok(())
    }

    /// Deletes the managed engine of `size` and drops the mapping. The
    /// default engine survives until global cleanup.
    pub async fn remove_engine(&mut self, size: &str) -> WorkflowResult<()> {
        let size = normalize_size(size);
        match self.engines.get(&size) {
            Some(meta) if meta.is_default => {
                warn!("Cannot remove default engine `{}`", meta.name);
                Ok(())
            }
            Some(meta) => {
                let name = meta.name.clone();
                self.rai.delete_engine(&name).await?;
                self.engines.remove(&size);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Force-recreates the engine of `size`.
    pub async fn provision_engine(&mut self, size: &str) -> WorkflowResult<()> {
        let size = normalize_size(size);
        let name = match self.engines.get(&size) {
            Some(meta) => meta.name.clone(),
            None => self.base.engine.clone(),
        };
        info!("Provisioning engine `{name}`");
        if self.rai.get_engine(&name).await?.is_some() {
            self.rai.delete_engine(&name).await?;
        }
        self.rai.create_engine(&name, &size).await?;
        let is_default = self
            .engines
            .get(&size)
            .map(|meta| meta.is_default)
            .unwrap_or_else(|| self.engines.is_empty());
        self.engines.insert(
            size.clone(),
            EngineMeta {
                name,
                size,
                is_default,
            },
        );
        Ok(())
    }

    pub async fn create_database(
        &self,
        drop_first: bool,
        disable_incremental_maintenance: bool,
        source_db: Option<&str>,
    ) -> WorkflowResult<()> {
        if drop_first {
            self.delete_database_if_exists().await?;
        }
        self.rai
            .create_database(&self.base.database, source_db)
            .await?;
        if disable_incremental_maintenance {
            info!("Disabling IVM for `{}`", self.base.database);
            let never = CancellationToken::new();
            self.rai
                .execute_query_str(&self.base, queries::DISABLE_IVM, false, false, &never)
                .await?;
        }
        Ok(())
    }

    pub async fn delete_database_if_exists(&self) -> WorkflowResult<()> {
        if self.rai.get_database(&self.base.database).await?.is_some() {
            self.rai.delete_database(&self.base.database).await?;
        }
        Ok(())
    }

    /// Deletes every managed engine, the default one last.
    pub async fn cleanup_engines(&mut self) -> WorkflowResult<()> {
        let sizes: Vec<String> = self.engines.keys().cloned().collect();
        for size in &sizes {
            if !self.engines[size].is_default {
                let name = self.engines[size].name.clone();
                self.rai.delete_engine(&name).await?;
                self.engines.remove(size);
            }
        }
        let default: Vec<String> = self.engines.keys().cloned().collect();
        for size in default {
            let name = self.engines[&size].name.clone();
            self.rai.delete_engine(&name).await?;
            self.engines.remove(&size);
        }
        Ok(())
    }

    /// Deletes the database and every managed engine.
    pub async fn cleanup_resources(&mut self) -> WorkflowResult<()> {
        self.delete_database_if_exists().await?;
        self.cleanup_engines().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRaiClient;
    use pretty_assertions::assert_eq;
    use test_r::test;

    fn manager(client: FakeRaiClient) -> (Arc<FakeRaiClient>, ResourceManager) {
        let client = Arc::new(client);
        let manager = ResourceManager::new(client.clone(), "loader", "loader_db");
        (client, manager)
    }

    #[test]
    async fn first_engine_adopts_base_name_and_becomes_default() {
        let (client, mut manager) = manager(FakeRaiClient::default());
        manager.add_engine("xs").await.unwrap();
        assert!(client.engines.lock().unwrap().contains_key("loader"));
        let meta = manager.engine_size("XS").unwrap();
        assert_eq!(meta.name, "loader");
        assert!(meta.is_default);
        assert_eq!(manager.rai_config(Some("xs")).engine, "loader");
    }

    #[test]
    async fn existing_default_engine_is_not_recreated() {
        let (client, mut manager) =
            manager(FakeRaiClient::default().with_existing_engine("loader", "XS"));
        manager.add_engine("XS").await.unwrap();
        assert_eq!(client.engines.lock().unwrap().len(), 1);
    }

    #[test]
    async fn second_size_gets_a_synthetic_managed_engine() {
        let (client, mut manager) = manager(FakeRaiClient::default());
        manager.add_engine("XS").await.unwrap();
        manager.add_engine("M").await.unwrap();
        let meta = manager.engine_size("m").unwrap().clone();
        assert!(meta.name.starts_with("wm-m-"));
        assert!(!meta.is_default);
        assert_eq!(manager.rai_config(Some("M")).engine, meta.name);
        assert_eq!(manager.rai_config(None).engine, "loader");
        assert_eq!(client.engines.lock().unwrap().len(), 2);
    }

    #[test]
    async fn add_engine_is_idempotent_per_size() {
        let (client, mut manager) = manager(FakeRaiClient::default());
        manager.add_engine("XS").await.unwrap();
        manager.add_engine("XS").await.unwrap();
        assert_eq!(client.engines.lock().unwrap().len(), 1);
    }

    #[test]
    async fn remove_engine_refuses_the_default() {
        let (client, mut manager) = manager(FakeRaiClient::default());
        manager.add_engine("XS").await.unwrap();
        manager.remove_engine("XS").await.unwrap();
        assert!(client.engines.lock().unwrap().contains_key("loader"));
        assert!(manager.engine_size("XS").is_some());
    }

    #[test]
    async fn remove_engine_drops_managed_mapping() {
        let (client, mut manager) = manager(FakeRaiClient::default());
        manager.add_engine("XS").await.unwrap();
        manager.add_engine("M").await.unwrap();
        manager.remove_engine("M").await.unwrap();
        assert!(manager.engine_size("M").is_none());
        assert_eq!(client.engines.lock().unwrap().len(), 1);
        // size falls back to the base engine once unmanaged
        assert_eq!(manager.rai_config(Some("M")).engine, "loader");
    }

    #[test]
    async fn cleanup_engines_deletes_default_last() {
        let (client, mut manager) = manager(FakeRaiClient::default());
        manager.add_engine("XS").await.unwrap();
        manager.add_engine("M").await.unwrap();
        manager.cleanup_engines().await.unwrap();
        assert!(client.engines.lock().unwrap().is_empty());
        assert!(manager.engine_size("XS").is_none());
    }

    #[test]
    async fn create_database_can_disable_incremental_maintenance() {
        let (client, manager) = manager(FakeRaiClient::default());
        manager.create_database(false, true, None).await.unwrap();
        assert!(client.databases.lock().unwrap().contains_key("loader_db"));
        let recorded = client.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].query.contains("disable_ivm"));
        assert!(!recorded[0].readonly);
    }

    #[test]
    async fn cleanup_resources_removes_database_and_engines() {
        let (client, mut manager) = manager(FakeRaiClient::default());
        manager.add_engine("XS").await.unwrap();
        manager.create_database(false, false, None).await.unwrap();
        manager.cleanup_resources().await.unwrap();
        assert!(client.databases.lock().unwrap().is_empty());
        assert!(client.engines.lock().unwrap().is_empty());
    }
}
