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

//! In-memory stand-ins for the remote services, shared by the unit tests.

use crate::error::{WorkflowError, WorkflowResult};
use crate::model::RaiConfig;
use crate::queries::QueryWithInputs;
use crate::rai::{Database, Engine, Problem, RaiClient, RelationResult, Transaction, TransactionResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub engine: String,
    pub database: String,
    pub query: String,
    pub readonly: bool,
}

#[derive(Default)]
pub struct FakeRaiClient {
    pub queries: Mutex<Vec<RecordedQuery>>,
    pub engines: Mutex<HashMap<String, Engine>>,
    pub databases: Mutex<HashMap<String, Database>>,
    /// Query substring -> single string value returned as the first result.
    pub single_values: Mutex<HashMap<String, String>>,
    /// Query substring that makes `execute_query` fail.
    pub fail_on: Mutex<Option<String>>,
}

impl FakeRaiClient {
    pub fn recorded(&self) -> Vec<RecordedQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn with_single_value(self, query_part: &str, value: &str) -> Self {
        self.single_values
            .lock()
            .unwrap()
            .insert(query_part.to_string(), value.to_string());
        self
    }

    pub fn with_existing_engine(self, name: &str, size: &str) -> Self {
        self.engines.lock().unwrap().insert(
            name.to_string(),
            Engine {
                name: name.to_string(),
                size: size.to_string(),
                state: "PROVISIONED".to_string(),
            },
        );
        self
    }

    pub fn failing_on(self, query_part: &str) -> Self {
        *self.fail_on.lock().unwrap() = Some(query_part.to_string());
        self
    }
}

#[async_trait]
impl RaiClient for FakeRaiClient {
    async fn execute_query(
        &self,
        config: &RaiConfig,
        query: QueryWithInputs,
        readonly: bool,
        _ignore_problems: bool,
        token: &CancellationToken,
    ) -> WorkflowResult<TransactionResult> {
        if token.is_cancelled() {
            return Err(WorkflowError::Cancelled {
                operation: "transaction submission".to_string(),
            });
        }
        self.queries.lock().unwrap().push(RecordedQuery {
            engine: config.engine.clone(),
            database: config.database.clone(),
            query: query.query.clone(),
            readonly,
        });
        if let Some(trigger) = self.fail_on.lock().unwrap().as_ref() {
            if query.query.contains(trigger.as_str()) {
                return Err(WorkflowError::TransactionFailure {
                    txn_id: "fake-txn".to_string(),
                    state: "ABORTED".to_string(),
                });
            }
        }
        let results = self
            .single_values
            .lock()
            .unwrap()
            .iter()
            .find(|(part, _)| query.query.contains(part.as_str()))
            .map(|(_, value)| {
                vec![RelationResult {
                    relation_id: "/:output/String".to_string(),
                    columns: vec![vec![serde_json::Value::String(value.clone())]],
                }]
            })
            .unwrap_or_default();
        Ok(TransactionResult {
            transaction: Transaction {
                id: "fake-txn".to_string(),
                state: "COMPLETED".to_string(),
                read_only: readonly,
            },
            results,
            problems: Vec::<Problem>::new(),
        })
    }

    async fn get_engine(&self, name: &str) -> WorkflowResult<Option<Engine>> {
        Ok(self.engines.lock().unwrap().get(name).cloned())
    }

    async fn create_engine(&self, name: &str, size: &str) -> WorkflowResult<()> {
        self.engines.lock().unwrap().insert(
            name.to_string(),
            Engine {
                name: name.to_string(),
                size: size.to_string(),
                state: "PROVISIONED".to_string(),
            },
        );
        Ok(())
    }

    async fn delete_engine(&self, name: &str) -> WorkflowResult<()> {
        self.engines.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_database(&self, name: &str) -> WorkflowResult<Option<Database>> {
        Ok(self.databases.lock().unwrap().get(name).cloned())
    }

    async fn create_database(&self, name: &str, _clone_from: Option<&str>) -> WorkflowResult<()> {
        self.databases.lock().unwrap().insert(
            name.to_string(),
            Database {
                name: name.to_string(),
                state: "CREATED".to_string(),
            },
        );
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> WorkflowResult<()> {
        self.databases.lock().unwrap().remove(name);
        Ok(())
    }
}
