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

use crate::config::{new_reqwest_client, EnvConfig, HttpClientConfig, RaiProfile};
use crate::error::{WorkflowError, WorkflowResult};
use crate::model::RaiConfig;
use crate::queries::{self, QueryWithInputs};
use crate::retry::{poll_with_overhead, PollConfig};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

const TERMINAL_TXN_STATES: &[&str] = &["COMPLETED", "ABORTED"];
const ENGINE_PROVISIONED_STATE: &str = "PROVISIONED";

#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Transaction {
    pub fn is_terminal(&self) -> bool {
        TERMINAL_TXN_STATES.contains(&self.state.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Problem {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_exception: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationResult {
    pub relation_id: String,
    #[serde(default)]
    pub columns: Vec<Vec<serde_json::Value>>,
}

impl RelationResult {
    /// First value of the first column, rendered as a string.
    pub fn take_single(&self) -> Option<String> {
        let value = self.columns.first()?.first()?;
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub transaction: Transaction,
    pub results: Vec<RelationResult>,
    pub problems: Vec<Problem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Engine {
    pub name: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Serialize)]
struct TransactionRequest<'a> {
    query: &'a str,
    readonly: bool,
    inputs: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    transaction: Transaction,
    #[serde(default)]
    results: Option<Vec<RelationResult>>,
    #[serde(default)]
    problems: Option<Vec<Problem>>,
}

#[derive(Debug, Deserialize)]
struct ListTransactionsResponse {
    #[serde(default)]
    transactions: Vec<Transaction>,
}

#[derive(Debug, Deserialize)]
struct EngineResponse {
    compute: Engine,
}

#[derive(Debug, Deserialize)]
struct DatabaseResponse {
    database: Database,
}

#[derive(Debug, Serialize)]
struct CreateEngineRequest<'a> {
    name: &'a str,
    size: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateDatabaseRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client for the remote relational compute service. Steps and the executor
/// depend on this trait; the live implementation talks HTTP.
#[async_trait]
pub trait RaiClient: Send + Sync {
    async fn execute_query(
        &self,
        config: &RaiConfig,
        query: QueryWithInputs,
        readonly: bool,
        ignore_problems: bool,
        token: &CancellationToken,
    ) -> WorkflowResult<TransactionResult>;

    async fn get_engine(&self, name: &str) -> WorkflowResult<Option<Engine>>;
    async fn create_engine(&self, name: &str, size: &str) -> WorkflowResult<()>;
    async fn delete_engine(&self, name: &str) -> WorkflowResult<()>;

    async fn get_database(&self, name: &str) -> WorkflowResult<Option<Database>>;
    async fn create_database(&self, name: &str, clone_from: Option<&str>) -> WorkflowResult<()>;
    async fn delete_database(&self, name: &str) -> WorkflowResult<()>;
}

/// Derived operations shared by all client implementations.
#[async_trait]
pub trait RaiClientExt: RaiClient {
    async fn execute_query_str(
        &self,
        config: &RaiConfig,
        query: impl Into<String> + Send,
        readonly: bool,
        ignore_problems: bool,
        token: &CancellationToken,
    ) -> WorkflowResult<TransactionResult> {
        self.execute_query(
            config,
            QueryWithInputs::query_only(query.into()),
            readonly,
            ignore_problems,
            token,
        )
        .await
    }

    async fn load_json(
        &self,
        config: &RaiConfig,
        relation: &str,
        data: &str,
        token: &CancellationToken,
    ) -> WorkflowResult<()> {
        info!("Loading json as '{relation}'");
        self.execute_query(config, queries::load_json(relation, data), false, false, token)
            .await?;
        Ok(())
    }

    async fn install_models(
        &self,
        config: &RaiConfig,
        models: &[(String, String)],
        token: &CancellationToken,
    ) -> WorkflowResult<()> {
        info!("Installing {} models", models.len());
        self.execute_query(config, queries::install_models(models), false, false, token)
            .await?;
        Ok(())
    }

    /// Reads a relation rendered as a JSON string on the remote side. `None`
    /// when the relation is empty.
    async fn execute_relation_json<T: DeserializeOwned + Send>(
        &self,
        config: &RaiConfig,
        relation: &str,
        ignore_problems: bool,
        token: &CancellationToken,
    ) -> WorkflowResult<Option<T>> {
        let result = self
            .execute_query_str(
                config,
                queries::output_json(relation),
                true,
                ignore_problems,
                token,
            )
            .await?;
        match result.results.first().and_then(RelationResult::take_single) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Relation-keyed CSV string outputs of a query (`def output:<name> =
    /// csv_string[...]`).
    async fn execute_query_csv(
        &self,
        config: &RaiConfig,
        query: &str,
        token: &CancellationToken,
    ) -> WorkflowResult<HashMap<String, String>> {
        let result = self
            .execute_query_str(config, query, true, false, token)
            .await?;
        let mut outputs = HashMap::new();
        for relation in &result.results {
            let name = relation
                .relation_id
                .strip_prefix("/:output/:")
                .and_then(|rest| rest.strip_suffix("/String"));
            if let (Some(name), Some(value)) = (name, relation.take_single()) {
                outputs.insert(name.to_string(), value);
            }
        }
        Ok(outputs)
    }

    async fn execute_query_take_single(
        &self,
        config: &RaiConfig,
        query: &str,
        readonly: bool,
        ignore_problems: bool,
        token: &CancellationToken,
    ) -> WorkflowResult<Option<String>> {
        let result = self
            .execute_query_str(config, query, readonly, ignore_problems, token)
            .await?;
        Ok(result.results.first().and_then(RelationResult::take_single))
    }
}

impl<C: RaiClient + ?Sized> RaiClientExt for C {}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

struct RaiContext {
    client: reqwest::Client,
    base_url: Url,
    credentials_url: Url,
    client_id: String,
    client_secret: String,
    retries: u32,
    fail_on_multiple_write_txn_in_flight: bool,
}

#[derive(Clone)]
pub struct RaiClientLive {
    context: Arc<RaiContext>,
    access_token: Arc<Mutex<Option<CachedToken>>>,
}

impl RaiClientLive {
    pub fn new(profile: &RaiProfile, env: &EnvConfig) -> WorkflowResult<Self> {
        let client = new_reqwest_client(&HttpClientConfig::new_for_service_calls())?;
        Ok(Self {
            context: Arc::new(RaiContext {
                client,
                base_url: profile.base_url()?,
                credentials_url: profile.credentials_url()?,
                client_id: profile.client_id.clone(),
                client_secret: profile.client_secret.clone(),
                retries: env.rai_sdk_http_retries,
                fail_on_multiple_write_txn_in_flight: env.fail_on_multiple_write_txn_in_flight,
            }),
            access_token: Arc::new(Mutex::new(None)),
        })
    }

    fn url(&self, segments: &[&str]) -> WorkflowResult<Url> {
        let mut url = self.context.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| WorkflowError::configuration("API base url cannot be a base"))?
            .extend(segments);
        Ok(url)
    }

    pub async fn get_access_token(&self) -> WorkflowResult<String> {
        let mut guard = self.access_token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }
        let url = self.context.credentials_url.clone();
        let response = self
            .context
            .client
            .post(url.clone())
            .json(&serde_json::json!({
                "client_id": self.context.client_id,
                "client_secret": self.context.client_secret,
                "grant_type": "client_credentials",
            }))
            .send()
            .await
            .map_err(|err| WorkflowError::transport("POST", &url, err))?;
        let response = check_response("POST", &url, response).await?;
        let token: AccessTokenResponse = response
            .json()
            .await
            .map_err(|err| WorkflowError::transport("POST", &url, err))?;
        let expires_in = token.expires_in.unwrap_or(3600);
        // refresh one minute ahead of the reported expiry
        let expires_at = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        *guard = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> WorkflowResult<Option<T>> {
        let retries = self.context.retries;
        tryhard::retry_fn(|| self.get_json_once(url.clone()))
            .retries(retries)
            .exponential_backoff(Duration::from_millis(200))
            .max_delay(Duration::from_secs(5))
            .await
    }

    async fn get_json_once<T: DeserializeOwned>(&self, url: Url) -> WorkflowResult<Option<T>> {
        let token = self.get_access_token().await?;
        let response = self
            .context
            .client
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| WorkflowError::transport("GET", &url, err))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_response("GET", &url, response).await?;
        let value = response
            .json()
            .await
            .map_err(|err| WorkflowError::transport("GET", &url, err))?;
        Ok(Some(value))
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<&B>,
    ) -> WorkflowResult<reqwest::Response> {
        let token = self.get_access_token().await?;
        let method_name = method.to_string();
        let mut request = self
            .context
            .client
            .request(method, url.clone())
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| WorkflowError::transport(&method_name, &url, err))?;
        check_response(&method_name, &url, response).await
    }

    async fn get_transaction(&self, id: &str) -> WorkflowResult<Transaction> {
        let url = self.url(&["transactions", id])?;
        let response: Option<TransactionResponse> = self.get_json(url.clone()).await?;
        response
            .map(|r| r.transaction)
            .ok_or_else(|| WorkflowError::UnexpectedResponse {
                method: "GET".to_string(),
                url: url.to_string(),
                status: 404,
                payload: format!("transaction '{id}' not found"),
            })
    }

    async fn get_transaction_results(&self, id: &str) -> WorkflowResult<Vec<RelationResult>> {
        let url = self.url(&["transactions", id, "results"])?;
        Ok(self.get_json(url).await?.unwrap_or_default())
    }

    async fn get_transaction_problems(&self, id: &str) -> WorkflowResult<Vec<Problem>> {
        let url = self.url(&["transactions", id, "problems"])?;
        Ok(self.get_json(url).await?.unwrap_or_default())
    }

    async fn assert_no_write_txn_in_flight(&self, config: &RaiConfig) -> WorkflowResult<()> {
        if !self.context.fail_on_multiple_write_txn_in_flight {
            return Ok(());
        }
        let mut url = self.url(&["transactions"])?;
        url.query_pairs_mut()
            .append_pair("engine_name", &config.engine);
        let response: Option<ListTransactionsResponse> = self.get_json(url).await?;
        let in_flight = response
            .map(|r| r.transactions)
            .unwrap_or_default()
            .into_iter()
            .any(|txn| !txn.read_only && !txn.is_terminal());
        if in_flight {
            return Err(WorkflowError::ConcurrentWriteAttempt {
                engine: config.engine.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RaiClient for RaiClientLive {
    async fn execute_query(
        &self,
        config: &RaiConfig,
        query: QueryWithInputs,
        readonly: bool,
        ignore_problems: bool,
        token: &CancellationToken,
    ) -> WorkflowResult<TransactionResult> {
        if token.is_cancelled() {
            return Err(WorkflowError::Cancelled {
                operation: "transaction submission".to_string(),
            });
        }
        if !readonly {
            self.assert_no_write_txn_in_flight(config).await?;
        }
        info!(
            "Execute query: database={} engine={} readonly={}",
            config.database, config.engine, readonly
        );
        let mut url = self.url(&["transactions"])?;
        url.query_pairs_mut()
            .append_pair("dbname", &config.database)
            .append_pair("engine_name", &config.engine);
        let request = TransactionRequest {
            query: &query.query,
            readonly,
            inputs: &query.inputs,
        };
        let response = self
            .send_json(reqwest::Method::POST, url.clone(), Some(&request))
            .await?;
        let response: TransactionResponse = response
            .json()
            .await
            .map_err(|err| WorkflowError::transport("POST", &url, err))?;
        info!("Execute query: transaction id - {}", response.transaction.id);

        // fast path: small transactions return results inline
        if let Some(results) = response.results {
            let result = TransactionResult {
                transaction: response.transaction,
                results,
                problems: response.problems.unwrap_or_default(),
            };
            return assert_problems(result, ignore_problems);
        }

        let id = response.transaction.id.clone();
        let id_ref = id.as_str();
        let transaction = poll_with_overhead(
            &format!("transaction {id}"),
            &PollConfig::for_transactions(),
            token,
            || async move {
                let transaction = self.get_transaction(id_ref).await?;
                Ok(transaction.is_terminal().then_some(transaction))
            },
        )
        .await?;
        let results = self.get_transaction_results(&id).await?;
        let problems = self.get_transaction_problems(&id).await?;
        assert_problems(
            TransactionResult {
                transaction,
                results,
                problems,
            },
            ignore_problems,
        )
    }

    async fn get_engine(&self, name: &str) -> WorkflowResult<Option<Engine>> {
        let url = self.url(&["compute", name])?;
        let response: Option<EngineResponse> = self.get_json(url).await?;
        Ok(response.map(|r| r.compute))
    }

    async fn create_engine(&self, name: &str, size: &str) -> WorkflowResult<()> {
        info!("Creating engine `{name}`");
        let url = self.url(&["compute"])?;
        self.send_json(
            reqwest::Method::PUT,
            url,
            Some(&CreateEngineRequest { name, size }),
        )
        .await?;
        let never = CancellationToken::new();
        poll_with_overhead(
            &format!("provisioning of engine {name}"),
            &PollConfig::for_engine_provisioning(),
            &never,
            || async move {
                let engine = self.get_engine(name).await?;
                Ok(engine
                    .filter(|engine| engine.state == ENGINE_PROVISIONED_STATE)
                    .map(|_| ()))
            },
        )
        .await
    }

    async fn delete_engine(&self, name: &str) -> WorkflowResult<()> {
        info!("Deleting engine `{name}`");
        let url = self.url(&["compute", name])?;
        let token = self.get_access_token().await?;
        let response = self
            .context
            .client
            .delete(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| WorkflowError::transport("DELETE", &url, err))?;
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            check_response("DELETE", &url, response).await?;
        }
        // make sure that the engine is gone before reusing the name
        let never = CancellationToken::new();
        poll_with_overhead(
            &format!("deletion of engine {name}"),
            &PollConfig::for_engine_deletion(),
            &never,
            || async move {
                let engine = self.get_engine(name).await?;
                Ok(engine.is_none().then_some(()))
            },
        )
        .await
    }

    async fn get_database(&self, name: &str) -> WorkflowResult<Option<Database>> {
        let url = self.url(&["database", name])?;
        let response: Option<DatabaseResponse> = self.get_json(url).await?;
        Ok(response.map(|r| r.database))
    }

    async fn create_database(&self, name: &str, clone_from: Option<&str>) -> WorkflowResult<()> {
        info!("Creating database `{name}`");
        if let Some(source) = clone_from {
            info!("Using `{source}` database for clone");
        }
        let url = self.url(&["database"])?;
        let token = self.get_access_token().await?;
        let response = self
            .context
            .client
            .put(url.clone())
            .bearer_auth(token)
            .json(&CreateDatabaseRequest {
                name,
                source_name: clone_from,
            })
            .send()
            .await
            .map_err(|err| WorkflowError::transport("PUT", &url, err))?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            info!("Database '{name}' already exists");
            return Ok(());
        }
        check_response("PUT", &url, response).await?;
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> WorkflowResult<()> {
        info!("Deleting database `{name}`");
        let url = self.url(&["database", name])?;
        self.send_json::<()>(reqwest::Method::DELETE, url, None)
            .await?;
        Ok(())
    }
}

fn assert_problems(
    result: TransactionResult,
    ignore_problems: bool,
) -> WorkflowResult<TransactionResult> {
    let mut has_error = false;
    for problem in &result.problems {
        if problem.is_error || problem.is_exception {
            has_error = true;
            error!(
                "Transaction problem [{}]: {}",
                problem.error_code.as_deref().unwrap_or("-"),
                problem.message
            );
            if let Some(report) = &problem.report {
                error!("{report}");
            }
        } else {
            warn!(
                "Transaction problem [{}]: {}",
                problem.error_code.as_deref().unwrap_or("-"),
                problem.message
            );
        }
    }
    let state = result.transaction.state.as_str();
    if state != "COMPLETED" || (has_error && !ignore_problems) {
        return Err(WorkflowError::TransactionFailure {
            txn_id: result.transaction.id.clone(),
            state: state.to_string(),
        });
    }
    Ok(result)
}

async fn check_response(
    method: &str,
    url: &Url,
    response: reqwest::Response,
) -> WorkflowResult<reqwest::Response> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let payload = response.text().await.unwrap_or_default();
        return Err(WorkflowError::UnexpectedResponse {
            method: method.to_string(),
            url: url.to_string(),
            status,
            payload,
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_r::test;

    fn result_with(state: &str, problems: Vec<Problem>) -> TransactionResult {
        TransactionResult {
            transaction: Transaction {
                id: "txn-1".to_string(),
                state: state.to_string(),
                read_only: true,
            },
            results: vec![],
            problems,
        }
    }

    fn problem(is_error: bool) -> Problem {
        Problem {
            error_code: Some("PARSE_ERROR".to_string()),
            message: "m".to_string(),
            report: None,
            is_error,
            is_exception: false,
        }
    }

    #[test]
    fn completed_transaction_without_problems_passes() {
        assert!(assert_problems(result_with("COMPLETED", vec![]), false).is_ok());
    }

    #[test]
    fn aborted_transaction_fails_even_when_problems_are_ignored() {
        let result = assert_problems(result_with("ABORTED", vec![]), true);
        assert!(matches!(
            result,
            Err(WorkflowError::TransactionFailure { state, .. }) if state == "ABORTED"
        ));
    }

    #[test]
    fn error_problems_fail_unless_ignored() {
        assert!(assert_problems(result_with("COMPLETED", vec![problem(true)]), false).is_err());
        assert!(assert_problems(result_with("COMPLETED", vec![problem(true)]), true).is_ok());
        assert!(assert_problems(result_with("COMPLETED", vec![problem(false)]), false).is_ok());
    }

    #[test]
    fn take_single_renders_first_value() {
        let relation = RelationResult {
            relation_id: "/:output/String".to_string(),
            columns: vec![vec![serde_json::Value::String("20220105".to_string())]],
        };
        assert_eq!(relation.take_single(), Some("20220105".to_string()));
        let empty = RelationResult {
            relation_id: "/:output/String".to_string(),
            columns: vec![],
        };
        assert_eq!(empty.take_single(), None);
    }

    #[test]
    fn csv_relation_ids_map_to_names() {
        let id = "/:output/:city_data/String";
        let name = id
            .strip_prefix("/:output/:")
            .and_then(|rest| rest.strip_suffix("/String"));
        assert_eq!(name, Some("city_data"));
    }
}
