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

//! Warehouse control-plane client. Data from warehouse tables is not read by
//! the workflow manager itself; the `RAI.*` procedures start a server-side
//! stream into the compute service and this module drives and awaits them.

use crate::config::{new_reqwest_client, HttpClientConfig};
use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{RaiConfig, SnowflakeContainerParams};
use crate::retry::{poll_with_overhead, PollConfig};
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

const STREAM_HEALTH_KEY: &str = "Data stream health";
const SYNC_STATUS_KEY: &str = "Data sync status";
const TOTAL_ROWS_KEY: &str = "Latest changes written to RAI - Total rows";
const HEALTHY_STREAM_STATUS: &str = "Healthy";
const FINISHED_SYNC_STATUS: &str = "Fully synced";

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

pub struct WarehouseClient {
    client: reqwest::Client,
    params: SnowflakeContainerParams,
}

impl WarehouseClient {
    pub fn new(params: SnowflakeContainerParams) -> WorkflowResult<Self> {
        Ok(Self {
            client: new_reqwest_client(&HttpClientConfig::new_for_statements())?,
            params,
        })
    }

    fn statements_url(&self) -> WorkflowResult<Url> {
        let url = format!(
            "https://{}.snowflakecomputing.com/api/v2/statements",
            self.params.account
        );
        Url::parse(&url).map_err(|err| {
            WorkflowError::configuration(format!("invalid warehouse account url '{url}': {err}"))
        })
    }

    async fn execute_statement(&self, statement: &str) -> WorkflowResult<Vec<Vec<String>>> {
        info!("Executing warehouse command: `{}`", statement.trim());
        let url = self.statements_url()?;
        let body = serde_json::json!({
            "statement": statement,
            "database": self.params.database,
            "schema": self.params.schema,
            "warehouse": self.params.warehouse,
            "role": self.params.role,
        });
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.params.password)
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .header("User-Agent", format!("rai-workflow-manager/{}", env!("CARGO_PKG_VERSION")))
            .json(&body)
            .send()
            .await
            .map_err(|err| WorkflowError::transport("POST", &url, err))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let payload = response.text().await.unwrap_or_default();
            return Err(WorkflowError::UnexpectedResponse {
                method: "POST".to_string(),
                url: url.to_string(),
                status,
                payload,
            });
        }
        let response: StatementResponse = response
            .json()
            .await
            .map_err(|err| WorkflowError::transport("POST", &url, err))?;
        Ok(response
            .data
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| cell.map(unquote).unwrap_or_default())
                    .collect()
            })
            .collect())
    }

    /// Binds the warehouse session to the step's database and engine and
    /// starts the server-side stream for `source_table`.
    pub async fn begin_data_sync(
        &self,
        rai_config: &RaiConfig,
        source_table: &str,
        destination_relation: &str,
    ) -> WorkflowResult<()> {
        let commands = [
            format!("CALL RAI.use_rai_database('{}');", rai_config.database),
            format!("CALL RAI.use_rai_engine('{}');", rai_config.engine),
            format!(
                "CALL RAI.create_data_stream('{source_table}', '{}', 'simple_source_catalog, :{destination_relation}');",
                rai_config.database
            ),
        ];
        for command in &commands {
            self.execute_statement(command).await?;
        }
        Ok(())
    }

    pub async fn data_stream_status(
        &self,
        source_table: &str,
    ) -> WorkflowResult<HashMap<String, String>> {
        let rows = self
            .execute_statement(&format!(
                "CALL RAI.get_data_stream_status('{source_table}');"
            ))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let mut row = row.into_iter();
                Some((row.next()?, row.next()?))
            })
            .collect())
    }

    pub async fn delete_data_stream(&self, source_table: &str) -> WorkflowResult<()> {
        self.execute_statement(&format!("CALL RAI.delete_data_stream('{source_table}');"))
            .await?;
        Ok(())
    }

    /// Waits until the stream is healthy and fully synced. A non-healthy
    /// stream fails immediately; a slow one runs into the polling timeout.
    pub async fn await_data_sync(
        &self,
        source_table: &str,
        token: &CancellationToken,
    ) -> WorkflowResult<()> {
        info!("Waiting for warehouse data sync of `{source_table}`");
        poll_with_overhead(
            &format!("data sync of {source_table}"),
            &PollConfig::for_data_streams(),
            token,
            || async move {
                let status = self.data_stream_status(source_table).await?;
                let health = status
                    .get(STREAM_HEALTH_KEY)
                    .cloned()
                    .unwrap_or_default();
                if health != HEALTHY_STREAM_STATUS {
                    return Err(WorkflowError::DataStreamFailure {
                        source_table: source_table.to_string(),
                        health,
                    });
                }
                if status.get(SYNC_STATUS_KEY).map(String::as_str) == Some(FINISHED_SYNC_STATUS) {
                    let rows = status
                        .get(TOTAL_ROWS_KEY)
                        .map(String::as_str)
                        .unwrap_or("-");
                    info!("Warehouse sync finished for `{source_table}`, synced rows: {rows}");
                    return Ok(Some(()));
                }
                Ok(None)
            },
        )
        .await
    }
}

/// Procedure output values arrive quoted.
fn unquote(value: String) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .map(str::to_string)
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_r::test;

    #[test]
    fn unquote_strips_only_balanced_quotes() {
        assert_eq!(unquote("\"Healthy\"".to_string()), "Healthy");
        assert_eq!(unquote("Healthy".to_string()), "Healthy");
        assert_eq!(unquote("\"Healthy".to_string()), "\"Healthy");
    }
}
