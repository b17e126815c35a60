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

//! Client for the remote workflow coordinator. The coordinator holds the
//! workflow as a Petri net and is the single source of truth for which
//! transitions are legal; the executor only fires transitions it previously
//! read from here.

use crate::config::{new_reqwest_client, EnvConfig, HttpClientConfig};
use crate::error::{WorkflowError, WorkflowResult};
use crate::model::Transition;
use crate::rai::RaiClientLive;
use crate::retry::{poll_with_overhead, PollConfig};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn startup(&self) -> WorkflowResult<String>;
    async fn is_startup_in_progress(&self, startup_id: &str) -> WorkflowResult<bool>;
    async fn shutdown(&self) -> WorkflowResult<()>;
    async fn create_workflow(&self, batch_config: &str) -> WorkflowResult<String>;
    async fn activate_workflow(&self, workflow_id: &str) -> WorkflowResult<Vec<Transition>>;
    async fn enabled_transitions(&self, workflow_id: &str) -> WorkflowResult<Vec<Transition>>;
    async fn fire_transitions(
        &self,
        workflow_id: &str,
        transitions: &[Transition],
    ) -> WorkflowResult<Vec<Transition>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartupResponse {
    #[serde(default)]
    startup_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartupResultResponse {
    is_startup_in_progress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkflowResponse {
    workflow_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitionsResponse {
    #[serde(default)]
    transitions: Vec<Transition>,
}

pub struct CoordinatorClientLive {
    client: reqwest::Client,
    base_url: Url,
    account: String,
    rai: RaiClientLive,
}

impl CoordinatorClientLive {
    pub fn new(env: &EnvConfig, rai: RaiClientLive) -> WorkflowResult<Self> {
        Ok(Self {
            client: new_reqwest_client(&HttpClientConfig::new_for_service_calls())?,
            base_url: env.coordinator_base_url()?.clone(),
            account: env.cloud_account()?.to_string(),
            rai,
        })
    }

    fn url(&self, suffix: &str) -> WorkflowResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                WorkflowError::configuration("coordinator base url cannot be a base")
            })?;
            segments.extend(["semantic-search", "v1alpha1", self.account.as_str()]);
            segments.extend(suffix.split('/'));
        }
        Ok(url)
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<String>,
    ) -> WorkflowResult<T> {
        let token = self.rai.get_access_token().await?;
        let method_name = method.to_string();
        let mut request = self
            .client
            .request(method, url.clone())
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| WorkflowError::transport(&method_name, &url, err))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let payload = response.text().await.unwrap_or_default();
            return Err(WorkflowError::UnexpectedResponse {
                method: method_name,
                url: url.to_string(),
                status,
                payload,
            });
        }
        response
            .json()
            .await
            .map_err(|err| WorkflowError::transport(&method_name, &url, err))
    }
}

#[async_trait]
impl CoordinatorClient for CoordinatorClientLive {
    async fn startup(&self) -> WorkflowResult<String> {
        let mut url = self.url("startup")?;
        url.query_pairs_mut()
            .append_pair("pods", "1")
            .append_pair("disableWarmup", "true");
        let response: StartupResponse = self.request(reqwest::Method::POST, url, None).await?;
        Ok(response.startup_id)
    }

    async fn is_startup_in_progress(&self, startup_id: &str) -> WorkflowResult<bool> {
        let mut url = self.url("startupResult")?;
        url.query_pairs_mut().append_pair("id", startup_id);
        let response: StartupResultResponse = self.request(reqwest::Method::GET, url, None).await?;
        Ok(response.is_startup_in_progress)
    }

    async fn shutdown(&self) -> WorkflowResult<()> {
        let url = self.url("shutdown")?;
        let _: serde_json::Value = self.request(reqwest::Method::POST, url, None).await?;
        Ok(())
    }

    async fn create_workflow(&self, batch_config: &str) -> WorkflowResult<String> {
        let url = self.url("workflows")?;
        let response: CreateWorkflowResponse = self
            .request(reqwest::Method::POST, url, Some(batch_config.to_string()))
            .await?;
        Ok(response.workflow_id)
    }

    async fn activate_workflow(&self, workflow_id: &str) -> WorkflowResult<Vec<Transition>> {
        info!("Activating workflow '{workflow_id}'");
        let url = self.url(&format!("workflows/{workflow_id}/activate"))?;
        let response: TransitionsResponse = self.request(reqwest::Method::POST, url, None).await?;
        Ok(response.transitions)
    }

    async fn enabled_transitions(&self, workflow_id: &str) -> WorkflowResult<Vec<Transition>> {
        let url = self.url(&format!("workflows/{workflow_id}/transitions/enabled"))?;
        let response: TransitionsResponse = self.request(reqwest::Method::GET, url, None).await?;
        Ok(response.transitions)
    }

    async fn fire_transitions(
        &self,
        workflow_id: &str,
        transitions: &[Transition],
    ) -> WorkflowResult<Vec<Transition>> {
        debug!(
            "Firing {} transition(s) for workflow '{workflow_id}'",
            transitions.len()
        );
        let url = self.url(&format!("workflows/{workflow_id}/transitions/fire"))?;
        let body = serde_json::to_string(&serde_json::json!({ "transitions": transitions }))?;
        let response: TransitionsResponse =
            self.request(reqwest::Method::POST, url, Some(body)).await?;
        Ok(response.transitions)
    }
}

/// Waits for the coordinator warm-up triggered by `startup` to finish.
pub async fn wait_startup_complete(
    client: &dyn CoordinatorClient,
    startup_id: &str,
) -> WorkflowResult<()> {
    if startup_id.is_empty() {
        return Err(WorkflowError::configuration(
            "coordinator startup wasn't triggered",
        ));
    }
    let never = CancellationToken::new();
    poll_with_overhead(
        "coordinator startup",
        &PollConfig::for_coordinator_startup(),
        &never,
        || async move {
            let in_progress = client.is_startup_in_progress(startup_id).await?;
            debug!("Coordinator startup in progress: {in_progress}");
            Ok((!in_progress).then_some(()))
        },
    )
    .await
}
