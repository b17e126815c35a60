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
use crate::model::Container;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_RAI_PROFILE: &str = "default";
pub const DEFAULT_RAI_PROFILE_PATH: &str = "~/.rai/config";
pub const DEFAULT_HTTP_RETRIES: u32 = 3;

fn default_rai_profile() -> String {
    DEFAULT_RAI_PROFILE.to_string()
}

fn default_rai_profile_path() -> String {
    DEFAULT_RAI_PROFILE_PATH.to_string()
}

fn default_http_retries() -> u32 {
    DEFAULT_HTTP_RETRIES
}

#[derive(Debug, Clone, Deserialize)]
struct RawEnvConfig {
    #[serde(default)]
    container: Vec<Container>,
    #[serde(default = "default_rai_profile")]
    rai_profile: String,
    #[serde(default = "default_rai_profile_path")]
    rai_profile_path: String,
    #[serde(default = "default_http_retries")]
    rai_sdk_http_retries: u32,
    #[serde(default)]
    fail_on_multiple_write_txn_in_flight: bool,
    // the key spelling is part of the established config format
    #[serde(default)]
    sematic_search_base_url: Option<Url>,
    #[serde(default)]
    rai_cloud_account: Option<String>,
}

/// Process-wide environment configuration, loaded once at startup from a TOML
/// file with `WM_` env var overrides. Read-only afterwards.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    containers: HashMap<String, Container>,
    pub rai_profile: String,
    pub rai_profile_path: String,
    pub rai_sdk_http_retries: u32,
    pub fail_on_multiple_write_txn_in_flight: bool,
    pub semantic_search_base_url: Option<Url>,
    pub rai_cloud_account: Option<String>,
}

impl EnvConfig {
    pub fn load(path: &Path) -> WorkflowResult<EnvConfig> {
        let raw: RawEnvConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("WM_"))
            .extract()
            .map_err(|err| {
                WorkflowError::configuration(format!(
                    "failed to load environment config '{}': {err}",
                    path.display()
                ))
            })?;
        EnvConfig::from_raw(raw)
    }

    fn from_raw(raw: RawEnvConfig) -> WorkflowResult<EnvConfig> {
        let mut containers = HashMap::new();
        for container in raw.container {
            if containers
                .insert(container.name.clone(), container.clone())
                .is_some()
            {
                return Err(WorkflowError::configuration(format!(
                    "duplicate container name '{}'",
                    container.name
                )));
            }
        }
        Ok(EnvConfig {
            containers,
            rai_profile: raw.rai_profile,
            rai_profile_path: raw.rai_profile_path,
            rai_sdk_http_retries: raw.rai_sdk_http_retries,
            fail_on_multiple_write_txn_in_flight: raw.fail_on_multiple_write_txn_in_flight,
            semantic_search_base_url: raw.sematic_search_base_url,
            rai_cloud_account: raw.rai_cloud_account,
        })
    }

    pub fn container(&self, name: &str) -> WorkflowResult<&Container> {
        self.containers.get(name).ok_or_else(|| {
            WorkflowError::configuration(format!("container '{name}' is not configured"))
        })
    }

    pub fn containers(&self) -> &HashMap<String, Container> {
        &self.containers
    }

    pub fn coordinator_base_url(&self) -> WorkflowResult<&Url> {
        self.semantic_search_base_url.as_ref().ok_or_else(|| {
            WorkflowError::configuration(
                "`sematic_search_base_url` is required for the concurrent executor".to_string(),
            )
        })
    }

    pub fn cloud_account(&self) -> WorkflowResult<&str> {
        self.rai_cloud_account.as_deref().ok_or_else(|| {
            WorkflowError::configuration(
                "`rai_cloud_account` is required for the concurrent executor".to_string(),
            )
        })
    }
}

#[cfg(test)]
impl EnvConfig {
    /// Minimal config with a single local container, for unit tests.
    pub(crate) fn load_for_tests() -> EnvConfig {
        let raw: RawEnvConfig = toml::from_str(
            r#"
            [[container]]
            name = "default"
            type = "local"
            data_path = "/data"
            "#,
        )
        .unwrap();
        EnvConfig::from_raw(raw).unwrap()
    }
}

/// One credential profile of the remote compute SDK config file
/// (`~/.rai/config` by default).
#[derive(Debug, Clone, Deserialize)]
pub struct RaiProfile {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub client_credentials_url: Option<Url>,
}

fn default_scheme() -> String {
    "https".to_string()
}

impl RaiProfile {
    pub fn load(path: &str, profile: &str) -> WorkflowResult<RaiProfile> {
        let path = expand_home(path);
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            WorkflowError::configuration(format!(
                "failed to read profile file '{}': {err}",
                path.display()
            ))
        })?;
        let mut profiles: HashMap<String, RaiProfile> = toml::from_str(&raw).map_err(|err| {
            WorkflowError::configuration(format!(
                "failed to parse profile file '{}': {err}",
                path.display()
            ))
        })?;
        profiles.remove(profile).ok_or_else(|| {
            WorkflowError::configuration(format!(
                "profile '{profile}' not found in '{}'",
                path.display()
            ))
        })
    }

    pub fn base_url(&self) -> WorkflowResult<Url> {
        let url = match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        };
        Url::parse(&url)
            .map_err(|err| WorkflowError::configuration(format!("invalid host '{url}': {err}")))
    }

    /// Token endpoint of the client-credentials flow; defaults to the login
    /// service next to the API host.
    pub fn credentials_url(&self) -> WorkflowResult<Url> {
        match &self.client_credentials_url {
            Some(url) => Ok(url.clone()),
            None => {
                let url = format!("https://login.{}/oauth2/token", self.host);
                Url::parse(&url).map_err(|err| {
                    WorkflowError::configuration(format!("invalid credentials url '{url}': {err}"))
                })
            }
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl HttpClientConfig {
    pub fn new_for_service_calls() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Warehouse statements can be slow to return while a suspended warehouse
    /// resumes.
    pub fn new_for_statements() -> Self {
        Self {
            timeout: Some(Duration::from_secs(120)),
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

pub fn new_reqwest_client(config: &HttpClientConfig) -> WorkflowResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(connect_timeout) = config.connect_timeout {
        builder = builder.connect_timeout(connect_timeout);
    }
    builder
        .build()
        .map_err(|err| WorkflowError::configuration(format!("failed to build HTTP client: {err}")))
}
