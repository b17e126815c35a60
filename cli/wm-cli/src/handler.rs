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

use crate::command::{GlobalFlags, InitArgs, RunArgs, SharedArgs};
use anyhow::{anyhow, Context};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wm_core::config::{EnvConfig, RaiProfile};
use wm_core::coordinator::{self, CoordinatorClient, CoordinatorClientLive};
use wm_core::executor::concurrent::ConcurrentWorkflowExecutor;
use wm_core::executor::simple::WorkflowExecutor;
use wm_core::executor::{self, format_duration, StepParams, WorkflowConfig};
use wm_core::manager::ResourceManager;
use wm_core::model::BatchConfig;
use wm_core::queries;
use wm_core::rai::{RaiClient, RaiClientExt, RaiClientLive};
use wm_core::steps::StepFactories;

struct Session {
    env: Arc<EnvConfig>,
    client: RaiClientLive,
    manager: ResourceManager,
}

fn open_session(global: &GlobalFlags, shared: &SharedArgs) -> anyhow::Result<Session> {
    let mut env = EnvConfig::load(&global.env_config)?;
    if let Some(retries) = shared.rai_sdk_http_retries {
        env.rai_sdk_http_retries = retries;
    }
    let profile = RaiProfile::load(&env.rai_profile_path, &env.rai_profile)?;
    let client = RaiClientLive::new(&profile, &env)?;
    let manager = ResourceManager::new(
        Arc::new(client.clone()),
        &shared.engine,
        &shared.database,
    );
    Ok(Session {
        env: Arc::new(env),
        client,
        manager,
    })
}

fn load_batch_config(shared: &SharedArgs) -> anyhow::Result<BatchConfig> {
    BatchConfig::load(&shared.batch_config_name, &shared.batch_config).with_context(|| {
        anyhow!(
            "failed to load batch config '{}'",
            shared.batch_config.display()
        )
    })
}

/// Creates the database and the default engine, installs the common models,
/// loads the batch config and resets step states. In concurrent mode the
/// workflow is additionally registered with the remote coordinator.
pub async fn handle_init(global: &GlobalFlags, args: &InitArgs) -> anyhow::Result<()> {
    let Session {
        env,
        client,
        mut manager,
    } = open_session(global, &args.shared)?;
    let batch_config = load_batch_config(&args.shared)?;

    let setup_started = Instant::now();
    manager.add_engine(&args.shared.engine_size).await?;
    manager
        .create_database(
            args.drop_db,
            args.disable_ivm,
            args.source_database.as_deref(),
        )
        .await?;
    executor::init_workflow(
        &manager.client(),
        &manager.rai_config(None),
        &batch_config,
        &args.shared.rel_config_dir,
    )
    .await?;

    if args.shared.concurrent {
        let coordinator_client = CoordinatorClientLive::new(&env, client.clone())?;
        info!("Starting workflow coordinator");
        let startup_id = coordinator_client.startup().await?;
        coordinator::wait_startup_complete(&coordinator_client, &startup_id).await?;
        let workflow_id = coordinator_client
            .create_workflow(&batch_config.content)
            .await?;
        info!("Registered workflow '{workflow_id}'");
        let never = CancellationToken::new();
        manager
            .client()
            .execute_query_str(
                &manager.rai_config(None),
                queries::update_workflow_idt(&batch_config.name, &workflow_id),
                false,
                false,
                &never,
            )
            .await?;
    }
    info!(
        "Infrastructure setup time is {}",
        format_duration(setup_started.elapsed().as_secs_f64())
    );
    Ok(())
}

/// Executes the workflow and honors the cleanup flags regardless of the
/// outcome.
pub async fn handle_run(global: &GlobalFlags, args: &RunArgs) -> anyhow::Result<()> {
    let Session {
        env,
        client,
        mut manager,
    } = open_session(global, &args.shared)?;
    let batch_config = load_batch_config(&args.shared)?;

    let config = WorkflowConfig {
        batch_config,
        recover: args.recover,
        recover_step: args.recover_step.clone(),
        selected_steps: args.selected_steps.clone(),
        step_params: StepParams {
            rel_config_dir: Some(args.shared.rel_config_dir.clone()),
            start_date: args.start_date.clone(),
            end_date: args.end_date.clone(),
            force_reimport: args.force_reimport,
            force_reimport_not_chunk_partitioned: args.force_reimport_not_chunk_partitioned,
            collapse_partitions_on_load: args.collapse_partitions_on_load,
        },
        step_timeouts: args
            .step_timeout
            .clone()
            .map(|timeouts| timeouts.0)
            .unwrap_or_default(),
    };

    manager.add_engine(&args.shared.engine_size).await?;

    let batch_config_name = config.batch_config.name.clone();
    let run_result = if args.shared.concurrent {
        let coordinator_client: Arc<dyn CoordinatorClient> =
            Arc::new(CoordinatorClientLive::new(&env, client.clone())?);
        let rai: Arc<dyn RaiClient> = manager.client();
        let never = CancellationToken::new();
        let workflow_id = rai
            .execute_query_take_single(
                &manager.rai_config(None),
                &queries::workflow_idt(&batch_config_name),
                true,
                true,
                &never,
            )
            .await?
            .ok_or_else(|| {
                anyhow!("workflow '{batch_config_name}' is not registered, run `rwm init` first")
            })?;
        let mut workflow_executor = ConcurrentWorkflowExecutor::init(
            env.clone(),
            coordinator_client,
            config,
            manager,
            workflow_id,
            StepFactories::new(),
        )
        .await?;
        let result = workflow_executor.run().await;
        finish_run(
            workflow_executor.manager_mut(),
            &batch_config_name,
            args,
            result.is_ok(),
        )
        .await;
        result
    } else {
        let mut workflow_executor =
            WorkflowExecutor::init(env.clone(), config, manager, StepFactories::new()).await?;
        let result = workflow_executor.run().await;
        finish_run(
            workflow_executor.manager_mut(),
            &batch_config_name,
            args,
            result.is_ok(),
        )
        .await;
        result
    };
    run_result?;
    Ok(())
}

/// Timing printout plus the `--cleanup-*` flags; runs after success and after
/// failure alike.
async fn finish_run(
    manager: &mut ResourceManager,
    batch_config_name: &str,
    args: &RunArgs,
    run_succeeded: bool,
) {
    if run_succeeded {
        if let Err(err) = executor::print_timings(
            &manager.client(),
            &manager.rai_config(None),
            batch_config_name,
        )
        .await
        {
            error!("Failed to read workflow timings: {err}");
        }
    }
    if args.cleanup_resources {
        if let Err(err) = manager.cleanup_resources().await {
            error!("Failed to cleanup resources: {err}");
        }
    } else {
        if args.cleanup_db {
            if let Err(err) = manager.delete_database_if_exists().await {
                error!("Failed to cleanup database: {err}");
            }
        }
        if args.cleanup_engine {
            if let Err(err) = manager.cleanup_engines().await {
                error!("Failed to cleanup engines: {err}");
            }
        }
    }
}
