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

use clap::{ArgAction, Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

const PROHIBITED_FILE_NAME_SYMBOLS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Parser)]
#[command(
    name = "rwm",
    version,
    about = "Batch workflow manager for the RAI compute service"
)]
pub struct RwmCommand {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: RwmSubcommand,
}

#[derive(Debug, Args)]
pub struct GlobalFlags {
    /// Path to the TOML file containing environment specific settings
    #[arg(long, global = true, default_value = "loader.toml")]
    pub env_config: PathBuf,

    /// Log file name; when set, logs are also written to `<name>.log`
    #[arg(long, global = true, value_parser = parse_log_file_name)]
    pub log_file_name: Option<String>,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(Debug, Subcommand)]
pub enum RwmSubcommand {
    /// Create the database, install the common models and register the
    /// workflow
    Init(InitArgs),
    /// Execute a workflow from a batch configuration
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct SharedArgs {
    /// Path to the batch configuration document (JSON or YAML)
    #[arg(long)]
    pub batch_config: PathBuf,

    /// The name of the batch configuration
    #[arg(long, default_value = "default")]
    pub batch_config_name: String,

    /// RAI database
    #[arg(long)]
    pub database: String,

    /// RAI engine
    #[arg(long)]
    pub engine: String,

    /// Size of the RAI engine
    #[arg(long, default_value = "XS")]
    pub engine_size: String,

    /// Directory containing the rel config files to install
    #[arg(long, default_value = "../rel")]
    pub rel_config_dir: PathBuf,

    /// HTTP retry count override for the RAI SDK
    #[arg(long)]
    pub rai_sdk_http_retries: Option<u32>,

    /// Drive the workflow through the remote coordinator (Petri-net mode)
    #[arg(long)]
    pub concurrent: bool,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    #[command(flatten)]
    pub shared: SharedArgs,

    /// RAI database to clone from
    #[arg(long)]
    pub source_database: Option<String>,

    /// Drop the RAI database before creating it
    #[arg(long)]
    pub drop_db: bool,

    /// Disable incremental view maintenance for the database
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub disable_ivm: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub shared: SharedArgs,

    /// Start date for model data, `YYYYMMDD`
    #[arg(long)]
    pub start_date: Option<String>,

    /// End date for model data, `YYYYMMDD`
    #[arg(long)]
    pub end_date: Option<String>,

    /// Force reimport of all declared sources within the date range
    #[arg(long)]
    pub force_reimport: bool,

    /// Force reimport of sources which are not chunk partitioned
    #[arg(long)]
    pub force_reimport_not_chunk_partitioned: bool,

    /// Load all partitions (and shards) of a multi-part source in one
    /// transaction
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub collapse_partitions_on_load: bool,

    /// Recover the batch run, skipping already successful steps
    #[arg(long, conflicts_with = "recover_step")]
    pub recover: bool,

    /// Recover the batch run starting from the given step
    #[arg(long)]
    pub recover_step: Option<String>,

    /// Steps from the batch config to run exclusively
    #[arg(long, value_delimiter = ',', conflicts_with = "recover_step")]
    pub selected_steps: Vec<String>,

    /// Per-step timeouts as `name=seconds` pairs separated by commas
    #[arg(long, value_parser = parse_step_timeouts)]
    pub step_timeout: Option<StepTimeouts>,

    /// Remove the RAI engine and database after the run
    #[arg(long)]
    pub cleanup_resources: bool,

    /// Remove the RAI database after the run
    #[arg(long)]
    pub cleanup_db: bool,

    /// Remove the managed RAI engines after the run
    #[arg(long)]
    pub cleanup_engine: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepTimeouts(pub HashMap<String, u64>);

fn parse_step_timeouts(argument: &str) -> Result<StepTimeouts, String> {
    let mut timeouts = HashMap::new();
    for pair in argument.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').ok_or_else(invalid_step_timeout)?;
        let seconds: u64 = value.trim().parse().map_err(|_| invalid_step_timeout())?;
        timeouts.insert(name.trim().to_string(), seconds);
    }
    Ok(StepTimeouts(timeouts))
}

fn invalid_step_timeout() -> String {
    "`--step-timeout` should be key value pairs separated by comma, values must be integers. \
     Example: `--step-timeout \"step1=10,step2=20\"`"
        .to_string()
}

fn parse_log_file_name(name: &str) -> Result<String, String> {
    if name.contains(PROHIBITED_FILE_NAME_SYMBOLS) {
        Err(format!(
            "`--log-file-name` contains prohibited symbols: {PROHIBITED_FILE_NAME_SYMBOLS:?}"
        ))
    } else {
        Ok(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use test_r::test;

    fn base_args() -> Vec<&'static str> {
        vec![
            "rwm",
            "run",
            "--batch-config",
            "batch.json",
            "--database",
            "loader_db",
            "--engine",
            "loader",
        ]
    }

    fn parse(extra: &[&str]) -> Result<RwmCommand, clap::Error> {
        let mut args = base_args();
        args.extend_from_slice(extra);
        RwmCommand::try_parse_from(args)
    }

    #[test]
    fn run_parses_with_defaults() {
        let command = parse(&[]).unwrap();
        match command.command {
            RwmSubcommand::Run(run) => {
                assert_eq!(run.shared.batch_config_name, "default");
                assert_eq!(run.shared.engine_size, "XS");
                assert!(run.collapse_partitions_on_load);
                assert!(!run.recover);
                assert!(run.step_timeout.is_none());
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn recover_and_recover_step_are_mutually_exclusive() {
        assert!(parse(&["--recover", "--recover-step", "load"]).is_err());
        assert!(parse(&["--recover"]).is_ok());
        assert!(parse(&["--recover-step", "load"]).is_ok());
    }

    #[test]
    fn selected_steps_conflict_with_recover_step() {
        assert!(parse(&["--selected-steps", "a,b", "--recover-step", "load"]).is_err());
        let command = parse(&["--selected-steps", "a,b"]).unwrap();
        match command.command {
            RwmSubcommand::Run(run) => {
                assert_eq!(run.selected_steps, vec!["a".to_string(), "b".to_string()])
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn step_timeout_parses_trimmed_key_value_pairs() {
        let timeouts = parse_step_timeouts(" step1 = 10 , step2=20 ,").unwrap();
        assert_eq!(
            timeouts.0,
            HashMap::from([("step1".to_string(), 10), ("step2".to_string(), 20)])
        );
    }

    #[test]
    fn step_timeout_rejects_non_integer_values() {
        assert!(parse_step_timeouts("step1=ten").is_err());
        assert!(parse_step_timeouts("step1").is_err());
        assert!(parse(&["--step-timeout", "step1=ten"]).is_err());
    }

    #[test]
    fn log_file_name_rejects_prohibited_symbols() {
        for name in ["a/b", "a\\b", "a:b", "a*b", "a?b", "a\"b", "a<b", "a>b", "a|b"] {
            assert!(parse_log_file_name(name).is_err(), "accepted {name}");
        }
        assert_eq!(parse_log_file_name("rwm").unwrap(), "rwm");
    }

    #[test]
    fn collapse_partitions_can_be_disabled_with_a_value() {
        let command = parse(&["--collapse-partitions-on-load", "false"]).unwrap();
        match command.command {
            RwmSubcommand::Run(run) => assert!(!run.collapse_partitions_on_load),
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }
}
