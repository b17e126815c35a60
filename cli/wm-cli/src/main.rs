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

use clap::Parser;
use colored::Colorize;
use std::process::ExitCode;
use wm_cli::command::{RwmCommand, RwmSubcommand};
use wm_cli::handler;
use wm_cli::log::init_tracing;

fn main() -> ExitCode {
    let command = RwmCommand::parse();

    if let Err(err) = init_tracing(&command.global) {
        eprintln!("{}", format!("Failed to initialize logging: {err}").red());
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("{}", format!("Failed to start runtime: {err}").red());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main(command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("{}", format!("{err:#}").red());
            ExitCode::FAILURE
        }
    }
}

async fn async_main(command: RwmCommand) -> anyhow::Result<()> {
    match &command.command {
        RwmSubcommand::Init(args) => handler::handle_init(&command.global, args).await,
        RwmSubcommand::Run(args) => handler::handle_run(&command.global, args).await,
    }
}
