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

use crate::command::GlobalFlags;
use log::Level;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// Configures tracing from the verbosity flag, writing to stderr and, when a
/// log file name is given, to `<name>.log` next to the working directory.
pub fn init_tracing(global: &GlobalFlags) -> anyhow::Result<()> {
    let Some(level) = global.verbosity.log_level() else {
        return Ok(());
    };
    let tracing_level = match level {
        Level::Error => tracing::Level::ERROR,
        Level::Warn => tracing::Level::WARN,
        Level::Info => tracing::Level::INFO,
        Level::Debug => tracing::Level::DEBUG,
        Level::Trace => tracing::Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(tracing_level).into())
        .from_env_lossy();

    let writer = match &global.log_file_name {
        Some(name) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(format!("{name}.log"))?;
            BoxMakeWriter::new(std::io::stderr.and(Arc::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(global.log_file_name.is_none())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
