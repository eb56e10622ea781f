// Copyright 2024 Golem Cloud
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

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use conveyor_common::tracing::init_tracing_with_default_env_filter;
use conveyor_worker::config::make_config_loader;
use conveyor_worker::metrics;
use conveyor_worker::model::TaskId;
use conveyor_worker::run_task_child;

#[derive(Parser, Debug)]
#[command(name = "conveyor-worker", version)]
struct Cli {
    /// Print the default configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
    /// Print the example configurations as TOML and exit
    #[arg(long)]
    dump_config_examples: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker loop
    Run {
        /// Process tasks until the queue is empty, then exit
        #[arg(long)]
        burst: bool,
    },
    /// Execute a single task; spawned by a supervising worker
    ExecuteTask {
        #[arg(long)]
        task_id: Uuid,
        #[arg(long)]
        working_dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dump_config || cli.dump_config_examples {
        make_config_loader().load_or_dump_config();
        return Ok(());
    }

    let config = make_config_loader()
        .load()
        .context("failed to load configuration")?;

    init_tracing_with_default_env_filter(&config.tracing);
    let _registry = metrics::register_all();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Some(Command::ExecuteTask {
            task_id,
            working_dir,
        }) => {
            let code = runtime.block_on(run_task_child(config, TaskId(task_id), working_dir))?;
            std::process::exit(code);
        }
        Some(Command::Run { burst }) => runtime.block_on(conveyor_worker::run(config, burst)),
        None => runtime.block_on(conveyor_worker::run(config, false)),
    }
}
