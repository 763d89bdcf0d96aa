// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! pathwatch CLI
//!
//! Runs a measurement agent or a controller, and inspects probe resolution.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "pathwatch")]
#[command(author, version, about = "Agent-to-agent network path monitoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a measurement agent
    Agent {
        /// Agent config file (default: ~/.pathwatch/agent.yaml)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Agent id assigned by the controller
        #[arg(long, env = "PATHWATCH_AGENT_ID")]
        agent_id: Option<u64>,

        /// Shared-secret agent token
        #[arg(long, env = "PATHWATCH_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Controller WebSocket URL (e.g. ws://controller:8085/ws/agent)
        #[arg(long, env = "PATHWATCH_CONTROLLER_URL")]
        controller_url: Option<String>,

        /// Also write logs to ~/.pathwatch/logs/agent.log
        #[arg(long)]
        log_file: bool,
    },

    /// Run the controller
    Controller {
        /// Controller config file (default: ~/.pathwatch/controller.yaml)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Address to listen on
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,

        /// YAML seed for the in-memory store
        #[arg(long, value_name = "FILE")]
        seed: Option<PathBuf>,

        /// Append results to this JSON-lines file
        #[arg(long, value_name = "FILE")]
        results: Option<PathBuf>,

        /// Also write logs to ~/.pathwatch/logs/controller.log
        #[arg(long)]
        log_file: bool,
    },

    /// Print the probe set the controller would hand an agent
    Resolve {
        /// YAML seed for the in-memory store
        #[arg(long, value_name = "FILE")]
        seed: PathBuf,

        /// Agent to resolve for
        #[arg(long)]
        agent_id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Agent {
            config,
            agent_id,
            token,
            controller_url,
            log_file,
        }) => {
            let _guard = logging::init("agent", log_file)?;
            commands::agent::run(config, agent_id, token, controller_url).await?;
        }
        Some(Commands::Controller {
            config,
            listen,
            seed,
            results,
            log_file,
        }) => {
            let _guard = logging::init("controller", log_file)?;
            commands::controller::run(config, listen, seed, results).await?;
        }
        Some(Commands::Resolve { seed, agent_id }) => {
            let _guard = logging::init("resolve", false)?;
            commands::resolve::run(&seed, agent_id)?;
        }
        None => {
            Cli::parse_from(["pathwatch", "--help"]);
        }
    }

    Ok(())
}
