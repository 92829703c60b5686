// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Toolbus main entry point - operator CLI over the dispatch registry.
//!
//! Loads a dispatch config, registers its providers, runs one command, and
//! shuts the registry down. Useful for smoke-testing backend processes
//! outside the host application.

use clap::{Parser, Subcommand};
use tracing::warn;

use toolbus::{DispatchConfig, ExecutionContext, ToolRegistry};

/// Toolbus version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Toolbus - stdio tool dispatch for workbench backends.
#[derive(Parser)]
#[command(name = "toolbus")]
#[command(author, version, about = "Stdio tool dispatch for workbench backends", long_about = None)]
struct Cli {
    /// Path to the dispatch config file
    #[arg(short, long, env = "TOOLBUS_CONFIG", default_value = "toolbus.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every tool in the merged catalog
    ListTools {
        /// Include collision diagnostics
        #[arg(long)]
        collisions: bool,
    },
    /// Execute one tool call and print the result envelope
    Call {
        /// Tool name
        tool: String,

        /// JSON parameters
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Per-request timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// Probe every provider and print health snapshots
    Health,
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("toolbus {}", VERSION);
        return Ok(());
    }

    let config = DispatchConfig::load_from_file(&cli.config)?;
    let registry = ToolRegistry::new(config.defaults.clone());
    for spec in config.providers {
        let id = spec.id.clone();
        registry.register_stdio_provider(spec).await?;
        if registry.provider_state(&id).await != Some(toolbus::ProviderState::Ready) {
            warn!(provider = %id, "Provider did not come up ready");
        }
    }

    let outcome = run_command(&registry, cli.command).await;
    registry.shutdown().await;
    outcome
}

async fn run_command(registry: &ToolRegistry, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::ListTools { collisions } => {
            let tools = registry.list_tools().await;
            println!("{}", serde_json::to_string_pretty(&tools)?);
            if collisions {
                let collisions = registry.catalog_collisions().await;
                if !collisions.is_empty() {
                    println!("{}", serde_json::to_string_pretty(&collisions)?);
                }
            }
        }
        Commands::Call {
            tool,
            params,
            timeout_ms,
        } => {
            let parameters: serde_json::Value = serde_json::from_str(&params)
                .map_err(|e| anyhow::anyhow!("Invalid --params JSON: {}", e))?;
            let mut ctx = ExecutionContext::new(tool, parameters);
            if let Some(ms) = timeout_ms {
                ctx = ctx.with_timeout_ms(ms);
            }
            let result = registry.execute_tool(ctx).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                anyhow::bail!("tool call failed");
            }
        }
        Commands::Health => {
            // Probe live; the background monitor's cache is empty this soon
            // after startup.
            let snapshots = registry.probe_provider_health().await;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
        Commands::Version => unreachable!("handled before registry setup"),
    }
    Ok(())
}

fn init_tracing() {
    // Only initialize if trace or debug is enabled
    if std::env::var("RUST_LOG").is_ok() {
        // Let env var control logging
        tracing_subscriber::fmt::init();
    } else {
        // Default to WARN level
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .init();
    }
}
