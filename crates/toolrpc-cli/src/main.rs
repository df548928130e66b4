//! toolrpc CLI: call tools on a pool of stdio tool processes.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use toolrpc_client::{ClientPool, HealthStatus, RetryCoordinator, RetryPolicy};
use toolrpc_config::{CliOverrides, Settings};

#[derive(Parser)]
#[command(
    name = "toolrpc",
    version,
    about = "Call tools on pooled JSON-RPC tool processes"
)]
struct Cli {
    /// Config file (default: ~/.toolrpc/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tool process executable (overrides TOOLRPC_COMMAND)
    #[arg(long, global = true)]
    exec: Option<String>,

    /// Argument for the tool process; repeat for several
    #[arg(long = "arg", global = true, allow_hyphen_values = true)]
    exec_args: Vec<String>,

    /// Number of tool processes to start
    #[arg(long, global = true)]
    pool_size: Option<usize>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Call a tool and print its result envelope
    Call {
        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long = "args", default_value = "{}")]
        arguments: String,

        /// Maximum attempts on connection errors (default from config)
        #[arg(long)]
        retries: Option<u32>,

        /// How long to wait for a free tool process, in milliseconds
        #[arg(long)]
        acquire_timeout_ms: Option<u64>,
    },
    /// List the tools the process exposes
    Tools,
    /// List the resources the process exposes
    Resources,
    /// Read a resource by URI
    Read {
        /// Resource URI
        uri: String,
    },
    /// Probe every pooled process and print pool statistics
    Health,
}

impl Command {
    /// Commands that only need a single process.
    fn is_discovery(&self) -> bool {
        matches!(
            self,
            Command::Tools | Command::Resources | Command::Read { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let settings = Settings::load(CliOverrides {
        config_file: cli.config,
        command: cli.exec,
        args: cli.exec_args,
        pool_size: cli.pool_size,
        request_timeout_ms: cli.request_timeout_ms,
    })
    .context("Failed to load configuration")?;

    let pool_size = if cli.command.is_discovery() {
        1
    } else {
        settings.pool.pool_size
    };
    let pool = Arc::new(ClientPool::new(
        settings.server.clone(),
        settings.pool.clone(),
    ));
    if pool.initialize(pool_size).await == 0 {
        pool.shutdown().await;
        bail!(
            "No tool process could be started with '{}'",
            settings.server.command
        );
    }

    let outcome = run(cli.command, &pool, &settings).await;
    pool.shutdown().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute one subcommand. Returns whether it succeeded.
async fn run(command: Command, pool: &Arc<ClientPool>, settings: &Settings) -> Result<bool> {
    match command {
        Command::Call {
            tool,
            arguments,
            retries,
            acquire_timeout_ms,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&arguments).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }

            let acquire_timeout = acquire_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| pool.default_acquire_timeout());
            let coordinator = RetryCoordinator::new(
                Arc::clone(pool),
                RetryPolicy::from(&settings.retry),
                acquire_timeout,
            );
            let envelope = match retries {
                Some(n) => coordinator.execute_with_retry(&tool, arguments, n).await,
                None => coordinator.execute(&tool, arguments).await,
            };
            print_json(&envelope)?;
            Ok(envelope.is_success())
        }
        Command::Tools => {
            print_json(&pool.list_tools().await)?;
            Ok(true)
        }
        Command::Resources => {
            print_json(&pool.list_resources().await)?;
            Ok(true)
        }
        Command::Read { uri } => {
            let contents = pool
                .read_resource(&uri)
                .await
                .with_context(|| format!("Failed to read resource '{uri}'"))?;
            print_json(&contents)?;
            Ok(true)
        }
        Command::Health => {
            let clients = pool.health_check().await;
            let healthy = clients.iter().all(|r| r.status == HealthStatus::Healthy);
            let stats = pool.stats().await;
            print_json(&serde_json::json!({
                "clients": clients,
                "stats": stats,
            }))?;
            Ok(healthy)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_call_with_arguments() {
        let cli = Cli::try_parse_from([
            "toolrpc",
            "--exec",
            "python3",
            "--arg",
            "server.py",
            "call",
            "echo",
            "--args",
            r#"{"x":1}"#,
            "--retries",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.exec.as_deref(), Some("python3"));
        assert_eq!(cli.exec_args, vec!["server.py"]);
        match cli.command {
            Command::Call {
                tool,
                arguments,
                retries,
                acquire_timeout_ms,
            } => {
                assert_eq!(tool, "echo");
                assert_eq!(arguments, r#"{"x":1}"#);
                assert_eq!(retries, Some(2));
                assert!(acquire_timeout_ms.is_none());
            }
            _ => panic!("Expected call subcommand"),
        }
    }

    #[test]
    fn discovery_commands_use_one_process() {
        let cli = Cli::try_parse_from(["toolrpc", "tools"]).unwrap();
        assert!(cli.command.is_discovery());
        let cli = Cli::try_parse_from(["toolrpc", "health", "--pool-size", "4"]).unwrap();
        assert!(!cli.command.is_discovery());
        assert_eq!(cli.pool_size, Some(4));
    }
}
