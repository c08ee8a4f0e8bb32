//! TaskBroker - request/reply tasks over AMQP
//!
//! CLI entry point for issuing tasks to the worker.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use serde_json::Value;
use tracing::info;

use taskbroker::cli::{Cli, Command, OutputFormat, get_log_path};
use taskbroker::config::Config;
use taskbroker::rpc::{RpcClient, RpcHandle};
use taskbroker::tasks::{TaskKind, TaskResponse, TaskService};
use taskbroker::AmqpConnector;

fn setup_logging(level: &str) -> Result<()> {
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let level: tracing::Level = level
        .parse()
        .map_err(|_| eyre!("Invalid log level: {}", level))?;
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration, then environment overrides
    let config = Config::resolve(cli.config.as_ref()).context("Failed to load configuration")?;

    // Log level priority: CLI > config > INFO
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    info!(
        "TaskBroker loaded config: broker={}, queue={}",
        config.broker.redacted_uri(),
        config.broker.queue
    );

    match cli.command {
        Command::Call {
            task_type,
            payload,
            timeout_ms,
            format,
        } => cmd_call(&config, &task_type, payload, timeout_ms, format).await,
        Command::Send { task_type, payload } => cmd_send(&config, &task_type, payload).await,
        Command::ProcessRegister { community, format } => {
            cmd_task(&config, TaskKind::ProcessDebtorRegister, &community, format).await
        }
        Command::SendEmail {
            community,
            no_wait,
            format,
        } => {
            if no_wait {
                cmd_queue_email(&config, &community).await
            } else {
                cmd_task(&config, TaskKind::SendEmail, &community, format).await
            }
        }
        Command::Config => cmd_config(&config),
    }
}

/// Start an RPC client against the configured broker
fn start_client(config: &Config) -> RpcHandle {
    let connector = Arc::new(AmqpConnector::from_config(&config.broker));
    let (handle, _task) = RpcClient::new(&config.client, config.broker.queue.clone(), connector).spawn();
    handle
}

async fn stop_client(handle: &RpcHandle) {
    if let Err(e) = handle.shutdown().await {
        tracing::debug!(error = %e, "Client already stopped");
    }
}

/// Issue a raw request/reply call
async fn cmd_call(config: &Config, task_type: &str, payload: Value, timeout_ms: u64, format: OutputFormat) -> Result<()> {
    let handle = start_client(config);
    let outcome = handle
        .call(task_type, payload, Duration::from_millis(timeout_ms))
        .await;
    stop_client(&handle).await;

    let reply = outcome.context(format!("Call to {} failed", task_type))?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reply)?),
        OutputFormat::Text => {
            println!("{} Reply to {}", "✓".green(), task_type.cyan());
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }
    Ok(())
}

/// Publish a task without waiting
async fn cmd_send(config: &Config, task_type: &str, payload: Value) -> Result<()> {
    let handle = start_client(config);
    let outcome = handle.send(task_type, payload).await;
    stop_client(&handle).await;

    outcome.context(format!("Failed to send {}", task_type))?;
    println!("{} Sent {} to {}", "✓".green(), task_type.cyan(), config.broker.queue);
    Ok(())
}

/// Run one of the worker's tasks and report it the way the HTTP layer would
async fn cmd_task(config: &Config, kind: TaskKind, community: &str, format: OutputFormat) -> Result<()> {
    let handle = start_client(config);
    let service = TaskService::new(handle.clone(), config.tasks.clone());
    let outcome = match kind {
        TaskKind::ProcessDebtorRegister => service.process_debtor_register(community).await,
        TaskKind::SendEmail => service.send_email(community).await,
    };
    stop_client(&handle).await;

    let (status, response) = TaskResponse::from_outcome(kind, outcome);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Text => print_response(kind, status, &response)?,
    }

    if response.success {
        Ok(())
    } else {
        Err(eyre!("{} failed with status {}", kind, status))
    }
}

fn print_response(kind: TaskKind, status: u16, response: &TaskResponse) -> Result<()> {
    if response.success {
        println!("{} {} completed", "✓".green(), kind.to_string().cyan());
        if let Some(data) = &response.data {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
    } else {
        let error = response.error.as_deref().unwrap_or("unknown error");
        println!("{} {} [{}] {}", "✗".red(), kind.to_string().cyan(), status, error);
    }
    Ok(())
}

async fn cmd_queue_email(config: &Config, community: &str) -> Result<()> {
    let handle = start_client(config);
    let service = TaskService::new(handle.clone(), config.tasks.clone());
    let outcome = service.queue_email(community).await;
    stop_client(&handle).await;

    outcome.context("Failed to queue email")?;
    println!("{} Queued {} for {}", "✓".green(), TaskKind::SendEmail.to_string().cyan(), community);
    Ok(())
}

/// Print the effective configuration
fn cmd_config(config: &Config) -> Result<()> {
    print!("{}", config.to_redacted_yaml()?);
    Ok(())
}
