//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

/// TaskBroker - request/reply tasks over AMQP
#[derive(Parser)]
#[command(
    name = "tb",
    about = "Issue tasks to a broker-connected worker and wait for replies",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/taskbroker/logs/taskbroker.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Publish a task and wait for the worker's reply
    Call {
        /// Task type, e.g. process_debtor_register
        #[arg(value_name = "TYPE")]
        task_type: String,

        /// JSON payload
        #[arg(value_parser = parse_json)]
        payload: Value,

        /// Reply timeout in milliseconds
        #[arg(short, long, default_value = "60000")]
        timeout_ms: u64,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Publish a task without waiting for a reply
    Send {
        /// Task type
        #[arg(value_name = "TYPE")]
        task_type: String,

        /// JSON payload
        #[arg(value_parser = parse_json)]
        payload: Value,
    },

    /// Process a community's debtor register
    ProcessRegister {
        /// Community name
        community: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Send a community's results email
    SendEmail {
        /// Community name
        community: String,

        /// Queue the email and return without waiting for the worker
        #[arg(long)]
        no_wait: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config,
}

/// Output format for task results
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text, json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON payload: {}", e))
}

/// Where the binary writes its log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskbroker")
        .join("logs")
        .join("taskbroker.log")
}
