//! CLI argument parsing for pulser
//!
//! Every flag can also be set through a `PULSER_*` environment variable;
//! flags override the config file.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "pulser")]
#[command(
    author,
    version,
    about = "Relay queue messages and release them on a fixed pulse",
    long_about = None
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, env = "PULSER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", env = "PULSER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Incoming queue URL
    #[arg(long = "in-queue-url", env = "PULSER_IN_QUEUE_URL")]
    pub in_queue_url: Option<String>,

    /// Outgoing queue URL
    #[arg(long = "out-queue-url", env = "PULSER_OUT_QUEUE_URL")]
    pub out_queue_url: Option<String>,

    /// Incoming queue name (resolved to a URL at startup)
    #[arg(long = "in", env = "PULSER_IN")]
    pub in_queue_name: Option<String>,

    /// Outgoing queue name (resolved to a URL at startup)
    #[arg(long = "out", env = "PULSER_OUT")]
    pub out_queue_name: Option<String>,

    /// Emit interval, e.g. 15m or 1h
    #[arg(long = "emit-interval", env = "PULSER_EMIT_INTERVAL")]
    pub emit_interval: Option<String>,

    /// Offset added to each pulse, e.g. 5m or -30s
    #[arg(long, env = "PULSER_OFFSET", allow_hyphen_values = true)]
    pub offset: Option<String>,

    /// Queue service endpoint for the sqs backend
    #[arg(long, env = "PULSER_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Queue backend
    #[arg(long, value_enum, env = "PULSER_BACKEND")]
    pub backend: Option<Backend>,
}

/// Which [`QueueClient`](crate::queue::QueueClient) the binary talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SQS JSON protocol over HTTP
    #[default]
    Sqs,
    /// In-process queues (local dry runs)
    Memory,
}
