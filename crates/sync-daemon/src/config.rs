//! Command line and environment configuration for the daemon.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use sync_core::{EngineConfig, IgnoreRules, MetadataStore, RetryConfig, TieBreak};

#[derive(Parser, Debug, Clone)]
#[command(name = "sync-daemon")]
#[command(about = "Keep a local folder in sync with a sync-server")]
pub struct Args {
    /// Path to the folder to keep in sync
    #[arg(short, long, env = "SYNC_FOLDER")]
    pub folder: PathBuf,

    /// Base URL of the sync-server
    #[arg(short, long, default_value = "http://127.0.0.1:8080", env = "SYNC_SERVER")]
    pub server: String,

    /// Seconds between full listing comparisons
    #[arg(long, default_value_t = 5, env = "SYNC_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: u64,

    /// Number of paths processed concurrently
    #[arg(long, default_value_t = 4, env = "SYNC_WORKERS")]
    pub workers: usize,

    /// Distinct pending paths before producers wait
    #[arg(long, default_value_t = 1024, env = "SYNC_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Attempts per remote call before a path is marked failed
    #[arg(long, default_value_t = 5, env = "SYNC_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Upper bound for a single remote call
    #[arg(long, default_value_t = 30, env = "SYNC_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,

    /// Side that wins a conflict whose timestamps are equal
    #[arg(long, value_enum, default_value_t = TieBreakArg::Local, env = "SYNC_TIE_BREAK")]
    pub tie_break: TieBreakArg,

    /// Extra ignore pattern (prefix or suffix of any path component); repeatable
    #[arg(long = "ignore", value_name = "PATTERN")]
    pub ignore: Vec<String>,

    /// State file location (defaults to <folder>/.sync/state.json)
    #[arg(long, env = "SYNC_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TieBreakArg {
    Local,
    Remote,
}

impl From<TieBreakArg> for TieBreak {
    fn from(arg: TieBreakArg) -> Self {
        match arg {
            TieBreakArg::Local => TieBreak::PreferLocal,
            TieBreakArg::Remote => TieBreak::PreferRemote,
        }
    }
}

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub folder: PathBuf,
    pub server: String,
    pub poll_interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub state_file: PathBuf,
    pub engine: EngineConfig,
}

impl ClientConfig {
    /// Defaults for `folder` talking to `server`.
    pub fn new(folder: PathBuf, server: impl Into<String>) -> Self {
        Self {
            state_file: MetadataStore::default_path(&folder),
            folder,
            server: server.into(),
            poll_interval: Duration::from_secs(5),
            workers: 4,
            queue_capacity: 1024,
            engine: EngineConfig::default(),
        }
    }
}

impl From<Args> for ClientConfig {
    fn from(args: Args) -> Self {
        let request_timeout = Duration::from_secs(args.request_timeout_secs.max(1));
        let retry = RetryConfig {
            max_attempts: args.max_attempts.max(1),
            request_timeout,
            ..RetryConfig::default()
        };

        Self {
            state_file: args
                .state_file
                .unwrap_or_else(|| MetadataStore::default_path(&args.folder)),
            folder: args.folder,
            server: args.server,
            poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
            workers: args.workers.max(1),
            queue_capacity: args.queue_capacity.max(1),
            engine: EngineConfig {
                tie_break: args.tie_break.into(),
                retry,
                ignore: IgnoreRules::with_extra(args.ignore),
            },
        }
    }
}
