//! Runtime configuration: defaults, CLI flags and the optional JSON file.

use clap::Parser;
use log::info;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_PORT: u16 = 27016;
pub const DEFAULT_GAME_PORT: u16 = 27015;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Command line arguments. Flags override the config file, which in turn
/// overrides the built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a JSON configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Address the cacher binds and listens on
    #[arg(short = 'b', long)]
    pub bind: Option<SocketAddr>,

    /// Address of the game server being cached
    #[arg(short = 'g', long)]
    pub game_server: Option<SocketAddr>,

    /// Number of receiver tasks
    #[arg(short = 'w', long)]
    pub threads: Option<usize>,

    /// Game server refresh interval in milliseconds
    #[arg(short = 'u', long)]
    pub update_interval: Option<u64>,

    /// Receive timeout against the game server in milliseconds
    #[arg(long)]
    pub upstream_timeout: Option<u64>,

    /// Challenge code validity in milliseconds
    #[arg(long)]
    pub challenge_ttl: Option<u64>,

    /// Challenge code cache cleaner interval in milliseconds
    #[arg(long)]
    pub cleaner_interval: Option<u64>,

    /// Challenge code count to size the cache for
    #[arg(long)]
    pub max_challenge_codes: Option<usize>,

    /// Challenge code cache concurrency level
    #[arg(long)]
    pub challenge_concurrency: Option<usize>,

    /// Socket receive buffer size in bytes
    #[arg(short = 'r', long)]
    pub recv_buffer: Option<usize>,

    /// Socket send buffer size in bytes
    #[arg(short = 's', long)]
    pub send_buffer: Option<usize>,

    /// Read buffer size per receiver task in bytes
    #[arg(long)]
    pub datagram_buffer: Option<usize>,

    /// Enable packets-per-second stats
    #[arg(short = 'p', long)]
    pub pps_stats: bool,

    /// Enable bits-per-second stats
    #[arg(long)]
    pub bps_stats: bool,
}

/// Resolved configuration, read-only for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub game_server: SocketAddr,
    pub threads: usize,
    pub update_interval: Duration,
    pub upstream_timeout: Duration,
    pub challenge_ttl: Duration,
    pub cleaner_interval: Duration,
    pub max_challenge_codes: usize,
    pub challenge_concurrency: usize,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    pub datagram_buffer_size: usize,
    pub stats_pps: bool,
    pub stats_bps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_BIND_PORT),
            game_server: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_GAME_PORT),
            threads: 2,
            update_interval: Duration::from_millis(1000),
            upstream_timeout: Duration::from_millis(2000),
            challenge_ttl: Duration::from_millis(5000),
            cleaner_interval: Duration::from_millis(1000),
            max_challenge_codes: 100_000,
            challenge_concurrency: 8,
            recv_buffer_size: 65535,
            send_buffer_size: 65535,
            datagram_buffer_size: 65535,
            stats_pps: false,
            stats_bps: false,
        }
    }
}

/// Optional knobs accepted in the JSON config file. Durations are plain
/// millisecond counts.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<SocketAddr>,
    game_server: Option<SocketAddr>,
    threads: Option<usize>,
    update_interval_ms: Option<u64>,
    upstream_timeout_ms: Option<u64>,
    challenge_ttl_ms: Option<u64>,
    cleaner_interval_ms: Option<u64>,
    max_challenge_codes: Option<usize>,
    challenge_concurrency: Option<usize>,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    datagram_buffer_size: Option<usize>,
    stats_pps: Option<bool>,
    stats_bps: Option<bool>,
}

impl Config {
    pub fn load(args: &Args) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = &args.config {
            info!("Loading configuration from {}", path.display());
            let data = fs::read_to_string(path)?;
            let file: FileConfig = serde_json::from_str(&data)?;
            config.apply_file(file);
        }

        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(bind) = file.bind {
            self.bind = bind;
        }
        if let Some(game_server) = file.game_server {
            self.game_server = game_server;
        }
        if let Some(threads) = file.threads {
            self.threads = threads;
        }
        if let Some(ms) = file.update_interval_ms {
            self.update_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.upstream_timeout_ms {
            self.upstream_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.challenge_ttl_ms {
            self.challenge_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = file.cleaner_interval_ms {
            self.cleaner_interval = Duration::from_millis(ms);
        }
        if let Some(max) = file.max_challenge_codes {
            self.max_challenge_codes = max;
        }
        if let Some(concurrency) = file.challenge_concurrency {
            self.challenge_concurrency = concurrency;
        }
        if let Some(size) = file.recv_buffer_size {
            self.recv_buffer_size = size;
        }
        if let Some(size) = file.send_buffer_size {
            self.send_buffer_size = size;
        }
        if let Some(size) = file.datagram_buffer_size {
            self.datagram_buffer_size = size;
        }
        if let Some(enabled) = file.stats_pps {
            self.stats_pps = enabled;
        }
        if let Some(enabled) = file.stats_bps {
            self.stats_bps = enabled;
        }
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(bind) = args.bind {
            self.bind = bind;
        }
        if let Some(game_server) = args.game_server {
            self.game_server = game_server;
        }
        if let Some(threads) = args.threads {
            self.threads = threads;
        }
        if let Some(ms) = args.update_interval {
            self.update_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = args.upstream_timeout {
            self.upstream_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = args.challenge_ttl {
            self.challenge_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = args.cleaner_interval {
            self.cleaner_interval = Duration::from_millis(ms);
        }
        if let Some(max) = args.max_challenge_codes {
            self.max_challenge_codes = max;
        }
        if let Some(concurrency) = args.challenge_concurrency {
            self.challenge_concurrency = concurrency;
        }
        if let Some(size) = args.recv_buffer {
            self.recv_buffer_size = size;
        }
        if let Some(size) = args.send_buffer {
            self.send_buffer_size = size;
        }
        if let Some(size) = args.datagram_buffer {
            self.datagram_buffer_size = size;
        }
        if args.pps_stats {
            self.stats_pps = true;
        }
        if args.bps_stats {
            self.stats_bps = true;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1".into()));
        }
        if self.challenge_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "challenge_concurrency must be at least 1".into(),
            ));
        }
        if self.update_interval.is_zero()
            || self.upstream_timeout.is_zero()
            || self.challenge_ttl.is_zero()
            || self.cleaner_interval.is_zero()
        {
            return Err(ConfigError::Invalid(
                "intervals and timeouts must be non-zero".into(),
            ));
        }
        if self.recv_buffer_size == 0
            || self.send_buffer_size == 0
            || self.datagram_buffer_size == 0
        {
            return Err(ConfigError::Invalid(
                "buffer sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
