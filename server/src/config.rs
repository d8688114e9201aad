//! Command line arguments and validated server configuration.
//!
//! Parsing and validation are separate steps: `Args` is whatever clap accepted,
//! `ServerConfig` is what the server actually runs with. A missing persistence
//! location is a startup error, never a silently disabled store.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted when `--data-dir` is not given.
pub const DATA_DIR_ENV: &str = "RACE_DATA_DIR";

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Authoritative typing race server")]
pub struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    pub port: u16,
    /// Directory holding one JSON document per room
    #[clap(short, long)]
    pub data_dir: Option<PathBuf>,
    /// Keep rooms in memory only
    #[clap(long)]
    pub ephemeral: bool,
    /// Maximum number of connected clients across all rooms
    #[clap(short, long, default_value = "64")]
    pub max_clients: usize,
    /// Seconds of silence before a client is dropped
    #[clap(long, default_value = "10")]
    pub client_timeout: u64,
    /// Force a race to finish this many seconds after it starts
    #[clap(long)]
    pub race_timeout: Option<u64>,
    /// Milliseconds between countdown ticks
    #[clap(long, default_value = "1000")]
    pub countdown_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Memory,
    JsonDir(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub storage: StorageConfig,
    pub max_clients: usize,
    pub client_timeout: Duration,
    pub race_timeout: Option<Duration>,
    pub countdown_interval: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no persistence location: pass --data-dir, set RACE_DATA_DIR or run with --ephemeral")]
    MissingDataDir,

    #[error("--data-dir and --ephemeral are mutually exclusive")]
    ConflictingStorage,

    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("max clients must be greater than zero")]
    NoClients,
}

impl ServerConfig {
    /// Validates parsed arguments, falling back to `RACE_DATA_DIR` for storage.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let env_dir = std::env::var_os(DATA_DIR_ENV).map(PathBuf::from);
        Self::resolve(args, env_dir)
    }

    fn resolve(args: Args, env_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let address = format!("{}:{}", args.host, args.port);
        let bind_addr = address
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidAddress(address))?;

        // Flags outrank the environment, so --ephemeral ignores RACE_DATA_DIR.
        let storage = match (args.ephemeral, args.data_dir) {
            (true, Some(_)) => return Err(ConfigError::ConflictingStorage),
            (true, None) => StorageConfig::Memory,
            (false, Some(dir)) => StorageConfig::JsonDir(dir),
            (false, None) => match env_dir {
                Some(dir) => StorageConfig::JsonDir(dir),
                None => return Err(ConfigError::MissingDataDir),
            },
        };

        if args.max_clients == 0 {
            return Err(ConfigError::NoClients);
        }
        if args.client_timeout == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "client timeout",
            });
        }
        if args.countdown_interval == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "countdown interval",
            });
        }

        let race_timeout = match args.race_timeout {
            Some(0) => {
                return Err(ConfigError::ZeroDuration {
                    name: "race timeout",
                })
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(Self {
            bind_addr,
            storage,
            max_clients: args.max_clients,
            client_timeout: Duration::from_secs(args.client_timeout),
            race_timeout,
            countdown_interval: Duration::from_millis(args.countdown_interval),
        })
    }
}
