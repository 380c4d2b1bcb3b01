//! Command-line configuration.

use clap::Parser;

/// In-memory key/value cache server speaking the memcache ASCII
/// protocol.
#[derive(Parser, Debug)]
#[command(name = "emberd", version)]
pub struct Config {
    /// TCP port number to listen on
    #[arg(short = 'p', long = "port", default_value_t = 11211)]
    pub port: u16,

    /// Max memory to use for items in megabytes
    #[arg(short = 'm', long = "memory-limit", default_value_t = 64)]
    pub max_memory_mb: usize,

    /// Max simultaneous connections
    #[arg(short = 'c', long = "connections", default_value_t = 1024)]
    pub max_connections: usize,

    /// Number of worker threads to use
    #[arg(short = 't', long = "threads", default_value_t = 4)]
    pub threads: usize,

    /// Run as a daemon
    #[arg(short = 'd', long = "daemonize")]
    pub daemonize: bool,

    /// Verbosity: -v errors/warnings, -vv client commands, -vvv
    /// internal state transitions
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    /// Item memory budget in bytes.
    pub fn max_bytes(&self) -> usize {
        self.max_memory_mb * 1024 * 1024
    }
}
