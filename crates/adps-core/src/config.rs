//! Centralized configuration for the parameter server.
//!
//! Constants for wire limits, polling intervals and the handshake, plus the
//! `ServerOptions` value the server entry point assembles from its arguments.

use std::path::PathBuf;
use std::time::Duration;

/// Server-side limits and timings.
pub struct ServerConfig;

impl ServerConfig {
    /// Largest accepted payload (64 MiB).
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
    /// Hardware threads kept free for the OS and the acceptor.
    pub const RESERVED_THREADS: usize = 5;
    pub const DEFAULT_ADDRESS: &'static str = "tcp://0.0.0.0:5559";
    pub const DEFAULT_OUTPUT_FILE: &'static str = "./parameters.txt";
    pub const DEFAULT_SNAPSHOT_FILE: &'static str = "./parameters.snapshot.json";
    /// How often blocked threads re-check the shutdown token.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
    /// Logical rank of the server inside a rank-backend communicator.
    pub const SERVER_RANK: i32 = 0;
}

/// Client-side timings.
pub struct ClientConfig;

impl ClientConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Rank that issues the quit command during a collective disconnect.
    pub const COORDINATOR_RANK: i32 = 0;
}

/// Connection handshake literals.
pub struct HandshakeConfig;

impl HandshakeConfig {
    pub const HELLO: &'static str = "Hello!";
    pub const SENTINEL: &'static str = ">";
}

/// Options for one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub threads: usize,
    pub output_file: PathBuf,
    pub address: String,
    pub snapshot_interval: Option<Duration>,
    pub snapshot_file: PathBuf,
}

impl ServerOptions {
    /// Worker count when none is requested: hardware parallelism minus the
    /// reserved margin, never below one.
    pub fn default_threads() -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        available.saturating_sub(ServerConfig::RESERVED_THREADS).max(1)
    }

    /// Resolve a user supplied thread count; non-positive means "default".
    pub fn resolve_threads(requested: Option<i64>) -> usize {
        match requested {
            Some(n) if n > 0 => n as usize,
            _ => Self::default_threads(),
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            threads: Self::default_threads(),
            output_file: PathBuf::from(ServerConfig::DEFAULT_OUTPUT_FILE),
            address: ServerConfig::DEFAULT_ADDRESS.to_string(),
            snapshot_interval: None,
            snapshot_file: PathBuf::from(ServerConfig::DEFAULT_SNAPSHOT_FILE),
        }
    }
}
