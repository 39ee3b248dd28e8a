//! Transport abstraction with interchangeable backends.
//!
//! Both backends implement the same server contract ([`NetInterface`]) and
//! client contract ([`ClientTransport`]); which one is used is decided when
//! the process is composed, not inside the dispatch or store layers.
//!
//! # Backends
//!
//! - **Socket** ([`socket`]): persistent TCP connection per client, requests
//!   from all connections queued to a fixed worker pool.
//! - **Rank** ([`rank`]): rank-addressed, tag-matched messaging inside a
//!   parallel job, reached through a published service name.

pub mod frame;
pub mod rank;
pub mod socket;

pub use rank::{JobFabric, RankClient, RankNet};
pub use socket::{SocketClient, SocketNet};

use crate::error::Result;
use crate::message::{Message, MessageType};
use crate::shutdown::ShutdownToken;
use crate::store::{GlobalAnomalyStats, ParameterInterface};
use std::fmt;
use std::sync::Arc;

/// Concrete transport behind the network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Socket,
    Rank,
}

impl Backend {
    /// Identifier a server of this backend appends to the handshake reply.
    pub fn identifier(self) -> &'static str {
        match self {
            Backend::Socket => "I am SOCKNET!",
            Backend::Rank => "I am RANKNET!",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Socket => "socket",
            Backend::Rank => "rank",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "socket" | "tcp" => Some(Backend::Socket),
            "rank" | "collective" => Some(Backend::Rank),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for `NetInterface::initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// Worker thread count (clamped to at least one).
    pub threads: usize,
    /// Socket backend: endpoint such as `tcp://0.0.0.0:5559`.
    /// Rank backend: the service name to publish.
    pub address: String,
}

impl NetConfig {
    pub fn new(threads: usize, address: impl Into<String>) -> Self {
        Self {
            threads,
            address: address.into(),
        }
    }
}

/// Server side of a transport backend.
pub trait NetInterface: Send {
    fn backend(&self) -> Backend;

    /// Acquire transport resources. Must precede `run`.
    fn initialize(&mut self, config: &NetConfig) -> Result<()>;

    fn set_parameter_store(&mut self, store: Arc<dyn ParameterInterface>);

    /// Enable the anomaly statistics endpoints.
    fn set_anomaly_stats(&mut self, stats: Arc<GlobalAnomalyStats>);

    /// Serve requests on the worker pool until a quit command arrives or the
    /// shutdown token fires. May be called once.
    fn run(&mut self) -> Result<()>;

    /// Release transport resources. Idempotent.
    fn finalize(&mut self) -> Result<()>;

    /// Token that stops `run` when triggered from any thread.
    fn shutdown_token(&self) -> ShutdownToken;
}

/// Client side of a transport backend.
pub trait ClientTransport: Send {
    fn backend(&self) -> Backend;

    /// Open the connection; `rank` is the caller's own rank.
    fn connect(&mut self, rank: i32, server_rank: i32, address: &str) -> Result<()>;

    fn send(&mut self, msg: &Message) -> Result<()>;

    /// Block until the reply of type `expected` arrives.
    fn receive(&mut self, expected: MessageType) -> Result<Message>;

    /// Release the connection. Idempotent.
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}
