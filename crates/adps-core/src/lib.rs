//! ADPS Core - parameter server for online anomaly detection.
//!
//! Analysis ranks accumulate per-function timing statistics for each step of
//! a traced application and push them to a central parameter server, which
//! merges them into one global model and hands the merged view back. The
//! merged statistics drive each rank's outlier detection.
//!
//! The crate is layered bottom-up:
//!
//! - [`stats`]: mergeable running statistics (count, mean, M2, M3, M4)
//! - [`message`]: the binary RPC envelope and handshake
//! - [`store`]: the global model behind [`store::ParameterInterface`]
//! - [`dispatch`]: request routing shared by every transport
//! - [`net`]: transport backends (TCP sockets, rank messaging)
//! - [`client`]: the analysis-rank side of the protocol
//! - [`snapshot`]: periodic persistence of the global model
//!
//! # Example
//!
//! ```rust,no_run
//! use adps_core::net::{NetConfig, NetInterface, SocketNet};
//! use adps_core::store::StatisticalParameterStore;
//! use std::sync::Arc;
//!
//! fn main() -> adps_core::Result<()> {
//!     let store = Arc::new(StatisticalParameterStore::new());
//!     let mut net = SocketNet::new();
//!     net.set_parameter_store(store.clone());
//!     net.initialize(&NetConfig::new(4, "tcp://0.0.0.0:5559"))?;
//!     net.run()?;
//!     net.finalize()?;
//!     println!("{} functions merged", store.global_view().len());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod net;
pub mod shutdown;
pub mod snapshot;
pub mod stats;
pub mod store;

// Re-export commonly used types
pub use client::{GroupBarrier, LocalFuncStatistics, LocalGroup, NetClient, SoloGroup, StepExchange};
pub use config::{ClientConfig, HandshakeConfig, ServerConfig, ServerOptions};
pub use dispatch::{Dispatcher, ServerState};
pub use error::{PsError, Result};
pub use message::{Message, MessageCmd, MessageKind, MessageType};
pub use net::{
    Backend, ClientTransport, JobFabric, NetConfig, NetInterface, RankClient, RankNet,
    SocketClient, SocketNet,
};
pub use shutdown::ShutdownToken;
pub use snapshot::{read_snapshot, write_snapshot, Snapshot, SnapshotWriter};
pub use stats::RunningStatistics;
pub use store::{
    FuncStats, GlobalAnomalyStats, GlobalStats, ParameterInterface, StatisticalParameterStore,
    StatsUpdate,
};
