//! Server-side global model.
//!
//! The transport and dispatch layers only see [`ParameterInterface`]; the
//! statistics-merge policy lives in [`StatisticalParameterStore`] and can be
//! swapped for another global-model policy without touching either layer.
//!
//! Payloads are JSON documents of the schemas defined here.

pub mod anomaly;
pub mod statistical;

pub use anomaly::{AnomalyReport, AnomalyStat, GlobalAnomalyStats};
pub use statistical::StatisticalParameterStore;

use crate::error::Result;
use crate::stats::RunningStatistics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

/// Abstract global-model policy served by the parameter server.
pub trait ParameterInterface: Send + Sync {
    /// Merge a serialized client update and return the serialized global
    /// state of the entries the client reported.
    fn update(&self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Serialized export of the whole store.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Human-readable dump, one entry per line.
    fn show(&self, out: &mut dyn Write) -> Result<()>;

    /// Number of entries currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Statistics for one function, either a client's step-local view or the
/// merged global view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FuncStats {
    pub name: String,
    /// Anomalies seen for this function (per step from clients, cumulative
    /// in the global view).
    #[serde(default)]
    pub anomaly_count: u64,
    pub inclusive: RunningStatistics,
    pub exclusive: RunningStatistics,
    /// Distribution of per-step anomaly counts (global view only).
    #[serde(default, skip_serializing_if = "RunningStatistics::is_empty")]
    pub anomaly_stats: RunningStatistics,
}

impl FuncStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// ADD request payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsUpdate {
    /// Program index of the reporting client in a multi-program job.
    #[serde(default)]
    pub app: u32,
    /// Reporting client rank.
    pub rank: i32,
    /// Analysis step; updates for a step not newer than the last applied
    /// one from the same (app, rank) are not merged again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    pub functions: BTreeMap<u64, FuncStats>,
}

impl StatsUpdate {
    pub fn new(rank: i32, step: Option<u64>) -> Self {
        Self {
            app: 0,
            rank,
            step,
            functions: BTreeMap::new(),
        }
    }

    pub fn with_app(mut self, app: u32) -> Self {
        self.app = app;
        self
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// ADD and GET reply payload: a read-only view of the merged model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub functions: BTreeMap<u64, FuncStats>,
}

impl GlobalStats {
    pub fn get(&self, func_id: u64) -> Option<&FuncStats> {
        self.functions.get(&func_id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
