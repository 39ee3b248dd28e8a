//! Per-step function statistics accumulated on an analysis rank.

use super::NetClient;
use crate::error::Result;
use crate::stats::RunningStatistics;
use crate::store::{FuncStats, GlobalStats, StatsUpdate};
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of one exchange with the parameter server.
#[derive(Debug, Clone, PartialEq)]
pub struct StepExchange {
    /// Encoded size of the ADD request.
    pub sent_bytes: usize,
    /// Encoded size of the reply.
    pub recv_bytes: usize,
    /// Global view of the functions this step reported.
    pub global: GlobalStats,
}

/// Function timings and anomaly counts of one analysis step.
#[derive(Debug, Clone, Default)]
pub struct LocalFuncStatistics {
    app: u32,
    step: u64,
    functions: BTreeMap<u64, FuncStats>,
}

impl LocalFuncStatistics {
    pub fn new(step: u64) -> Self {
        Self {
            app: 0,
            step,
            functions: BTreeMap::new(),
        }
    }

    /// Tag the step with the program index of a multi-program job.
    pub fn with_app(mut self, app: u32) -> Self {
        self.app = app;
        self
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Add one completed call of `func_id`.
    pub fn record_call(&mut self, func_id: u64, name: &str, inclusive: f64, exclusive: f64) {
        let entry = self
            .functions
            .entry(func_id)
            .or_insert_with(|| FuncStats::new(name));
        entry.inclusive.update(inclusive);
        entry.exclusive.update(exclusive);
    }

    /// Merge already-accumulated statistics for `func_id`.
    pub fn merge_function(
        &mut self,
        func_id: u64,
        name: &str,
        inclusive: &RunningStatistics,
        exclusive: &RunningStatistics,
    ) {
        let entry = self
            .functions
            .entry(func_id)
            .or_insert_with(|| FuncStats::new(name));
        entry.inclusive.merge(inclusive);
        entry.exclusive.merge(exclusive);
    }

    /// Count anomalies of a function seen this step. Returns `false` if the
    /// function has no recorded calls.
    pub fn add_anomalies(&mut self, func_id: u64, n: u64) -> bool {
        match self.functions.get_mut(&func_id) {
            Some(entry) => {
                entry.anomaly_count += n;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, func_id: u64) -> Option<&FuncStats> {
        self.functions.get(&func_id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn to_update(&self, rank: i32) -> StatsUpdate {
        StatsUpdate {
            app: self.app,
            rank,
            step: Some(self.step),
            functions: self.functions.clone(),
        }
    }

    /// Push this step to the server and return the merged global view.
    pub fn update_global(&self, client: &mut NetClient) -> Result<StepExchange> {
        let update = self.to_update(client.rank());
        let (reply, sent_bytes, recv_bytes) = client.add_stats_sized(&update)?;
        debug!(
            "Step {}: sent {} bytes for {} functions, received {} bytes",
            self.step,
            sent_bytes,
            self.functions.len(),
            recv_bytes
        );
        Ok(StepExchange {
            sent_bytes,
            recv_bytes,
            global: reply,
        })
    }
}
