//! Global per-rank anomaly statistics.
//!
//! Each analysis rank periodically reports a summary of the anomalies it
//! detected. The server keeps one [`AnomalyStat`] per stat id of the form
//! `"{application_id}:{rank_id}"`, independent of the function table.

use crate::error::{PsError, Result};
use crate::stats::RunningStatistics;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One anomaly summary sent by an analysis rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub app: u32,
    pub rank: u32,
    pub step: u64,
    #[serde(default)]
    pub min_timestamp: u64,
    #[serde(default)]
    pub max_timestamp: u64,
    pub n_anomalies: u64,
}

impl AnomalyReport {
    pub fn stat_id(&self) -> String {
        stat_id(self.app, self.rank)
    }
}

pub fn stat_id(app: u32, rank: u32) -> String {
    format!("{}:{}", app, rank)
}

/// Ordered log of raw reports for one stat id.
#[derive(Debug, Clone, Default)]
pub struct AnomalyStat {
    data: Vec<String>,
    total: u64,
    stats: RunningStatistics,
}

impl AnomalyStat {
    pub fn add(&mut self, raw: String, n_anomalies: u64) {
        self.data.push(raw);
        self.total += n_anomalies;
        self.stats.update(n_anomalies as f64);
    }

    pub fn n_data(&self) -> usize {
        self.data.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn summary(&self, stat_id: &str) -> AnomalySummary {
        AnomalySummary {
            stat_id: stat_id.to_string(),
            total: self.total,
            stats: self.stats,
            data: self.data.clone(),
        }
    }
}

/// Serialized view of one stat id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySummary {
    pub stat_id: String,
    pub total: u64,
    pub stats: RunningStatistics,
    pub data: Vec<String>,
}

/// Anomaly statistics for every reporting rank.
#[derive(Debug, Default)]
pub struct GlobalAnomalyStats {
    stats: DashMap<String, Arc<Mutex<AnomalyStat>>>,
}

impl GlobalAnomalyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create empty entries for a job where application `i` runs
    /// `n_ranks[i]` ranks.
    pub fn with_ranks(n_ranks: &[u32]) -> Self {
        let stats = Self::new();
        stats.reset(n_ranks);
        stats
    }

    /// Drop all collected data and pre-create the entries of `n_ranks`.
    pub fn reset(&self, n_ranks: &[u32]) {
        self.stats.clear();
        for (app, ranks) in n_ranks.iter().enumerate() {
            for rank in 0..*ranks {
                let stat = Arc::new(Mutex::new(AnomalyStat::default()));
                self.stats.insert(stat_id(app as u32, rank), stat);
            }
        }
    }

    /// Record one JSON-encoded [`AnomalyReport`]; returns its stat id.
    pub fn add_anomaly_data(&self, data: &str) -> Result<String> {
        let report: AnomalyReport = serde_json::from_str(data)
            .map_err(|e| PsError::format(format!("invalid anomaly report: {}", e)))?;
        let id = report.stat_id();

        let entry = Arc::clone(
            self.stats
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(AnomalyStat::default())))
                .value(),
        );
        entry.lock().add(data.to_string(), report.n_anomalies);

        debug!("Anomaly report for {} step {}: {} anomalies", id, report.step, report.n_anomalies);
        Ok(id)
    }

    pub fn get_anomaly_stat(&self, stat_id: &str) -> Option<AnomalySummary> {
        let entry = self.stats.get(stat_id).map(|e| Arc::clone(e.value()))?;
        let summary = entry.lock().summary(stat_id);
        Some(summary)
    }

    pub fn get_n_anomaly_data(&self, stat_id: &str) -> usize {
        self.stats
            .get(stat_id)
            .map(|e| e.value().lock().n_data())
            .unwrap_or(0)
    }

    /// Summaries of every stat id, sorted by id.
    pub fn collect(&self) -> Vec<AnomalySummary> {
        let mut ids: Vec<String> = self.stats.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.get_anomaly_stat(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(app: u32, rank: u32, step: u64, n: u64) -> String {
        serde_json::to_string(&AnomalyReport {
            app,
            rank,
            step,
            min_timestamp: step * 100,
            max_timestamp: step * 100 + 99,
            n_anomalies: n,
        })
        .unwrap()
    }

    #[test]
    fn test_add_and_get() {
        let stats = GlobalAnomalyStats::new();
        assert_eq!(stats.add_anomaly_data(&report(0, 1, 0, 4)).unwrap(), "0:1");
        stats.add_anomaly_data(&report(0, 1, 1, 2)).unwrap();

        let summary = stats.get_anomaly_stat("0:1").unwrap();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.data.len(), 2);
        assert_eq!(summary.stats.count(), 2);
        assert_eq!(summary.stats.mean(), 3.0);
        assert_eq!(stats.get_n_anomaly_data("0:1"), 2);
    }

    #[test]
    fn test_log_keeps_order_and_is_not_drained() {
        let stats = GlobalAnomalyStats::new();
        let first = report(1, 0, 0, 1);
        let second = report(1, 0, 1, 0);
        stats.add_anomaly_data(&first).unwrap();
        stats.add_anomaly_data(&second).unwrap();

        let a = stats.get_anomaly_stat("1:0").unwrap();
        let b = stats.get_anomaly_stat("1:0").unwrap();
        assert_eq!(a.data, vec![first, second]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_id() {
        let stats = GlobalAnomalyStats::new();
        assert!(stats.get_anomaly_stat("9:9").is_none());
        assert_eq!(stats.get_n_anomaly_data("9:9"), 0);
    }

    #[test]
    fn test_extra_fields_tolerated_and_garbage_rejected() {
        let stats = GlobalAnomalyStats::new();
        let raw = r#"{"app":0,"rank":2,"step":3,"n_anomalies":1,"hostname":"node7"}"#;
        assert_eq!(stats.add_anomaly_data(raw).unwrap(), "0:2");
        assert!(matches!(stats.add_anomaly_data("{"), Err(PsError::Format { .. })));
    }

    #[test]
    fn test_reset_precreates_entries() {
        let stats = GlobalAnomalyStats::with_ranks(&[2, 1]);
        assert_eq!(stats.len(), 3);
        stats.add_anomaly_data(&report(0, 0, 0, 5)).unwrap();

        stats.reset(&[1]);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.get_anomaly_stat("0:0").unwrap().total, 0);
    }

    #[test]
    fn test_collect_sorted() {
        let stats = GlobalAnomalyStats::new();
        stats.add_anomaly_data(&report(1, 0, 0, 1)).unwrap();
        stats.add_anomaly_data(&report(0, 3, 0, 1)).unwrap();
        let ids: Vec<String> = stats.collect().into_iter().map(|s| s.stat_id).collect();
        assert_eq!(ids, vec!["0:3".to_string(), "1:0".to_string()]);
    }
}
