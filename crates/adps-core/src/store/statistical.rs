//! Statistics-merge policy for the global model.
//!
//! # Thread Safety
//!
//! Entries live in a sharded `DashMap` keyed by function index, each behind
//! its own `Mutex`. A shard lock is held only long enough to find or insert
//! the entry handle; the merge itself runs under the entry lock, so updates
//! to different function indices never wait on each other.

use super::{FuncStats, GlobalStats, ParameterInterface, StatsUpdate};
use crate::error::{PsError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

type SharedEntry = Arc<Mutex<FuncStats>>;

/// Authoritative per-function statistics merged from every client.
#[derive(Debug, Default)]
pub struct StatisticalParameterStore {
    functions: DashMap<u64, SharedEntry>,
    /// Highest step merged per (app, rank) client.
    applied_steps: DashMap<(u32, i32), u64>,
}

impl StatisticalParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a previously taken snapshot.
    pub fn restore(snapshot: &GlobalStats) -> Self {
        let store = Self::new();
        for (id, stats) in &snapshot.functions {
            store
                .functions
                .insert(*id, Arc::new(Mutex::new(stats.clone())));
        }
        store
    }

    /// Merge `update` and return the global view of the functions it names.
    pub fn merge_update(&self, update: &StatsUpdate) -> Result<GlobalStats> {
        for (id, local) in &update.functions {
            if !local.inclusive.is_finite() || !local.exclusive.is_finite() {
                let message = format!(
                    "non-finite statistics for function {} from rank {}",
                    id, update.rank
                );
                return Err(PsError::InvalidRequest { message });
            }
        }

        let apply = match update.step {
            Some(step) => self.claim_step(update.app, update.rank, step),
            None => true,
        };
        if !apply {
            debug!(
                "App {} rank {} step {:?} already merged, replying with current view",
                update.app, update.rank, update.step
            );
            return Ok(self.view(update.functions.keys().copied()));
        }

        let mut reply = GlobalStats::default();
        for (id, local) in &update.functions {
            let entry = self.entry(*id, &local.name);
            let mut global = entry.lock();

            if global.name.is_empty() {
                global.name = local.name.clone();
            } else if !local.name.is_empty() && global.name != local.name {
                warn!(
                    "Function {} reported as '{}' by rank {}, keeping '{}'",
                    id, local.name, update.rank, global.name
                );
            }
            global.inclusive.merge(&local.inclusive);
            global.exclusive.merge(&local.exclusive);
            global.anomaly_count += local.anomaly_count;
            global.anomaly_stats.update(local.anomaly_count as f64);

            reply.functions.insert(*id, global.clone());
        }
        Ok(reply)
    }

    /// Current global state of one function.
    pub fn get(&self, func_id: u64) -> Option<FuncStats> {
        let entry = self.functions.get(&func_id).map(|e| Arc::clone(e.value()))?;
        let stats = entry.lock().clone();
        Some(stats)
    }

    /// Read-only export of the whole store.
    pub fn global_view(&self) -> GlobalStats {
        let ids: Vec<u64> = self.functions.iter().map(|e| *e.key()).collect();
        self.view(ids)
    }

    fn view(&self, ids: impl IntoIterator<Item = u64>) -> GlobalStats {
        let mut out = GlobalStats::default();
        for id in ids {
            if let Some(stats) = self.get(id) {
                out.functions.insert(id, stats);
            }
        }
        out
    }

    /// Record `step` as applied for the client; `false` if it was not newer.
    fn claim_step(&self, app: u32, rank: i32, step: u64) -> bool {
        match self.applied_steps.entry((app, rank)) {
            Entry::Occupied(mut e) => {
                if *e.get() >= step {
                    false
                } else {
                    *e.get_mut() = step;
                    true
                }
            }
            Entry::Vacant(e) => {
                e.insert(step);
                true
            }
        }
    }

    fn entry(&self, func_id: u64, name: &str) -> SharedEntry {
        if let Some(existing) = self.functions.get(&func_id) {
            return Arc::clone(existing.value());
        }
        let handle = self
            .functions
            .entry(func_id)
            .or_insert_with(|| Arc::new(Mutex::new(FuncStats::new(name))));
        Arc::clone(handle.value())
    }
}

impl ParameterInterface for StatisticalParameterStore {
    fn update(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let update = StatsUpdate::from_payload(payload)
            .map_err(|e| PsError::format(format!("invalid statistics payload: {}", e)))?;
        let reply = self.merge_update(&update)?;
        reply.to_payload().map_err(|e| PsError::Store {
            message: format!("failed to serialize global view: {}", e),
        })
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.global_view().to_payload().map_err(|e| PsError::Store {
            message: format!("failed to serialize snapshot: {}", e),
        })
    }

    fn show(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(
            out,
            "# id\tname\tcount\tincl_mean\tincl_stddev\texcl_mean\texcl_stddev\tanomalies"
        )?;
        for (id, f) in self.global_view().functions {
            writeln!(
                out,
                "{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{}",
                id,
                f.name,
                f.inclusive.count(),
                f.inclusive.mean(),
                f.inclusive.stddev(),
                f.exclusive.mean(),
                f.exclusive.stddev(),
                f.anomaly_count
            )?;
        }
        out.flush()?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.functions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RunningStatistics;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn update_for(
        rank: i32,
        step: Option<u64>,
        id: u64,
        samples: &[f64],
        anomalies: u64,
    ) -> StatsUpdate {
        let mut update = StatsUpdate::new(rank, step);
        let mut f = FuncStats::new(format!("func_{}", id));
        f.inclusive = RunningStatistics::from_samples(samples.iter().copied());
        f.exclusive = RunningStatistics::from_samples(samples.iter().map(|x| x / 2.0));
        f.anomaly_count = anomalies;
        update.functions.insert(id, f);
        update
    }

    #[test]
    fn test_two_clients_merge_into_one_entry() {
        let store = StatisticalParameterStore::new();

        let first = store.merge_update(&update_for(0, Some(0), 7, &[1.0, 2.0, 3.0], 0)).unwrap();
        assert_eq!(first.get(7).unwrap().inclusive.count(), 3);
        assert_eq!(first.get(7).unwrap().inclusive.mean(), 2.0);

        let second = store.merge_update(&update_for(1, Some(0), 7, &[4.0, 5.0], 2)).unwrap();
        let f = second.get(7).unwrap();
        assert_eq!(f.inclusive.count(), 5);
        assert!((f.inclusive.mean() - 3.0).abs() < 1e-12);
        assert_eq!(f.anomaly_count, 2);
        assert_eq!(f.anomaly_stats.count(), 2);
    }

    #[test]
    fn test_reply_contains_only_reported_functions() {
        let store = StatisticalParameterStore::new();
        store.merge_update(&update_for(0, None, 1, &[1.0], 0)).unwrap();
        let reply = store.merge_update(&update_for(1, None, 2, &[1.0], 0)).unwrap();

        assert_eq!(reply.len(), 1);
        assert!(reply.get(2).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_replayed_step_is_not_merged_twice() {
        let store = StatisticalParameterStore::new();
        let update = update_for(3, Some(5), 9, &[10.0, 20.0], 1);

        store.merge_update(&update).unwrap();
        let replay = store.merge_update(&update).unwrap();

        assert_eq!(replay.get(9).unwrap().inclusive.count(), 2);
        assert_eq!(store.get(9).unwrap().anomaly_count, 1);

        store.merge_update(&update_for(3, Some(6), 9, &[30.0], 0)).unwrap();
        assert_eq!(store.get(9).unwrap().inclusive.count(), 3);
    }

    #[test]
    fn test_same_rank_and_step_from_different_apps_both_merge() {
        let store = StatisticalParameterStore::new();
        let first = update_for(0, Some(1), 7, &[1.0, 2.0, 3.0], 0);
        let second = update_for(0, Some(1), 7, &[4.0, 5.0], 0).with_app(1);

        store.merge_update(&first).unwrap();
        let reply = store.merge_update(&second).unwrap();

        let f = reply.get(7).unwrap();
        assert_eq!(f.inclusive.count(), 5);
        assert!((f.inclusive.mean() - 3.0).abs() < 1e-12);

        // Each program still replays idempotently on its own.
        store.merge_update(&second).unwrap();
        assert_eq!(store.get(7).unwrap().inclusive.count(), 5);
    }

    #[test]
    fn test_updates_without_step_always_merge() {
        let store = StatisticalParameterStore::new();
        let update = update_for(0, None, 4, &[1.0], 0);
        store.merge_update(&update).unwrap();
        store.merge_update(&update).unwrap();
        assert_eq!(store.get(4).unwrap().inclusive.count(), 2);
    }

    #[test]
    fn test_name_mapping_is_stable() {
        let store = StatisticalParameterStore::new();
        store.merge_update(&update_for(0, None, 4, &[1.0], 0)).unwrap();

        let mut renamed = update_for(1, None, 4, &[1.0], 0);
        renamed.functions.get_mut(&4).unwrap().name = "other".to_string();
        store.merge_update(&renamed).unwrap();

        assert_eq!(store.get(4).unwrap().name, "func_4");
    }

    #[test]
    fn test_first_non_empty_name_is_adopted() {
        let store = StatisticalParameterStore::new();
        let mut unnamed = update_for(0, None, 4, &[1.0], 0);
        unnamed.functions.get_mut(&4).unwrap().name.clear();
        store.merge_update(&unnamed).unwrap();
        assert_eq!(store.get(4).unwrap().name, "");

        store.merge_update(&update_for(1, None, 4, &[2.0], 0)).unwrap();
        assert_eq!(store.get(4).unwrap().name, "func_4");

        store.merge_update(&unnamed).unwrap();
        assert_eq!(store.get(4).unwrap().name, "func_4");
        assert_eq!(store.get(4).unwrap().inclusive.count(), 3);
    }

    #[test]
    fn test_merge_on_other_function_does_not_wait_for_held_entry() {
        let store = Arc::new(StatisticalParameterStore::new());
        store.merge_update(&update_for(0, None, 1, &[1.0], 0)).unwrap();

        let held = store.entry(1, "func_1");
        let guard = held.lock();

        let (tx, rx) = mpsc::channel();
        let worker = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let reply = store.merge_update(&update_for(1, None, 2, &[5.0], 0));
                let _ = tx.send(reply.map(|g| g.len()));
            })
        };

        let merged = rx.recv_timeout(Duration::from_secs(2));
        drop(guard);
        worker.join().unwrap();
        assert_eq!(merged.expect("merge blocked on an unrelated entry").unwrap(), 1);
        assert_eq!(store.get(2).unwrap().inclusive.count(), 1);
    }

    #[test]
    fn test_non_finite_update_rejected_without_partial_apply() {
        let store = StatisticalParameterStore::new();
        let mut update = update_for(0, Some(1), 1, &[1.0], 0);
        let mut bad = FuncStats::new("bad");
        bad.inclusive = RunningStatistics::from_tuple((1, f64::NAN, 0.0, 0.0, 0.0));
        update.functions.insert(2, bad);

        let err = store.merge_update(&update).unwrap_err();
        assert!(matches!(err, PsError::InvalidRequest { .. }));
        assert!(store.is_empty());

        // The rejected step was not recorded, so a corrected resend applies.
        update.functions.remove(&2);
        store.merge_update(&update).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_rejects_malformed_payload() {
        let store = StatisticalParameterStore::new();
        let err = store.update(b"{\"rank\": ").unwrap_err();
        assert!(matches!(err, PsError::Format { .. }));
    }

    #[test]
    fn test_snapshot_of_empty_store() {
        let store = StatisticalParameterStore::new();
        let snapshot = GlobalStats::from_payload(&store.snapshot().unwrap()).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_show_format() {
        let store = StatisticalParameterStore::new();
        store.merge_update(&update_for(0, None, 7, &[1.0, 2.0, 3.0], 1)).unwrap();

        let mut out = Vec::new();
        store.show(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        let cols: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(cols[0], "7");
        assert_eq!(cols[1], "func_7");
        assert_eq!(cols[2], "3");
        assert_eq!(cols[3], "2.000000");
        assert_eq!(cols[7], "1");
    }

    #[test]
    fn test_restore_from_snapshot() {
        let store = StatisticalParameterStore::new();
        store.merge_update(&update_for(0, None, 1, &[1.0, 5.0], 0)).unwrap();
        let restored = StatisticalParameterStore::restore(&store.global_view());
        assert_eq!(restored.get(1), store.get(1));
    }

    #[test]
    fn test_concurrent_overlapping_updates_converge() {
        let store = Arc::new(StatisticalParameterStore::new());
        let handles: Vec<_> = (0..8)
            .map(|rank| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for step in 0..50u64 {
                        let samples = [rank as f64, step as f64];
                        let mut update = update_for(rank, Some(step), step % 4, &samples, 1);
                        let extra = update_for(rank, Some(step), 100, &samples, 0);
                        update.functions.extend(extra.functions);
                        store.merge_update(&update).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let total: u64 = (0..4)
            .map(|id| store.get(id).unwrap().inclusive.count())
            .sum();
        assert_eq!(total, 8 * 50 * 2);
        assert_eq!(store.get(100).unwrap().inclusive.count(), 8 * 50 * 2);

        let mut sequential = RunningStatistics::new();
        for rank in 0..8 {
            for step in 0..50 {
                sequential.update(rank as f64);
                sequential.update(step as f64);
            }
        }
        let merged = store.get(100).unwrap().inclusive;
        assert!((merged.mean() - sequential.mean()).abs() < 1e-9);
        assert!((merged.variance() - sequential.variance()).abs() < 1e-6);
    }
}
