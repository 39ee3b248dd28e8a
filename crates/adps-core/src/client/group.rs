//! Synchronization among the client ranks of one analysis job.

use std::sync::{Arc, Barrier};

/// Collective barrier over the ranks sharing one parameter server.
pub trait GroupBarrier: Send + Sync {
    /// Block until every rank of the group has called `barrier`.
    fn barrier(&self);

    /// This caller's rank within the group.
    fn rank(&self) -> i32;

    fn size(&self) -> usize;
}

/// Group with a single member; `barrier` returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloGroup;

impl GroupBarrier for SoloGroup {
    fn barrier(&self) {}

    fn rank(&self) -> i32 {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

/// Group whose ranks are threads of the current process.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    barrier: Arc<Barrier>,
    rank: i32,
    size: usize,
}

impl LocalGroup {
    /// One handle per rank, in rank order.
    pub fn create(size: usize) -> Vec<LocalGroup> {
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|rank| LocalGroup {
                barrier: Arc::clone(&barrier),
                rank: rank as i32,
                size,
            })
            .collect()
    }
}

impl GroupBarrier for LocalGroup {
    fn barrier(&self) {
        self.barrier.wait();
    }

    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}
