use std::thread;

use tracing::{info, warn};

use crate::config::Config;

/// Upper bound on ingestion shards. Beyond this the single reader is the
/// bottleneck and more shards only add merge work.
pub const MAX_WORKERS: usize = 8;

/// How a run uses the machine: shard count and tokio runtime size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceProfile {
    pub logical_cores: usize,
    pub workers: usize,
    pub runtime_threads: usize,
}

impl ResourceProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::for_cores(cores)
    }

    pub fn for_cores(cores: usize) -> Self {
        let cores = cores.max(1);

        // CASE 1: Small machine. One reader, one store, no routing.
        if cores <= 2 {
            info!(cores, "small machine, aggregating sequentially");
            Self { logical_cores: cores, workers: 1, runtime_threads: 2 }
        }
        // CASE 2: One core stays with the reader, the rest apply updates.
        else {
            let workers = (cores - 1).min(MAX_WORKERS);
            info!(cores, workers, "sharded aggregation");
            Self { logical_cores: cores, workers, runtime_threads: cores.min(MAX_WORKERS + 1) }
        }
    }

    /// Applies the configured worker count over the detected one.
    pub fn with_config(mut self, config: &Config) -> Self {
        if let Some(workers) = config.workers {
            if workers > self.logical_cores {
                warn!(workers, cores = self.logical_cores, "more workers than cores requested");
            }
            self.workers = workers.max(1);
            self.runtime_threads = self.runtime_threads.max(self.workers.min(MAX_WORKERS) + 1);
        }
        self
    }
}

/// Per-shard share of the memory budget.
pub fn shard_budget(budget: usize, shards: usize) -> usize {
    budget / shards.max(1)
}
