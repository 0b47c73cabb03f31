use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{AggregationKey, PartialRecord};
use crate::store::{Drain, VectorStore};

const BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShardUpdate {
    pub key: AggregationKey,
    pub position: usize,
    pub level: f64,
}

/// Every update for one key lands on the same shard.
pub fn shard_for(key: &AggregationKey, shards: usize) -> usize {
    (seahash::hash(&key.to_bytes()) % shards as u64) as usize
}

/// Reader side: batches updates per shard and pushes them into bounded
/// queues. Blocking; call it from a blocking thread, never from async code.
pub struct ShardRouter {
    senders: Vec<mpsc::Sender<Vec<ShardUpdate>>>,
    pending: Vec<Vec<ShardUpdate>>,
}

impl ShardRouter {
    pub fn route(&mut self, update: ShardUpdate) -> Result<()> {
        let shard = shard_for(&update.key, self.senders.len());
        self.pending[shard].push(update);
        if self.pending[shard].len() >= BATCH {
            self.flush(shard)?;
        }
        Ok(())
    }

    fn flush(&mut self, shard: usize) -> Result<()> {
        if self.pending[shard].is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.pending[shard], Vec::with_capacity(BATCH));
        self.senders[shard].blocking_send(batch).map_err(|_| Error::ShardClosed)
    }

    /// Flushes the remaining batches and closes every queue.
    pub fn finish(mut self) -> Result<()> {
        for shard in 0..self.senders.len() {
            self.flush(shard)?;
        }
        Ok(())
    }
}

/// Worker side: one blocking task per shard, each owning its store.
pub struct ShardWorkers {
    handles: Vec<JoinHandle<Result<Box<dyn VectorStore>>>>,
}

impl ShardWorkers {
    /// Waits for every worker. This is the ingestion barrier: stores are only
    /// handed back once all queues are closed and applied.
    pub async fn join(self) -> Result<Vec<Box<dyn VectorStore>>> {
        let mut stores = Vec::with_capacity(self.handles.len());
        let mut failure = None;

        for handle in self.handles {
            match handle.await {
                Ok(Ok(store)) => stores.push(store),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(Error::Worker(e.to_string()));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(stores),
        }
    }
}

/// Starts one worker per store. Must be called inside a tokio runtime.
pub fn spawn(stores: Vec<Box<dyn VectorStore>>, queue_capacity: usize) -> (ShardRouter, ShardWorkers) {
    let mut senders = Vec::with_capacity(stores.len());
    let mut handles = Vec::with_capacity(stores.len());

    for (shard, mut store) in stores.into_iter().enumerate() {
        let (tx, mut rx) = mpsc::channel::<Vec<ShardUpdate>>(queue_capacity.max(1));
        senders.push(tx);
        handles.push(tokio::task::spawn_blocking(move || -> Result<Box<dyn VectorStore>> {
            let mut applied = 0u64;
            while let Some(batch) = rx.blocking_recv() {
                for update in batch {
                    store.upsert(update.key, update.position, update.level)?;
                    applied += 1;
                }
            }
            debug!(shard, applied, keys = store.len(), "shard queue closed");
            Ok(store)
        }));
    }

    let pending = (0..senders.len()).map(|_| Vec::with_capacity(BATCH)).collect();
    (ShardRouter { senders, pending }, ShardWorkers { handles })
}

#[derive(Debug)]
struct Head {
    record: PartialRecord,
    shard: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Head {}

impl Ord for Head {
    // Reversed so the max-heap pops the smallest key.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.record.key, other.shard).cmp(&(self.record.key, self.shard))
    }
}
impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge of the shards' sorted drains into one sorted drain.
struct MergedDrain {
    sources: Vec<Drain>,
    heap: BinaryHeap<Head>,
    failed: Option<Error>,
}

impl MergedDrain {
    fn pull(&mut self, shard: usize) {
        match self.sources[shard].next() {
            Some(Ok(record)) => self.heap.push(Head { record, shard }),
            Some(Err(e)) => {
                self.failed.get_or_insert(e);
            }
            None => {}
        }
    }
}

impl Iterator for MergedDrain {
    type Item = Result<PartialRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            self.heap.clear();
            self.sources.clear();
            return Some(Err(e));
        }
        let head = self.heap.pop()?;
        self.pull(head.shard);
        Some(Ok(head.record))
    }
}

pub fn merge(stores: Vec<Box<dyn VectorStore>>) -> Result<Drain> {
    let sources = stores
        .into_iter()
        .map(|store| store.drain())
        .collect::<Result<Vec<_>>>()?;

    let mut merged = MergedDrain {
        heap: BinaryHeap::with_capacity(sources.len()),
        sources,
        failed: None,
    };
    for shard in 0..merged.sources.len() {
        merged.pull(shard);
    }
    Ok(Box::new(merged))
}
