use std::io::BufRead;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::antenna::AntennaIndex;
use crate::assembler::VectorAssembler;
use crate::config::{Config, MalformedPolicy};
use crate::error::{Error, Result};
use crate::manager::shard_budget;
use crate::model::SourcedReading;
use crate::shard::{self, ShardUpdate};
use crate::sink::ResultSink;
use crate::source::ReadingSource;
use crate::store::{Drain, MemoryStore, SpillingStore, StoreStats, VectorStore};
use crate::timestamp::normalize;

const PROGRESS_EVERY: u64 = 1_000_000;

/// Counters of one finished run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Readings applied to the store.
    pub readings: u64,
    /// Malformed records dropped under the skip policy.
    pub skipped: u64,
    pub keys: u64,
    pub spilled: u64,
    pub reloaded: u64,
    pub written: u64,
    pub shards: usize,
}

impl RunSummary {
    fn new(ingested: Ingested, stats: StoreStats, written: u64, shards: usize) -> Self {
        Self {
            readings: ingested.readings,
            skipped: ingested.skipped,
            keys: stats.keys,
            spilled: stats.spilled,
            reloaded: stats.reloaded,
            written,
            shards,
        }
    }

    fn log(&self) {
        info!(
            readings = self.readings,
            skipped = self.skipped,
            keys = self.keys,
            spilled = self.spilled,
            reloaded = self.reloaded,
            written = self.written,
            shards = self.shards,
            "aggregation finished"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Ingested {
    readings: u64,
    skipped: u64,
}

/// Source -> normalizer -> store -> assembler -> sink.
///
/// Nothing reaches the sink before every reading has been applied, so the
/// output never depends on where in the input a reading appeared.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Config,
    antennas: Arc<AntennaIndex>,
    assembler: VectorAssembler,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let antennas = Arc::new(AntennaIndex::new(config.antennas.clone())?);
        let assembler = VectorAssembler::new(config.default_level);
        Ok(Self { config, antennas, assembler })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn antennas(&self) -> &AntennaIndex {
        &self.antennas
    }

    /// Turns one decoded reading into a store update.
    pub fn resolve(&self, reading: &SourcedReading) -> Result<ShardUpdate> {
        let raw = &reading.raw;
        let key = normalize(raw.beacon_id, &raw.timestamp).map_err(|source| Error::Timestamp {
            index: reading.index,
            offset: reading.offset,
            source,
        })?;
        let position = self.antennas.position(raw.ant_id).ok_or(Error::UnknownAntenna {
            antenna_id: raw.ant_id,
            index: reading.index,
            offset: reading.offset,
        })?;
        Ok(ShardUpdate { key, position, level: raw.dbm_ant })
    }

    fn ingest<R, F>(&self, source: ReadingSource<R>, mut apply: F) -> Result<Ingested>
    where
        R: BufRead,
        F: FnMut(ShardUpdate) -> Result<()>,
    {
        let mut source = source.with_max_record_bytes(self.config.max_record_bytes);
        let mut counts = Ingested::default();

        while let Some(item) = source.next() {
            let update = match item.and_then(|reading| self.resolve(&reading)) {
                Ok(update) => update,
                Err(e) if e.is_record_local() && self.config.on_malformed == MalformedPolicy::Skip => {
                    warn!(error = %e, "skipping malformed record");
                    counts.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            trace!(beacon = update.key.beacon_id, position = update.position, "apply reading");
            apply(update)?;
            counts.readings += 1;

            if counts.readings % PROGRESS_EVERY == 0 {
                info!(readings = counts.readings, offset = source.offset(), "ingesting");
            }
        }

        debug!(
            readings = counts.readings,
            skipped = counts.skipped,
            records = source.records_seen(),
            bytes = source.offset(),
            "input exhausted"
        );
        Ok(counts)
    }

    /// One store for one shard out of `shards`, sized to its share of the
    /// memory budget.
    pub fn new_store(&self, shards: usize) -> Box<dyn VectorStore> {
        let width = self.antennas.count();
        match self.config.memory_budget {
            None => Box::new(MemoryStore::new(width)),
            Some(budget) => Box::new(SpillingStore::with_budget(
                width,
                shard_budget(budget, shards),
                self.config.spill_dir(),
            )),
        }
    }

    fn emit<S: ResultSink>(&self, drain: Drain, sink: &mut S) -> Result<u64> {
        let mut written = 0u64;
        for record in drain {
            sink.accept(self.assembler.assemble(record?))?;
            written += 1;
        }
        sink.finish()?;
        Ok(written)
    }

    /// Single pass on the calling thread. Blocks.
    pub fn run_blocking<R, S>(&self, source: ReadingSource<R>, mut sink: S) -> Result<(RunSummary, S)>
    where
        R: BufRead,
        S: ResultSink,
    {
        let mut store = self.new_store(1);
        let ingested = self.ingest(source, |u| store.upsert(u.key, u.position, u.level))?;

        let stats = store.stats();
        let written = self.emit(store.drain()?, &mut sink)?;

        let summary = RunSummary::new(ingested, stats, written, 1);
        summary.log();
        Ok((summary, sink))
    }

    /// Runs sequentially or sharded depending on the configured worker count.
    /// Must be called inside a tokio runtime.
    pub async fn run<R, S>(&self, source: ReadingSource<R>, sink: S) -> Result<(RunSummary, S)>
    where
        R: BufRead + Send + 'static,
        S: ResultSink + Send + 'static,
    {
        let shards = self.config.shards();
        if shards <= 1 {
            let this = self.clone();
            return tokio::task::spawn_blocking(move || this.run_blocking(source, sink))
                .await
                .map_err(|e| Error::Worker(e.to_string()))?;
        }
        self.run_sharded(source, sink, shards).await
    }

    async fn run_sharded<R, S>(&self, source: ReadingSource<R>, mut sink: S, shards: usize) -> Result<(RunSummary, S)>
    where
        R: BufRead + Send + 'static,
        S: ResultSink + Send + 'static,
    {
        let stores = (0..shards).map(|_| self.new_store(shards)).collect();
        let (router, workers) = shard::spawn(stores, self.config.channel_capacity);
        info!(shards, "sharded ingestion started");

        let this = self.clone();
        let reader = tokio::task::spawn_blocking(move || -> Result<Ingested> {
            let mut router = router;
            let ingested = this.ingest(source, |u| router.route(u))?;
            router.finish()?;
            Ok(ingested)
        });

        // Both sides are joined before anything is drained, even on failure.
        let read = match reader.await {
            Ok(read) => read,
            Err(e) => Err(Error::Worker(e.to_string())),
        };
        let joined = workers.join().await;

        let (ingested, stores) = match (read, joined) {
            (Ok(ingested), Ok(stores)) => (ingested, stores),
            // The reader only sees a closed queue; the worker knows why.
            (Err(Error::ShardClosed), Err(e)) => return Err(e),
            (Err(e), _) | (Ok(_), Err(e)) => return Err(e),
        };

        let mut stats = StoreStats::default();
        for store in &stores {
            stats += store.stats();
        }

        let this = self.clone();
        let written = tokio::task::spawn_blocking(move || -> Result<(u64, S)> {
            let written = this.emit(shard::merge(stores)?, &mut sink)?;
            Ok((written, sink))
        })
        .await
        .map_err(|e| Error::Worker(e.to_string()))?;
        let (written, sink) = written?;

        let summary = RunSummary::new(ingested, stats, written, shards);
        summary.log();
        Ok((summary, sink))
    }
}
