pub mod antenna;
pub mod assembler;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod shard;
pub mod sink;
pub mod source;
pub mod storage;
pub mod store;
pub mod timestamp;

pub use crate::antenna::AntennaIndex;
pub use crate::assembler::{VectorAssembler, DEFAULT_LEVEL};
pub use crate::config::{Config, MalformedPolicy};
pub use crate::error::{Error, Result};
pub use crate::manager::ResourceProfile;
pub use crate::model::{AggregationKey, PartialRecord, RawReading, SourcedReading, VectorRecord};
pub use crate::pipeline::{Pipeline, RunSummary};
pub use crate::sink::{JsonReport, ResultSink};
pub use crate::source::ReadingSource;
pub use crate::store::{MemoryStore, SpillingStore, VectorStore};
