// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod config;
pub mod errors;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod shutdown;

pub use crate::errors::{
    ConsumerDecodeError, MalformedRecord, PublishError, QueueError, SourceFetchError,
};
pub use crate::ingest::scheduler::{Scheduler, SchedulerState};
pub use crate::ingest::types::{Job, RawListing, SourceConnector, SourceKind};
pub use crate::ingest::{CycleReport, Pipeline};
