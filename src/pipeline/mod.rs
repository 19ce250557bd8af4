//! Incremental aggregation: chunk scheduling, parallel dispatch and run control.

mod chunker;
mod controller;
mod dispatcher;
mod metrics;

pub use chunker::{next_chunk, ChunkBounds, DEFAULT_CHUNK_SIZE};
pub use controller::{
    poll_completion, AggregationRun, PollOutcome, RetryStats, RunController, RunOutcome, RunState,
    RunStats,
};
pub use dispatcher::{Dispatcher, RegionOutcome, RegionResult, TileSet};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
