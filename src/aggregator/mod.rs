// src/aggregator/mod.rs
//! Windowed aggregation of client pipeline stats.

mod service;
mod window;

pub use service::{
    AggregatorClosed, AggregatorHandle, Ingester, PipelineStatsAggregator, FLUSH_INTERVAL,
};
pub use window::{window_start, AggregationKey, IngestOutcome, WindowStore, BUCKET_DURATION};
