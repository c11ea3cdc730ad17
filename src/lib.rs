// src/lib.rs
pub use bytes::Bytes;

pub mod aggregator;
pub mod cli;
mod handler;
pub mod info;
pub mod native;
pub mod payload;
pub mod sender;
pub mod sketch;
pub mod writer;

// Re-export tracing for use in other modules
pub use tracing;

// Re-export for tests
pub use handler::{
    decode_client_payload, handle_client_stats, HandleError, HandleResponse,
};

pub use aggregator::{AggregatorHandle, Ingester, PipelineStatsAggregator, WindowStore};
pub use info::Languages;
pub use native::build_router;
pub use payload::{AgentMetadata, ClientStatsPayload, PipelineStatsPayload};
pub use writer::{PayloadSubmitter, PipelineStatsWriter, WriterHandle};
