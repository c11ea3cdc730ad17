use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::payload::{ClientStatsBucket, PipelineStatsPayload};

/// Header listing the tracer languages seen by the agent, joined with `|`.
pub const HEADER_LANGUAGES: &str = "X-Datadog-Reported-Languages";

#[derive(Debug)]
pub enum EncodeError {
    Msgpack(String),
    Gzip(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Msgpack(msg) => write!(f, "msgpack encode error: {}", msg),
            EncodeError::Gzip(msg) => write!(f, "gzip error: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Serialize as named-field MessagePack and gzip at the fastest level.
pub fn encode_payload(payload: &PipelineStatsPayload) -> Result<Bytes, EncodeError> {
    let raw = rmp_serde::to_vec_named(payload).map_err(|e| EncodeError::Msgpack(e.to_string()))?;
    let mut gz = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    gz.write_all(&raw)
        .map_err(|e| EncodeError::Gzip(e.to_string()))?;
    gz.finish()
        .map(Bytes::from)
        .map_err(|e| EncodeError::Gzip(e.to_string()))
}

pub fn payload_headers(languages: &str) -> Vec<(String, String)> {
    vec![
        (HEADER_LANGUAGES.to_string(), languages.to_string()),
        ("Content-Type".to_string(), "application/msgpack".to_string()),
        ("Content-Encoding".to_string(), "gzip".to_string()),
    ]
}

/// Split a payload into payloads of at most `max_entries` entries each.
/// Buckets are cut where needed; bucket order and entry order are kept.
pub fn split_payload(payload: PipelineStatsPayload, max_entries: usize) -> Vec<PipelineStatsPayload> {
    let max_entries = max_entries.max(1);
    if payload.entry_count() <= max_entries {
        return vec![payload];
    }

    let mut parts = Vec::new();
    let mut current = payload.without_stats();
    let mut room = max_entries;

    for bucket in payload.stats {
        let mut entries = bucket.stats.into_iter().peekable();
        while entries.peek().is_some() {
            let chunk: Vec<_> = entries.by_ref().take(room).collect();
            room -= chunk.len();
            current.stats.push(ClientStatsBucket {
                start: bucket.start,
                duration: bucket.duration,
                stats: chunk,
            });
            if room == 0 {
                let next = current.without_stats();
                parts.push(std::mem::replace(&mut current, next));
                room = max_entries;
            }
        }
    }
    if !current.stats.is_empty() {
        parts.push(current);
    }
    parts
}
