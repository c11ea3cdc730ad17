use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;
use tracing::{debug, error, Span};

use crate::aggregator::Ingester;
use crate::info::Languages;
use crate::payload::ClientStatsPayload;

const MAX_DECOMPRESSED_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub enum HandleError {
    Decompress(String),
    Decode(String),
    Unavailable(String),
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleError::Decompress(e) => write!(f, "decompress error: {}", e),
            HandleError::Decode(e) => write!(f, "decode error: {}", e),
            HandleError::Unavailable(e) => write!(f, "unavailable: {}", e),
        }
    }
}

impl std::error::Error for HandleError {}

#[derive(Debug, serde::Serialize)]
pub struct HandleResponse {
    pub status: &'static str,
    pub buckets: usize,
    pub entries: usize,
}

pub(crate) fn decompress_if_gzipped(body: Bytes, is_gzipped: bool) -> Result<Bytes, HandleError> {
    if !is_gzipped && body.len() > MAX_DECOMPRESSED_SIZE {
        error!(
            bytes_read = body.len(),
            max = MAX_DECOMPRESSED_SIZE,
            "uncompressed body exceeds limit"
        );
        return Err(HandleError::Decompress(format!(
            "exceeds {}MB limit",
            MAX_DECOMPRESSED_SIZE / 1024 / 1024
        )));
    }

    if !is_gzipped {
        return Ok(body);
    }

    debug!(compressed_size = body.len(), "decompressing gzipped body");
    let decoder = GzDecoder::new(body.as_ref());
    let mut decompressed = Vec::with_capacity(body.len().saturating_mul(2));
    let bytes_read = decoder
        .take((MAX_DECOMPRESSED_SIZE + 1) as u64)
        .read_to_end(&mut decompressed)
        .map_err(|e| {
            error!(error = %e, "gzip decompression failed");
            HandleError::Decompress(e.to_string())
        })?;
    if bytes_read > MAX_DECOMPRESSED_SIZE {
        error!(
            bytes_read,
            max = MAX_DECOMPRESSED_SIZE,
            "decompressed size exceeds limit"
        );
        return Err(HandleError::Decompress(format!(
            "exceeds {}MB limit",
            MAX_DECOMPRESSED_SIZE / 1024 / 1024
        )));
    }
    debug!(decompressed_size = bytes_read, "decompression complete");
    Ok(Bytes::from(decompressed))
}

/// Decode a msgpack client stats payload. Summaries are decoded later, per entry.
pub fn decode_client_payload(body: &[u8]) -> Result<ClientStatsPayload, HandleError> {
    rmp_serde::from_slice(body).map_err(|e| {
        error!(error = %e, "failed to decode client stats payload");
        HandleError::Decode(e.to_string())
    })
}

/// Decode one tracer request and queue it for aggregation.
#[tracing::instrument(
    name = "ingest",
    skip(body, language, languages, ingester),
    fields(
        gzipped = is_gzipped,
        language = language.unwrap_or(""),
        buckets = tracing::field::Empty,
        entries = tracing::field::Empty,
    )
)]
pub async fn handle_client_stats(
    body: Bytes,
    is_gzipped: bool,
    language: Option<&str>,
    languages: &Languages,
    ingester: &Ingester,
) -> Result<HandleResponse, HandleError> {
    debug!(body_size = body.len(), is_gzipped, "handling client stats request");

    let body = decompress_if_gzipped(body, is_gzipped)?;
    let payload = decode_client_payload(&body)?;

    if let Some(language) = language {
        languages.record(language);
    }

    let buckets = payload.stats.len();
    let entries: usize = payload.stats.iter().map(|b| b.stats.len()).sum();
    Span::current().record("buckets", buckets);
    Span::current().record("entries", entries);

    if buckets == 0 {
        debug!("no buckets to aggregate");
        return Ok(HandleResponse {
            status: "ok",
            buckets,
            entries,
        });
    }

    ingester.ingest(payload).await.map_err(|e| {
        error!(error = %e, "aggregator rejected payload");
        HandleError::Unavailable(e.to_string())
    })?;

    Ok(HandleResponse {
        status: "ok",
        buckets,
        entries,
    })
}
