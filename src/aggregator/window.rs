//! Time-aligned window store for pipeline stats.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use sketches_ddsketch::DDSketch;
use tracing::{debug, error, info};

use crate::payload::{
    AgentMetadata, ClientGroupedStats, ClientStatsBucket, ClientStatsPayload, PipelineStatsPayload,
};
use crate::sketch::{self, SketchMapping};

/// Width of an aggregation window.
pub const BUCKET_DURATION: Duration = Duration::from_secs(10);

/// How far behind the newest exported window exported starts are remembered.
/// Buckets older than that are treated as already exported.
pub const EXPORTED_HORIZON_WINDOWS: u64 = 30;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Tenant/release partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub env: String,
    pub version: String,
}

struct StatsPoint {
    service: String,
    stage_name: String,
    parent_stage_id: u64,
    summary: DDSketch,
}

#[derive(Default)]
struct TimeWindow {
    points: HashMap<AggregationKey, HashMap<u64, StatsPoint>>,
}

/// What happened to the entries of one ingested payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub inserted: usize,
    pub merged: usize,
    pub skipped: usize,
    pub late_buckets: usize,
}

impl TimeWindow {
    fn add(
        &mut self,
        key: &AggregationKey,
        stats: &[ClientGroupedStats],
        mapping: &SketchMapping,
        outcome: &mut IngestOutcome,
    ) {
        let points = self.points.entry(key.clone()).or_default();
        for entry in stats {
            let summary = match mapping.decode(&entry.sketch) {
                Ok(summary) => summary,
                Err(e) => {
                    error!(error = %e, stage_id = entry.stage_id, "error decoding sketch");
                    outcome.skipped += 1;
                    continue;
                }
            };
            if let Some(point) = points.get_mut(&entry.stage_id) {
                match sketch::merge(&mut point.summary, &summary) {
                    Ok(()) => outcome.merged += 1,
                    Err(e) => {
                        error!(error = %e, stage_id = entry.stage_id, "error merging sketches");
                        outcome.skipped += 1;
                    }
                }
                continue;
            }
            points.insert(
                entry.stage_id,
                StatsPoint {
                    service: entry.service.clone(),
                    stage_name: entry.stage_name.clone(),
                    parent_stage_id: entry.parent_stage_id,
                    summary,
                },
            );
            outcome.inserted += 1;
        }
    }

    fn export(
        self,
        start_ns: u64,
        duration_ns: u64,
        mapping: &SketchMapping,
        agent: &AgentMetadata,
    ) -> Vec<PipelineStatsPayload> {
        let mut payloads = Vec::new();
        for (key, points) in self.points {
            let mut bucket = ClientStatsBucket {
                start: start_ns,
                duration: duration_ns,
                stats: Vec::with_capacity(points.len()),
            };
            for (stage_id, point) in points {
                let encoded = match mapping.encode(&point.summary) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, stage_id, "error serializing sketch");
                        continue;
                    }
                };
                bucket.stats.push(ClientGroupedStats {
                    stage_id,
                    service: point.service,
                    stage_name: point.stage_name,
                    parent_stage_id: point.parent_stage_id,
                    sketch: encoded,
                });
            }
            if bucket.stats.is_empty() {
                continue;
            }
            payloads.push(PipelineStatsPayload {
                env: key.env,
                version: key.version,
                agent_env: agent.env.clone(),
                agent_hostname: agent.hostname.clone(),
                agent_version: agent.version.clone(),
                stats: vec![bucket],
            });
        }
        payloads
    }
}

/// Live windows keyed by their aligned start (unix seconds).
///
/// Only `add`, `flush_due` and `flush_all` mutate the store.
pub struct WindowStore {
    windows: HashMap<u64, TimeWindow>,
    mapping: SketchMapping,
    agent: AgentMetadata,
    exported: ExportedStarts,
}

impl WindowStore {
    pub fn new(mapping: SketchMapping, agent: AgentMetadata) -> Self {
        Self {
            windows: HashMap::with_capacity(20),
            mapping,
            agent,
            exported: ExportedStarts::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Start (unix seconds) of every live window, in no particular order.
    pub fn window_starts(&self) -> Vec<u64> {
        self.windows.keys().copied().collect()
    }

    pub fn add(&mut self, payload: &ClientStatsPayload) -> IngestOutcome {
        let key = AggregationKey {
            env: payload.env.clone(),
            version: payload.version.clone(),
        };
        let mut outcome = IngestOutcome::default();
        for bucket in &payload.stats {
            let start = window_start(bucket.start);
            if self.exported.contains(start) {
                debug!(start, "dropping bucket for an already flushed window");
                outcome.late_buckets += 1;
                outcome.skipped += bucket.stats.len();
                continue;
            }
            let window = self.windows.entry(start).or_default();
            window.add(&key, &bucket.stats, &self.mapping, &mut outcome);
        }
        outcome
    }

    /// Export and remove every window with `now > start + BUCKET_DURATION`.
    ///
    /// A window is kept for one full extra duration past its nominal end so
    /// that late reports still land in it.
    pub fn flush_due(&mut self, now: u64) -> Vec<PipelineStatsPayload> {
        let duration = BUCKET_DURATION.as_secs();
        let due: Vec<u64> = self
            .windows
            .keys()
            .copied()
            .filter(|start| now > start.saturating_add(duration))
            .collect();

        let mut payloads = Vec::new();
        for start in due {
            if let Some(window) = self.windows.remove(&start) {
                info!(start, "flushing bucket");
                payloads.extend(self.export(start, window));
                self.exported.insert(start);
            }
        }
        payloads
    }

    /// Export and remove every window regardless of age.
    pub fn flush_all(&mut self) -> Vec<PipelineStatsPayload> {
        let windows: Vec<(u64, TimeWindow)> = self.windows.drain().collect();
        let mut payloads = Vec::new();
        for (start, window) in windows {
            payloads.extend(self.export(start, window));
            self.exported.insert(start);
        }
        payloads
    }

    fn export(&self, start: u64, window: TimeWindow) -> Vec<PipelineStatsPayload> {
        window.export(
            start.saturating_mul(NANOS_PER_SEC),
            BUCKET_DURATION.as_nanos() as u64,
            &self.mapping,
            &self.agent,
        )
    }
}

/// Starts of exported windows within [`EXPORTED_HORIZON_WINDOWS`] of the newest
/// one. Anything below that floor counts as exported too, so the set stays
/// bounded while no exported window can be recreated.
#[derive(Debug, Default)]
struct ExportedStarts {
    starts: BTreeSet<u64>,
}

impl ExportedStarts {
    fn floor(&self) -> Option<u64> {
        let newest = *self.starts.last()?;
        Some(newest.saturating_sub(EXPORTED_HORIZON_WINDOWS * BUCKET_DURATION.as_secs()))
    }

    fn insert(&mut self, start: u64) {
        self.starts.insert(start);
        if let Some(floor) = self.floor() {
            self.starts = self.starts.split_off(&floor);
        }
    }

    fn contains(&self, start: u64) -> bool {
        match self.floor() {
            Some(floor) => start < floor || self.starts.contains(&start),
            None => false,
        }
    }
}

/// Aligned window start, in unix seconds, for a bucket start in nanoseconds.
pub fn window_start(start_ns: u64) -> u64 {
    let secs = start_ns / NANOS_PER_SEC;
    secs - secs % BUCKET_DURATION.as_secs()
}
