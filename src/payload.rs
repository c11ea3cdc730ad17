//! Wire types: client stats reported by tracers and the merged payloads sent upstream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stats for one pipeline stage as reported by a single tracer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientGroupedStats {
    pub stage_id: u64,
    pub service: String,
    pub stage_name: String,
    pub parent_stage_id: u64,
    /// Encoded latency summary (see [`crate::sketch::SketchMapping::encode`]).
    pub sketch: Bytes,
}

/// A time bucket of client stats. `start` and `duration` are nanoseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientStatsBucket {
    pub start: u64,
    pub duration: u64,
    pub stats: Vec<ClientGroupedStats>,
}

/// Input payload from one tracer, tagged with its (env, version) partition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientStatsPayload {
    pub env: String,
    pub version: String,
    pub stats: Vec<ClientStatsBucket>,
}

/// Merged stats for one (env, version) partition and one window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PipelineStatsPayload {
    pub env: String,
    pub version: String,
    pub agent_env: String,
    pub agent_hostname: String,
    pub agent_version: String,
    pub stats: Vec<ClientStatsBucket>,
}

impl PipelineStatsPayload {
    /// Total number of stat entries across all buckets.
    pub fn entry_count(&self) -> usize {
        self.stats.iter().map(|b| b.stats.len()).sum()
    }

    /// Copy of this payload without any buckets.
    pub(crate) fn without_stats(&self) -> Self {
        Self {
            env: self.env.clone(),
            version: self.version.clone(),
            agent_env: self.agent_env.clone(),
            agent_hostname: self.agent_hostname.clone(),
            agent_version: self.agent_version.clone(),
            stats: Vec::new(),
        }
    }
}

/// Agent identity stamped on every outgoing payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentMetadata {
    pub env: String,
    pub hostname: String,
    pub version: String,
}

impl AgentMetadata {
    pub fn new(env: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            hostname: hostname.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_count_sums_all_buckets() {
        let bucket = |n: usize| ClientStatsBucket {
            start: 0,
            duration: 10,
            stats: vec![ClientGroupedStats::default(); n],
        };
        let payload = PipelineStatsPayload {
            stats: vec![bucket(2), bucket(0), bucket(5)],
            ..Default::default()
        };
        assert_eq!(payload.entry_count(), 7);
        assert!(payload.without_stats().stats.is_empty());
    }

    #[test]
    fn client_payload_uses_pascal_case_field_names() {
        let payload = ClientStatsPayload {
            env: "prod".to_string(),
            version: "v1".to_string(),
            stats: vec![],
        };
        let encoded = rmp_serde::to_vec_named(&payload).unwrap();
        let as_json: serde_json::Value = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(as_json["Env"], "prod");
        assert_eq!(as_json["Version"], "v1");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Partial {
            env: String,
        }
        let encoded = rmp_serde::to_vec_named(&Partial {
            env: "staging".to_string(),
        })
        .unwrap();
        let decoded: ClientStatsPayload = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded.env, "staging");
        assert!(decoded.version.is_empty());
        assert!(decoded.stats.is_empty());
    }
}
