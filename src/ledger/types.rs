//! Ledger record types.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextSnapshot;
use crate::scoring::{Status, Thresholds};

/// Serializes timestamps as fixed-width RFC 3339 (microseconds, `Z`), so the
/// text form sorts the same way as the instant.
pub(crate) mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

/// Current time at the precision the ledgers store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

/// A judged outcome, before the ledger assigns an id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub test_id: String,
    pub runner: String,
    pub judge_model: String,
    pub score: f64,
    pub pass: bool,
    pub reason: String,
    #[serde(default)]
    pub improvement: String,
    pub status: Status,
    /// 1-based iteration number.
    pub iteration: u32,
    pub context: ContextSnapshot,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Thresholds>,
}

/// A persisted run. Core fields never change after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: RunRecord,
}

impl LedgerEntry {
    pub fn test_id(&self) -> &str {
        &self.record.test_id
    }

    pub fn thresholds(&self) -> Thresholds {
        self.record.thresholds.unwrap_or_default()
    }
}

/// A manual score correction. Appended, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOverride {
    pub id: u64,
    pub run_id: u64,
    pub score: f64,
    pub pass: bool,
    pub reason: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// A run's score after applying its latest override.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveResult {
    pub run_id: u64,
    pub score: f64,
    pub pass: bool,
    pub status: Status,
    /// Id of the override in effect, if any.
    pub override_id: Option<u64>,
}

/// Aggregate numbers for one runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerStats {
    pub runner: String,
    pub total_runs: u64,
    pub average_score: f64,
    pub pass_rate: f64,
}

/// Suites and the tests recorded under them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SuiteNode {
    pub name: String,
    pub tests: Vec<String>,
    pub children: BTreeMap<String, SuiteNode>,
}

impl SuiteNode {
    pub fn root() -> Self {
        Self::default()
    }

    /// Inserts `test_id` under the node for `path`, creating nodes as needed.
    pub fn insert(&mut self, path: &[String], test_id: &str) {
        let mut node = self;
        for segment in path {
            node = node
                .children
                .entry(segment.clone())
                .or_insert_with(|| SuiteNode {
                    name: segment.clone(),
                    ..Default::default()
                });
        }
        if !node.tests.iter().any(|t| t == test_id) {
            node.tests.push(test_id.to_string());
            node.tests.sort();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty() && self.children.is_empty()
    }
}
