//! Read-side aggregation shared by the ledger backends.

use std::collections::{BTreeMap, HashMap};

use super::types::{EffectiveResult, LedgerEntry, RunnerStats, ScoreOverride, SuiteNode};
use crate::error::ValidationError;
use crate::scoring::validate_score;

/// Checks an override request before anything is written.
pub fn validate_override(score: f64, reason: &str) -> Result<(), ValidationError> {
    validate_score(score)?;
    if reason.trim().is_empty() {
        return Err(ValidationError::EmptyReason);
    }
    Ok(())
}

/// The override in effect: latest timestamp, ties broken by highest id.
pub fn latest_override<'a, I>(overrides: I) -> Option<&'a ScoreOverride>
where
    I: IntoIterator<Item = &'a ScoreOverride>,
{
    overrides
        .into_iter()
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)))
}

/// Applies the latest of `overrides` (all for `entry`) to `entry`.
pub fn effective(entry: &LedgerEntry, overrides: &[ScoreOverride]) -> EffectiveResult {
    match latest_override(overrides.iter().filter(|o| o.run_id == entry.id)) {
        Some(o) => EffectiveResult {
            run_id: entry.id,
            score: o.score,
            pass: o.pass,
            status: entry.thresholds().status(o.score),
            override_id: Some(o.id),
        },
        None => EffectiveResult {
            run_id: entry.id,
            score: entry.record.score,
            pass: entry.record.pass,
            status: entry.record.status,
            override_id: None,
        },
    }
}

/// Most recent entry per test id (max timestamp, ties by highest id),
/// ordered by test id.
pub fn latest_per_test(entries: &[LedgerEntry]) -> Vec<LedgerEntry> {
    let mut latest: BTreeMap<&str, &LedgerEntry> = BTreeMap::new();
    for entry in entries {
        latest
            .entry(entry.test_id())
            .and_modify(|current| {
                let newer = (entry.timestamp, entry.id) > (current.timestamp, current.id);
                if newer {
                    *current = entry;
                }
            })
            .or_insert(entry);
    }
    latest.into_values().cloned().collect()
}

/// Per-runner totals over effective scores, ordered by runner name.
pub fn runner_stats(entries: &[LedgerEntry], overrides: &[ScoreOverride]) -> Vec<RunnerStats> {
    let mut by_run: HashMap<u64, Vec<ScoreOverride>> = HashMap::new();
    for o in overrides {
        by_run.entry(o.run_id).or_default().push(o.clone());
    }

    let mut totals: BTreeMap<&str, (u64, f64, u64)> = BTreeMap::new();
    for entry in entries {
        let result = effective(entry, by_run.get(&entry.id).map(Vec::as_slice).unwrap_or(&[]));
        let slot = totals.entry(entry.record.runner.as_str()).or_default();
        slot.0 += 1;
        slot.1 += result.score;
        if result.pass {
            slot.2 += 1;
        }
    }

    totals
        .into_iter()
        .map(|(runner, (runs, score_sum, passes))| RunnerStats {
            runner: runner.to_string(),
            total_runs: runs,
            average_score: score_sum / runs as f64,
            pass_rate: passes as f64 / runs as f64,
        })
        .collect()
}

/// Groups the latest entry of every test under its suite path.
pub fn suite_tree(entries: &[LedgerEntry]) -> SuiteNode {
    let mut root = SuiteNode::root();
    for entry in latest_per_test(entries) {
        let path = entry.record.suite_path.clone().unwrap_or_default();
        root.insert(&path, entry.test_id());
    }
    root
}


#[cfg(test)]
mod tests {
    use super::fixtures::{entry, record};
    use super::*;
    use crate::scoring::Status;
    use chrono::{TimeZone, Utc};

    fn correction(id: u64, run_id: u64, score: f64, seconds: u32) -> ScoreOverride {
        ScoreOverride {
            id,
            run_id,
            score,
            pass: score >= 0.7,
            reason: "manual".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, seconds).unwrap(),
        }
    }

    #[test]
    fn test_validate_override() {
        assert!(validate_override(0.5, "regraded").is_ok());
        assert_eq!(
            validate_override(1.5, "x"),
            Err(ValidationError::ScoreOutOfRange(1.5))
        );
        assert_eq!(validate_override(0.5, "  "), Err(ValidationError::EmptyReason));
    }

    #[test]
    fn test_latest_per_test_breaks_ties_by_id() {
        let entries = vec![
            entry(1, 0, record("a", "r", 0.1)),
            entry(2, 5, record("a", "r", 0.2)),
            entry(3, 5, record("a", "r", 0.3)),
            entry(4, 1, record("b", "r", 0.9)),
        ];
        let latest = latest_per_test(&entries);
        let ids: Vec<u64> = latest.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_effective_uses_latest_override() {
        let run = entry(1, 0, record("a", "r", 0.2));
        assert_eq!(effective(&run, &[]).score, 0.2);

        let overrides = vec![correction(1, 1, 0.9, 0), correction(2, 1, 0.6, 0)];
        let result = effective(&run, &overrides);
        assert_eq!(result.override_id, Some(2));
        assert_eq!(result.score, 0.6);
        assert_eq!(result.status, Status::Warn);
    }

    #[test]
    fn test_runner_stats_use_effective_scores() {
        let entries = vec![
            entry(1, 0, record("a", "alpha", 0.2)),
            entry(2, 1, record("b", "alpha", 0.8)),
            entry(3, 2, record("a", "beta", 1.0)),
        ];
        let overrides = vec![correction(1, 1, 1.0, 0)];

        let stats = runner_stats(&entries, &overrides);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].runner, "alpha");
        assert_eq!(stats[0].total_runs, 2);
        assert!((stats[0].average_score - 0.9).abs() < 1e-9);
        assert_eq!(stats[0].pass_rate, 1.0);
        assert_eq!(stats[1].runner, "beta");
    }

    #[test]
    fn test_suite_tree_groups_by_path() {
        let mut nested = record("api > health > responds", "r", 1.0);
        nested.suite_path = Some(vec!["api".to_string(), "health".to_string()]);
        let entries = vec![entry(1, 0, nested), entry(2, 0, record("top", "r", 1.0))];

        let tree = suite_tree(&entries);
        assert_eq!(tree.tests, vec!["top"]);
        let health = &tree.children["api"].children["health"];
        assert_eq!(health.tests, vec!["api > health > responds"]);
    }
}
