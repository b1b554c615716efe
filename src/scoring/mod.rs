//! Score thresholds and status tiers.
//!
//! A judge returns a raw score in `[0, 1]`. [`Thresholds`] maps that score to
//! a discrete [`Status`]. Weighted sub-tasks are folded into a single score
//! with [`weighted_score`] before thresholding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default score at or above which a run passes.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.7;

/// Default score at or above which a failing run is downgraded to a warning.
pub const DEFAULT_WARN_THRESHOLD: f64 = 0.5;

/// Discrete outcome tier for a scored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pass,
    Warn,
    Fail,
}

impl Status {
    /// Returns true for tiers that count as passing.
    pub fn is_passing(&self) -> bool {
        !matches!(self, Status::Fail)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pass => write!(f, "pass"),
            Status::Warn => write!(f, "warn"),
            Status::Fail => write!(f, "fail"),
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Status::Pass),
            "warn" => Ok(Status::Warn),
            "fail" => Ok(Status::Fail),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Named cut points mapping a score to a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_pass")]
    pub pass: f64,
    #[serde(default = "default_warn")]
    pub warn: f64,
}

fn default_pass() -> f64 {
    DEFAULT_PASS_THRESHOLD
}

fn default_warn() -> f64 {
    DEFAULT_WARN_THRESHOLD
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pass: DEFAULT_PASS_THRESHOLD,
            warn: DEFAULT_WARN_THRESHOLD,
        }
    }
}

impl Thresholds {
    /// Creates validated thresholds.
    pub fn new(pass: f64, warn: f64) -> Result<Self, ValidationError> {
        let thresholds = Self { pass, warn };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Checks that both cut points lie in `[0, 1]` and `warn <= pass`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.pass) || !in_range(self.warn) || self.warn > self.pass {
            return Err(ValidationError::InvalidThresholds {
                pass: self.pass,
                warn: self.warn,
            });
        }
        Ok(())
    }

    /// Maps a raw score to its status tier.
    pub fn status(&self, score: f64) -> Status {
        if score >= self.pass {
            Status::Pass
        } else if score >= self.warn {
            Status::Warn
        } else {
            Status::Fail
        }
    }

    /// Whether a score clears the pass line.
    pub fn passes(&self, score: f64) -> bool {
        score >= self.pass
    }
}

/// Checks a score is a finite number in `[0, 1]`.
pub fn validate_score(score: f64) -> Result<(), ValidationError> {
    if score.is_finite() && (0.0..=1.0).contains(&score) {
        Ok(())
    } else {
        Err(ValidationError::ScoreOutOfRange(score))
    }
}

/// A score contribution with its weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScore {
    pub name: String,
    pub score: f64,
    pub weight: f64,
}

impl WeightedScore {
    pub fn new(name: impl Into<String>, score: f64, weight: Option<f64>) -> Self {
        Self {
            name: name.into(),
            score,
            weight: weight.unwrap_or(1.0),
        }
    }
}

/// Weighted average of scores. Returns 0.0 for an empty slice.
pub fn weighted_score(parts: &[WeightedScore]) -> Result<f64, ValidationError> {
    let mut total_weight = 0.0;
    let mut sum = 0.0;
    for part in parts {
        if !part.weight.is_finite() || part.weight <= 0.0 {
            return Err(ValidationError::InvalidWeight {
                name: part.name.clone(),
                weight: part.weight,
            });
        }
        validate_score(part.score)?;
        total_weight += part.weight;
        sum += part.score * part.weight;
    }
    if total_weight == 0.0 {
        return Ok(0.0);
    }
    Ok(sum / total_weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let t = Thresholds::default();
        assert_eq!(t.status(0.9), Status::Pass);
        assert_eq!(t.status(0.7), Status::Pass);
        assert_eq!(t.status(0.6), Status::Warn);
        assert_eq!(t.status(0.5), Status::Warn);
        assert_eq!(t.status(0.2), Status::Fail);
    }

    #[test]
    fn test_thresholds_validation() {
        assert!(Thresholds::new(0.8, 0.6).is_ok());
        assert!(Thresholds::new(0.5, 0.6).is_err());
        assert!(Thresholds::new(1.2, 0.6).is_err());
        assert!(Thresholds::new(0.8, -0.1).is_err());
    }

    #[test]
    fn test_status_ordering_puts_fail_last() {
        let mut statuses = vec![Status::Fail, Status::Pass, Status::Warn];
        statuses.sort();
        assert_eq!(statuses, vec![Status::Pass, Status::Warn, Status::Fail]);
        assert!(Status::Warn.is_passing());
        assert!(!Status::Fail.is_passing());
        assert_eq!("warn".parse::<Status>().unwrap(), Status::Warn);
        assert!("error".parse::<Status>().is_err());
    }

    #[test]
    fn test_weighted_score_defaults_weight_to_one() {
        let parts = vec![
            WeightedScore::new("a", 1.0, None),
            WeightedScore::new("b", 0.0, None),
        ];
        assert!((weighted_score(&parts).unwrap() - 0.5).abs() < 1e-9);

        let parts = vec![
            WeightedScore::new("a", 1.0, Some(3.0)),
            WeightedScore::new("b", 0.0, Some(1.0)),
        ];
        assert!((weighted_score(&parts).unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_score_rejects_bad_weights() {
        let parts = vec![WeightedScore::new("a", 1.0, Some(0.0))];
        assert!(matches!(
            weighted_score(&parts),
            Err(ValidationError::InvalidWeight { .. })
        ));
        assert_eq!(weighted_score(&[]).unwrap(), 0.0);
    }

    #[test]
    fn test_validate_score() {
        assert!(validate_score(0.0).is_ok());
        assert!(validate_score(1.0).is_ok());
        assert!(validate_score(1.01).is_err());
        assert!(validate_score(f64::NAN).is_err());
    }
}
