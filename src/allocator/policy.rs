//! Classification and eviction ordering
//!
//! Pure functions over already-loaded records; no I/O happens here.

use crate::space::SpaceRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::fmt;
use std::time::Duration;

/// How a space relates to a requested spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Not evaluated yet
    Undefined,
    /// Built from an equivalent spec, reuse as is
    CanUse,
    /// Owned by another spec, damaged, or not ready
    NotAvailable,
    /// Idle long enough to be rebuilt for the requested spec
    ReuseTarget,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::CanUse => write!(f, "can-use"),
            Self::NotAvailable => write!(f, "not-available"),
            Self::ReuseTarget => write!(f, "reuse-target"),
        }
    }
}

/// A space together with its classification
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedSpace {
    pub record: SpaceRecord,
    pub classification: Classification,
}

/// Whether a space last used at `last_usage` has been idle for `timeout`
///
/// Usage stamps in the future never count as idle.
pub fn is_idle(last_usage: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    (now - last_usage)
        .to_std()
        .map(|idle| idle >= timeout)
        .unwrap_or(false)
}

/// Classify a ready, undamaged space
pub fn classify(
    matches: bool,
    last_usage: DateTime<Utc>,
    now: DateTime<Utc>,
    reuse_timeout: Duration,
) -> Classification {
    if matches {
        Classification::CanUse
    } else if is_idle(last_usage, now, reuse_timeout) {
        Classification::ReuseTarget
    } else {
        Classification::NotAvailable
    }
}

/// Spaces with the given classification, most recently used first
pub fn most_recent_first(spaces: &[ClassifiedSpace], class: Classification) -> Vec<SpaceRecord> {
    let mut selected = with_class(spaces, class);
    selected.sort_by_key(|r| Reverse(r.last_usage));
    selected
}

/// Spaces with the given classification, least recently used first
pub fn least_recent_first(spaces: &[ClassifiedSpace], class: Classification) -> Vec<SpaceRecord> {
    let mut selected = with_class(spaces, class);
    selected.sort_by_key(|r| r.last_usage);
    selected
}

fn with_class(spaces: &[ClassifiedSpace], class: Classification) -> Vec<SpaceRecord> {
    spaces
        .iter()
        .filter(|s| s.classification == class)
        .map(|s| s.record.clone())
        .collect()
}

/// Healthy idle spaces to delete so that at most `max_retained` remain,
/// least recently used first
pub fn prune_candidates(
    spaces: &[SpaceRecord],
    max_retained: usize,
    now: DateTime<Utc>,
    reuse_timeout: Duration,
) -> Vec<SpaceRecord> {
    let excess = spaces.len().saturating_sub(max_retained);
    let mut idle: Vec<SpaceRecord> = spaces
        .iter()
        .filter(|r| r.is_usable())
        .filter(|r| r.last_usage.map_or(true, |ts| is_idle(ts, now, reuse_timeout)))
        .cloned()
        .collect();
    idle.sort_by_key(|r| r.last_usage);
    idle.truncate(excess);
    idle
}
