//! Per-node operation statistics.
//!
//! The schema is fixed: one [`TimingAggregate`] per [`OpCategory`], the
//! start and last-update wall-clock times, and `node_is`, the last log index
//! observed for every peer.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpCategory {
    Set,
    Get,
    Delete,
    Sequence,
    MultiGet,
    TestAndSet,
    Other,
}

impl OpCategory {
    pub const ALL: [OpCategory; 7] = [
        OpCategory::Set,
        OpCategory::Get,
        OpCategory::Delete,
        OpCategory::Sequence,
        OpCategory::MultiGet,
        OpCategory::TestAndSet,
        OpCategory::Other,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    /// Name used in reports, e.g. `set_info`.
    pub fn info_name(self) -> &'static str {
        match self {
            OpCategory::Set => "set_info",
            OpCategory::Get => "get_info",
            OpCategory::Delete => "del_info",
            OpCategory::Sequence => "seq_info",
            OpCategory::MultiGet => "mget_info",
            OpCategory::TestAndSet => "tas_info",
            OpCategory::Other => "op_info",
        }
    }
}

/// Running `n / min / max / avg / var` of durations in seconds.
///
/// Variance is the population variance, updated with Welford's method.
/// Before the first sample `min` is `None` and every other field is zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingAggregate {
    pub n: u64,
    pub min: Option<f64>,
    pub max: f64,
    pub avg: f64,
    pub var: f64,
    m2: f64,
}

impl TimingAggregate {
    pub fn record(&mut self, elapsed: Duration) {
        self.record_secs(elapsed.as_secs_f64());
    }

    pub fn record_secs(&mut self, x: f64) {
        self.n += 1;
        self.min = Some(self.min.map_or(x, |m| m.min(x)));
        self.max = if self.n == 1 { x } else { self.max.max(x) };
        let delta = x - self.avg;
        self.avg += delta / self.n as f64;
        self.m2 += delta * (x - self.avg);
        self.var = self.m2 / self.n as f64;
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Seconds since the Unix epoch at which collection started.
    pub start: f64,
    /// Seconds since the Unix epoch of the last recorded operation.
    pub last: f64,
    timings: [TimingAggregate; OpCategory::ALL.len()],
    pub node_is: BTreeMap<NodeId, u64>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        let now = now_secs();
        Self {
            start: now,
            last: now,
            timings: Default::default(),
            node_is: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, category: OpCategory, elapsed: Duration) {
        self.timings[category.slot()].record(elapsed);
        self.last = now_secs();
    }

    pub fn timing(&self, category: OpCategory) -> &TimingAggregate {
        &self.timings[category.slot()]
    }

    pub fn observe_node(&mut self, node: impl Into<NodeId>, last_index: u64) {
        let slot = self.node_is.entry(node.into()).or_insert(0);
        *slot = (*slot).max(last_index);
    }

    /// Clear timings and restart the collection window; `node_is` is kept.
    pub fn reset(&mut self) {
        let now = now_secs();
        self.start = now;
        self.last = now;
        self.timings = Default::default();
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpCategory, &TimingAggregate)> + '_ {
        OpCategory::ALL.iter().map(move |c| (*c, self.timing(*c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_aggregate_has_no_min() {
        let stats = Statistics::new();
        for (_, t) in stats.iter() {
            assert_eq!(t.n, 0);
            assert_eq!(t.min, None);
            assert_eq!(t.max, 0.0);
            assert_eq!(t.avg, 0.0);
            assert_eq!(t.var, 0.0);
        }
        assert!(stats.start <= stats.last);
    }

    #[test]
    fn welford_matches_population_variance() {
        let mut agg = TimingAggregate::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            agg.record_secs(x);
        }
        assert_eq!(agg.n, 8);
        assert_eq!(agg.min, Some(2.0));
        assert_eq!(agg.max, 9.0);
        assert!((agg.avg - 5.0).abs() < 1e-9);
        assert!((agg.var - 4.0).abs() < 1e-9);
    }

    #[test]
    fn categories_are_tracked_separately() {
        let mut stats = Statistics::new();
        stats.record(OpCategory::Set, Duration::from_millis(2));
        stats.record(OpCategory::Set, Duration::from_millis(4));
        stats.record(OpCategory::Get, Duration::from_millis(1));

        assert_eq!(stats.timing(OpCategory::Set).n, 2);
        assert_eq!(stats.timing(OpCategory::Get).n, 1);
        assert_eq!(stats.timing(OpCategory::Delete).n, 0);
        assert_eq!(OpCategory::Delete.info_name(), "del_info");
    }

    #[test]
    fn node_is_keeps_highest_index() {
        let mut stats = Statistics::new();
        stats.observe_node("node_1", 10);
        stats.observe_node("node_1", 4);
        assert_eq!(stats.node_is.get("node_1"), Some(&10));

        stats.record(OpCategory::Other, Duration::from_millis(1));
        stats.reset();
        assert_eq!(stats.timing(OpCategory::Other).n, 0);
        assert_eq!(stats.node_is.get("node_1"), Some(&10));
    }

    #[test]
    fn schema_has_one_slot_per_category() {
        let mut stats = Statistics::new();
        stats.record(OpCategory::TestAndSet, Duration::from_millis(3));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["timings"].as_array().map(Vec::len), Some(OpCategory::ALL.len()));

        let back: Statistics = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, stats);
        assert_eq!(back.timing(OpCategory::TestAndSet).n, 1);

        // a report missing a category is rejected instead of indexed short
        let mut short = json;
        if let Some(timings) = short["timings"].as_array_mut() {
            timings.pop();
        }
        assert!(serde_json::from_value::<Statistics>(short).is_err());
    }
}
