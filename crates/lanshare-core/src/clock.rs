//! Vector clocks for detecting concurrent modifications of shared data
//!
//! Each monitored data set carries one clock: a map from device identifier
//! to a logical counter. A device increments its own entry whenever it makes
//! a local change; receiving a remote version merges element-wise maxima.
//!
//! ```text
//! A = {a:2, b:1}    B = {a:1, b:1}   => A after B
//! A = {a:2, b:1}    B = {a:1, b:2}   => concurrent (conflict)
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Causal relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// Every counter is equal
    Equal,
    /// `self` happened before `other` (other dominates)
    Before,
    /// `self` happened after `other` (self dominates)
    After,
    /// Neither dominates: independent changes on both sides
    Concurrent,
}

/// Per-device logical counters. Missing entries count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a device (zero when absent)
    pub fn get(&self, device_id: &str) -> u64 {
        self.counters.get(device_id).copied().unwrap_or(0)
    }

    /// Record a local change made by `device_id`. Returns the new counter.
    pub fn increment(&mut self, device_id: &str) -> u64 {
        let counter = self.counters.entry(device_id.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Element-wise maximum with `other`. Counters never decrease.
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &theirs) in &other.counters {
            let ours = self.counters.entry(device.clone()).or_insert(0);
            *ours = (*ours).max(theirs);
        }
    }

    /// Merged copy of two clocks
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut clock = self.clone();
        clock.merge(other);
        clock
    }

    /// Compare causal order against `other`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        for device in self.counters.keys().chain(other.counters.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Greater => self_greater = true,
                Ordering::Less => other_greater = true,
                Ordering::Equal => {}
            }
            if self_greater && other_greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_greater, other_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when `self` is strictly newer than `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    /// Sum of all counters, used for last-writer-wins tie breaking.
    pub fn logical_sum(&self) -> u64 {
        self.counters
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Whether no device has recorded a change yet
    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|v| *v == 0)
    }

    /// Iterate over (device, counter) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (device, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", device, counter)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}
