//! Named resource vectors shared by jobs, drones and pools
//!
//! Backed by a `BTreeMap` so iteration order, and with it clustering keys,
//! cost tie-breaking and log output, is deterministic across runs.

use std::collections::BTreeMap;

/// Map from resource name (`cores`, `memory`, `disk`, …) to amount.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceMap(BTreeMap<String, f64>);

impl ResourceMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<f64> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    /// Pointwise `self - other` over this map's keys; keys absent in
    /// `other` are kept unchanged.
    pub fn minus(&self, other: &ResourceMap) -> ResourceMap {
        let mut result = self.clone();
        for (key, value) in other.iter() {
            if let Some(current) = result.get(key) {
                result.set(key, current - value);
            }
        }
        result
    }
}

impl<const N: usize> From<[(&str, f64); N]> for ResourceMap {
    fn from(pairs: [(&str, f64); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

impl FromIterator<(String, f64)> for ResourceMap {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
