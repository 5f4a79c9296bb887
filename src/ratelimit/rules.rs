//! Named limit rules loaded from configuration.
//!
//! Rules let deployments describe their quotas in YAML and look them up by
//! name instead of hard-coding [`Limit`] values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::limit::{Limit, TimeWindow};
use crate::error::{Error, Result};

/// A table of named limit rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimitRules {
    rules: HashMap<String, LimitRule>,
}

/// A single rule: `rate` per `unit` with a `burst` capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Units replenished per time unit
    pub rate: i64,
    /// Maximum units grantable at once. Defaults to the rate.
    #[serde(default)]
    pub burst: Option<i64>,
    /// The time unit
    pub unit: TimeUnit,
}

/// Time unit for rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl From<TimeUnit> for TimeWindow {
    fn from(unit: TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => TimeWindow::Second,
            TimeUnit::Minute => TimeWindow::Minute,
            TimeUnit::Hour => TimeWindow::Hour,
            TimeUnit::Day => TimeWindow::Day,
        }
    }
}

impl LimitRule {
    /// The [`Limit`] this rule describes.
    pub fn to_limit(&self) -> Limit {
        Limit::per_window(self.unit.into(), self.rate, self.burst.unwrap_or(self.rate))
    }
}

impl LimitRules {
    /// Create an empty rule table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse limit rules: {}", e)))
    }

    /// Add or replace a rule.
    pub fn insert(&mut self, name: impl Into<String>, rule: LimitRule) {
        self.rules.insert(name.into(), rule);
    }

    /// Look up a rule by name.
    pub fn get(&self, name: &str) -> Option<&LimitRule> {
        self.rules.get(name)
    }

    /// Look up a rule by name and return its limit.
    pub fn limit(&self, name: &str) -> Option<Limit> {
        self.get(name).map(LimitRule::to_limit)
    }

    /// Names of all rules, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
