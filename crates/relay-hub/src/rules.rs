//! Routing rules: pattern → worker id.
//!
//! Pattern forms:
//!
//! | Pattern | Matches |
//! |---|---|
//! | `grp:123` | exactly `grp:123` |
//! | `*` | every key |
//! | `grp:*` | keys starting with `grp:` |
//! | `*:123` | keys ending with `:123` |
//!
//! A `*` in the middle of a pattern is literal. A pattern with `*` at both
//! ends ranks as a prefix pattern but matches either way: `*a*` matches keys
//! starting with `*a` and keys ending with `a*`.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::HubError;

/// One routing rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Key pattern.
    pub pattern: String,
    /// Target worker id.
    pub target: String,
}

impl RoutingRule {
    /// Build a rule.
    pub fn new(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target: target.into(),
        }
    }
}

/// Structural form of a pattern, in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Exact,
    Any,
    Prefix,
    Suffix,
}

fn classify(pattern: &str) -> (Tier, &str) {
    if pattern == "*" {
        (Tier::Any, "")
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        (Tier::Prefix, prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        (Tier::Suffix, suffix)
    } else {
        (Tier::Exact, pattern)
    }
}

/// Whether `pattern` matches `key`.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    match classify(pattern) {
        (Tier::Exact, p) => key == p,
        (Tier::Any, _) => true,
        (Tier::Prefix, p) => {
            key.starts_with(p) || pattern.strip_prefix('*').is_some_and(|s| key.ends_with(s))
        }
        (Tier::Suffix, s) => key.ends_with(s),
    }
}

/// Read-mostly rule table with precedence applied at build time.
///
/// Exact beats `*`, which beats prefix, which beats suffix. Within a tier the
/// longest pattern wins; equal lengths fall back to byte order.
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    ordered: Vec<RoutingRule>,
}

impl RoutingTable {
    /// Build from rules. A repeated pattern keeps its last target.
    pub fn new(rules: impl IntoIterator<Item = RoutingRule>) -> Self {
        let unique: BTreeMap<String, String> =
            rules.into_iter().map(|r| (r.pattern, r.target)).collect();
        let mut ordered: Vec<RoutingRule> = unique
            .into_iter()
            .map(|(pattern, target)| RoutingRule { pattern, target })
            .collect();
        ordered.sort_by(|a, b| {
            let key = |r: &RoutingRule| {
                let (tier, _) = classify(&r.pattern);
                (tier, Reverse(r.pattern.len()))
            };
            key(a).cmp(&key(b)).then_with(|| a.pattern.cmp(&b.pattern))
        });
        Self { ordered }
    }

    /// Highest-precedence rule matching `key`.
    pub fn resolve(&self, key: &str) -> Option<&RoutingRule> {
        self.ordered.iter().find(|r| pattern_matches(&r.pattern, key))
    }

    /// Rules in precedence order.
    pub fn rules(&self) -> &[RoutingRule] {
        &self.ordered
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Backing store for routing rules. Persistence lives outside the hub.
#[async_trait]
pub trait RoutingRuleStore: Send + Sync {
    /// Load every rule.
    async fn load(&self) -> Result<Vec<RoutingRule>, HubError>;
    /// Insert or replace the rule for `rule.pattern`.
    async fn upsert(&self, rule: RoutingRule) -> Result<(), HubError>;
    /// Delete the rule for `pattern`. Returns whether one existed.
    async fn delete(&self, pattern: &str) -> Result<bool, HubError>;
}

/// In-process rule store.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: RwLock<BTreeMap<String, String>>,
}

impl MemoryRuleStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `rules`.
    pub fn with_rules(rules: impl IntoIterator<Item = RoutingRule>) -> Self {
        Self {
            rules: RwLock::new(rules.into_iter().map(|r| (r.pattern, r.target)).collect()),
        }
    }
}

#[async_trait]
impl RoutingRuleStore for MemoryRuleStore {
    async fn load(&self) -> Result<Vec<RoutingRule>, HubError> {
        Ok(self
            .rules
            .read()
            .iter()
            .map(|(p, t)| RoutingRule::new(p.clone(), t.clone()))
            .collect())
    }

    async fn upsert(&self, rule: RoutingRule) -> Result<(), HubError> {
        let _ = self.rules.write().insert(rule.pattern, rule.target);
        Ok(())
    }

    async fn delete(&self, pattern: &str) -> Result<bool, HubError> {
        Ok(self.rules.write().remove(pattern).is_some())
    }
}
