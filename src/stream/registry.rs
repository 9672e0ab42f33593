//! Channel and filter bookkeeping.
//!
//! The registry is the single source of truth for what the client is
//! subscribed to. It outlives individual connections and is replayed in full
//! after every successful reconnect.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::stream::proto::FilterConfig;

/// How [`SubscriptionRegistry::set_filter`] decides a filter is unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterDedup {
    /// Unchanged only when the same `Arc` is passed again.
    #[default]
    Identity,
    /// Unchanged when the new config compares equal to the stored one.
    ByValue,
}

/// Point-in-time copy of the registry contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub channels: Vec<String>,
    pub filters: BTreeMap<String, FilterConfig>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: BTreeSet<String>,
    filters: BTreeMap<String, Arc<FilterConfig>>,
    dedup: FilterDedup,
}

impl SubscriptionRegistry {
    pub fn new(dedup: FilterDedup) -> Self {
        Self {
            dedup,
            ..Self::default()
        }
    }

    /// Adds a channel. Returns `false` when it was already a member.
    pub fn join(&mut self, channel: &str) -> bool {
        if self.channels.contains(channel) {
            return false;
        }
        self.channels.insert(channel.to_string())
    }

    /// Removes a channel. Returns whether it was a member.
    pub fn leave(&mut self, channel: &str) -> bool {
        self.channels.remove(channel)
    }

    /// Stores `spec` under `filter_type`. Returns `false` when the stored
    /// entry is considered unchanged.
    pub fn set_filter(&mut self, filter_type: &str, spec: Arc<FilterConfig>) -> bool {
        if let Some(current) = self.filters.get(filter_type) {
            let unchanged = match self.dedup {
                FilterDedup::Identity => Arc::ptr_eq(current, &spec),
                FilterDedup::ByValue => current.as_ref() == spec.as_ref(),
            };
            if unchanged {
                return false;
            }
        }
        self.filters.insert(filter_type.to_string(), spec);
        true
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }

    pub fn filters(&self) -> impl Iterator<Item = (&str, &FilterConfig)> {
        self.filters
            .iter()
            .map(|(filter_type, spec)| (filter_type.as_str(), spec.as_ref()))
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            channels: self.channels(),
            filters: self
                .filters()
                .map(|(filter_type, spec)| (filter_type.to_string(), spec.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{FilterDedup, SubscriptionRegistry};
    use crate::stream::proto::{FilterConfig, TagTypeMode};

    #[test]
    fn join_is_idempotent() {
        let mut registry = SubscriptionRegistry::default();
        assert!(registry.join("repo:team:1"));
        assert!(!registry.join("repo:team:1"));
        assert_eq!(registry.channels(), vec!["repo:team:1".to_string()]);
    }

    #[test]
    fn leave_tolerates_unknown_channels() {
        let mut registry = SubscriptionRegistry::default();
        assert!(!registry.leave("never:joined:0"));
        registry.join("a:b:c");
        assert!(registry.leave("a:b:c"));
        assert!(!registry.contains("a:b:c"));
    }

    #[test]
    fn identity_dedup_resends_equal_but_distinct_configs() {
        let mut registry = SubscriptionRegistry::new(FilterDedup::Identity);
        let spec = Arc::new(FilterConfig::default());

        assert!(registry.set_filter("activity", Arc::clone(&spec)));
        assert!(!registry.set_filter("activity", Arc::clone(&spec)));
        assert!(registry.set_filter("activity", Arc::new(FilterConfig::default())));
    }

    #[test]
    fn value_dedup_ignores_equal_configs() {
        let mut registry = SubscriptionRegistry::new(FilterDedup::ByValue);
        assert!(registry.set_filter("activity", Arc::new(FilterConfig::default())));
        assert!(!registry.set_filter("activity", Arc::new(FilterConfig::default())));

        let changed = FilterConfig {
            tag_type_mode: TagTypeMode::Or,
            ..FilterConfig::default()
        };
        assert!(registry.set_filter("activity", Arc::new(changed.clone())));
        assert_eq!(registry.snapshot().filters.get("activity"), Some(&changed));
    }

    #[test]
    fn last_filter_write_wins_per_type() {
        let mut registry = SubscriptionRegistry::default();
        registry.set_filter("a", Arc::new(FilterConfig::default()));
        let or_mode = FilterConfig {
            tag_type_mode: TagTypeMode::Or,
            ..FilterConfig::default()
        };
        registry.set_filter("a", Arc::new(or_mode.clone()));
        registry.set_filter("b", Arc::new(FilterConfig::default()));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.filters.len(), 2);
        assert_eq!(snapshot.filters["a"], or_mode);
    }
}
