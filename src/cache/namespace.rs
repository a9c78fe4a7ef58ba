//! Namespace registry, fixed at startup

use crate::config::{CacheConfig, NamespaceConfig};
use crate::error::{WardenError, WardenResult};
use std::collections::HashMap;
use std::time::Duration;

/// TTL and capacity of one namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespacePolicy {
    pub ttl: Duration,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceRegistry {
    policies: HashMap<String, NamespacePolicy>,
}

impl NamespaceRegistry {
    pub fn from_config(config: &CacheConfig) -> WardenResult<Self> {
        Self::from_namespaces(&config.namespaces)
    }

    pub fn from_namespaces(namespaces: &[NamespaceConfig]) -> WardenResult<Self> {
        let mut policies = HashMap::with_capacity(namespaces.len());
        for namespace in namespaces {
            namespace
                .validate()
                .map_err(|e| WardenError::ConfigurationError(e.to_string()))?;
            if namespace.name.starts_with("__") {
                return Err(WardenError::ConfigurationError(format!(
                    "Namespace '{}' uses the reserved '__' prefix",
                    namespace.name
                )));
            }
            let policy = NamespacePolicy {
                ttl: namespace.ttl(),
                max_entries: namespace.max_entries,
            };
            if policies.insert(namespace.name.clone(), policy).is_some() {
                return Err(WardenError::ConfigurationError(format!(
                    "Duplicate cache namespace '{}'",
                    namespace.name
                )));
            }
        }
        Ok(Self { policies })
    }

    /// Policy of a configured namespace
    pub fn policy(&self, namespace: &str) -> WardenResult<NamespacePolicy> {
        self.policies.get(namespace).copied().ok_or_else(|| {
            WardenError::validation(format!("Unknown cache namespace '{namespace}'"))
        })
    }

    /// Checks both halves of an address before any tier is touched
    pub fn check(&self, namespace: &str, key: &str) -> WardenResult<NamespacePolicy> {
        let policy = self.policy(namespace)?;
        if key.is_empty() {
            return Err(WardenError::validation(format!(
                "Empty cache key in namespace '{namespace}'"
            )));
        }
        Ok(policy)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.policies.contains_key(namespace)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_registered() {
        let registry = NamespaceRegistry::from_config(&CacheConfig::default()).unwrap();
        let cooldowns = registry.policy("cooldowns").unwrap();
        assert_eq!(cooldowns.ttl, Duration::from_secs(300));
        assert!(registry.contains("rate_limits"));
    }

    #[test]
    fn test_unknown_namespace_and_empty_key_are_rejected() {
        let registry = NamespaceRegistry::from_config(&CacheConfig::default()).unwrap();
        assert!(matches!(
            registry.policy("sessions"),
            Err(WardenError::ValidationError(_))
        ));
        assert!(matches!(
            registry.check("cooldowns", ""),
            Err(WardenError::ValidationError(_))
        ));
    }

    #[test]
    fn test_reserved_prefix_is_rejected() {
        let err = NamespaceRegistry::from_namespaces(&[NamespaceConfig::new(
            "__lru",
            Duration::from_secs(1),
            1,
        )])
        .unwrap_err();
        assert!(matches!(err, WardenError::ConfigurationError(_)));
    }
}
