//! # System Constants
//!
//! Service names, storage key layout and startup defaults shared across the
//! resilience core.

/// Service names registered with the degradation coordinator
pub mod services {
    pub const DATABASE: &str = "database";
    pub const CACHE: &str = "cache";
}

/// Write operation kinds carried by queued writes
pub mod operations {
    pub const INSERT: &str = "insert";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const UPSERT: &str = "upsert";
}

/// Shared-backend key layout.
///
/// Every cache key of a namespace carries the `{namespace}` hash tag, so a
/// namespace's values and bookkeeping sets live in one cluster slot and a
/// script may touch all of them.
pub mod keys {
    /// `{prefix}:writeq:{shard}`
    pub fn write_queue(prefix: &str, shard_id: u32) -> String {
        format!("{prefix}:writeq:{shard_id}")
    }

    /// `{prefix}:writeq:{shard}:dedup`
    pub fn write_queue_dedup(prefix: &str, shard_id: u32) -> String {
        format!("{prefix}:writeq:{shard_id}:dedup")
    }

    /// `{prefix}:{{namespace}}:{key}`
    pub fn cache_entry(prefix: &str, namespace: &str, key: &str) -> String {
        format!("{prefix}:{{{namespace}}}:{key}")
    }

    /// `{prefix}:__lru:{{namespace}}`; the double underscore keeps it outside
    /// every namespace's SCAN pattern
    pub fn cache_recency(prefix: &str, namespace: &str) -> String {
        format!("{prefix}:__lru:{{{namespace}}}")
    }

    /// `{prefix}:__exp:{{namespace}}`, members scored by expiry in ms
    pub fn cache_expiry(prefix: &str, namespace: &str) -> String {
        format!("{prefix}:__exp:{{{namespace}}}")
    }

    /// Access counter that scores the recency set
    pub fn cache_tick(prefix: &str, namespace: &str) -> String {
        format!("{prefix}:__lru:{{{namespace}}}:tick")
    }

    /// `{prefix}:{{namespace}}:*`
    pub fn namespace_pattern(prefix: &str, namespace: &str) -> String {
        format!("{prefix}:{{{namespace}}}:*")
    }
}

/// Tables the dynamic statement builders may touch by default. `users` is not
/// writable through the builders.
pub const DEFAULT_ALLOWED_TABLES: &[&str] = &[
    "guild_settings",
    "mod_cases",
    "warnings",
    "mutes",
    "bans",
    "automod_rules",
    "automod_violations",
    "mod_notes",
    "reaction_roles",
    "music_queues",
    "music_history",
    "playlists",
];

/// `(name, ttl_seconds, max_entries)`
pub const DEFAULT_CACHE_NAMESPACES: &[(&str, u64, usize)] = &[
    ("guild_settings", 3600, 10_000),
    ("user_profiles", 1800, 50_000),
    ("rate_limits", 60, 100_000),
    ("cooldowns", 300, 100_000),
    ("moderation", 86_400, 50_000),
    ("music_queue", 7200, 5_000),
    ("api_responses", 300, 10_000),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::write_queue("warden", 3), "warden:writeq:3");
        assert_eq!(keys::write_queue_dedup("warden", 3), "warden:writeq:3:dedup");
        assert_eq!(
            keys::cache_entry("warden", "cooldowns", "ban:42"),
            "warden:{cooldowns}:ban:42"
        );
        assert_eq!(keys::namespace_pattern("warden", "cooldowns"), "warden:{cooldowns}:*");
        assert_eq!(keys::cache_tick("warden", "cooldowns"), "warden:__lru:{cooldowns}:tick");
    }

    /// Redis hashes only the first `{...}` section of a key
    fn hash_tag(key: &str) -> &str {
        let open = key.find('{').unwrap();
        let close = key[open..].find('}').unwrap() + open;
        &key[open + 1..close]
    }

    #[test]
    fn test_namespace_keys_share_one_slot() {
        let keys = [
            keys::cache_entry("warden", "cooldowns", "user:{7}"),
            keys::cache_recency("warden", "cooldowns"),
            keys::cache_expiry("warden", "cooldowns"),
            keys::cache_tick("warden", "cooldowns"),
        ];
        for key in &keys {
            assert_eq!(hash_tag(key), "cooldowns", "{key}");
        }
    }

    #[test]
    fn test_bookkeeping_keys_stay_outside_the_scan_pattern() {
        let pattern = keys::namespace_pattern("warden", "cooldowns");
        let scanned = pattern.trim_end_matches('*');
        for key in [
            keys::cache_recency("warden", "cooldowns"),
            keys::cache_expiry("warden", "cooldowns"),
            keys::cache_tick("warden", "cooldowns"),
        ] {
            assert!(!key.starts_with(scanned), "{key}");
        }
    }
}
