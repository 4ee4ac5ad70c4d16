//! In-memory TTL cache for convenience reads.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Resource categories with independently configured lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Users,
    Groups,
    Licenses,
    Mailboxes,
    Reports,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Users,
        ResourceKind::Groups,
        ResourceKind::Licenses,
        ResourceKind::Mailboxes,
        ResourceKind::Reports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Users => "users",
            ResourceKind::Groups => "groups",
            ResourceKind::Licenses => "licenses",
            ResourceKind::Mailboxes => "mailboxes",
            ResourceKind::Reports => "reports",
        }
    }

    /// Default lifetime: short for directory lists, long for the SKU catalog.
    pub fn default_ttl(&self) -> Duration {
        match self {
            ResourceKind::Users => Duration::minutes(5),
            ResourceKind::Groups => Duration::minutes(5),
            ResourceKind::Licenses => Duration::hours(1),
            ResourceKind::Mailboxes => Duration::minutes(10),
            ResourceKind::Reports => Duration::minutes(30),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Option<Value>,
    pub last_updated: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl CacheEntry {
    pub fn new(data: Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            data: Some(data),
            last_updated: now,
            ttl_seconds: ttl.num_seconds(),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.data.is_some() && now - self.last_updated < Duration::seconds(self.ttl_seconds)
    }
}

/// Per-client response cache keyed by kind and request path/query.
#[derive(Debug)]
pub struct ResponseCache {
    ttls: HashMap<ResourceKind, Duration>,
    entries: Mutex<HashMap<(ResourceKind, String), CacheEntry>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            ttls: ResourceKind::ALL.iter().map(|kind| (*kind, kind.default_ttl())).collect(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, kind: ResourceKind, ttl: Duration) -> Self {
        self.ttls.insert(kind, ttl);
        self
    }

    pub fn ttl(&self, kind: ResourceKind) -> Duration {
        self.ttls.get(&kind).copied().unwrap_or_else(|| kind.default_ttl())
    }

    pub fn get(&self, kind: ResourceKind, key: &str) -> Option<Value> {
        self.get_at(kind, key, Utc::now())
    }

    pub fn get_at(&self, kind: ResourceKind, key: &str, now: DateTime<Utc>) -> Option<Value> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(&(kind, key.to_string()))?;
        if entry.is_valid_at(now) {
            debug!("Response cache hit for {} {}", kind, key);
            entry.data.clone()
        } else {
            None
        }
    }

    pub fn insert(&self, kind: ResourceKind, key: &str, data: Value) {
        self.insert_at(kind, key, data, Utc::now())
    }

    pub fn insert_at(&self, kind: ResourceKind, key: &str, data: Value, now: DateTime<Utc>) {
        let entry = CacheEntry::new(data, self.ttl(kind), now);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((kind, key.to_string()), entry);
        }
    }

    /// Drop every entry of one kind.
    pub fn invalidate(&self, kind: ResourceKind) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(entry_kind, _), _| *entry_kind != kind);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_validity() {
        let now = Utc::now();
        let entry = CacheEntry::new(json!([1, 2]), Duration::seconds(60), now);
        assert!(entry.is_valid_at(now + Duration::seconds(59)));
        assert!(!entry.is_valid_at(now + Duration::seconds(60)));

        let empty = CacheEntry {
            data: None,
            ..entry
        };
        assert!(!empty.is_valid_at(now));
    }

    #[test]
    fn test_kinds_expire_independently() {
        let cache = ResponseCache::new().with_ttl(ResourceKind::Users, Duration::seconds(10));
        let now = Utc::now();
        cache.insert_at(ResourceKind::Users, "users", json!(["u"]), now);
        cache.insert_at(ResourceKind::Licenses, "subscribedSkus", json!(["sku"]), now);

        let later = now + Duration::seconds(30);
        assert!(cache.get_at(ResourceKind::Users, "users", later).is_none());
        assert_eq!(cache.get_at(ResourceKind::Licenses, "subscribedSkus", later), Some(json!(["sku"])));
    }

    #[test]
    fn test_keys_are_scoped_by_kind() {
        let cache = ResponseCache::new();
        cache.insert(ResourceKind::Users, "users", json!(["user"]));
        assert!(cache.get(ResourceKind::Mailboxes, "users").is_none());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ResponseCache::new();
        cache.insert(ResourceKind::Users, "users", json!([]));
        cache.insert(ResourceKind::Groups, "groups", json!([]));

        cache.invalidate(ResourceKind::Users);
        assert!(cache.get(ResourceKind::Users, "users").is_none());
        assert!(cache.get(ResourceKind::Groups, "groups").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }
}
