/// An insertion-ordered set of `key=value` tags.
///
/// OpenTSDB treats tags as a map, but the emitted line order is visible to
/// downstream consumers and the parser pipeline builds tags in a meaningful
/// order (parameters first, rule tags, then the host tag), so a plain
/// hash map is not good enough here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagSet(Vec<(String, String)>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace. An existing key keeps its position; a new key is
    /// appended.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Insert only when the key is not already present.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.contains_key(&key) {
            self.0.push((key, value.into()));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    /// Move `old` to the end of the set under the name `new`. Used by the
    /// named and jmx parsers to keep parsed `host` parameters from
    /// colliding with the outer host tag.
    pub fn rename(&mut self, old: &str, new: impl Into<String>) {
        if let Some(value) = self.remove(old) {
            self.insert(new, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut set = TagSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// A cached `itemid → metric` mapping. An empty `metric` is a negative
/// cache entry: the item is known but could not be mapped, and the
/// expensive pipeline is skipped until the row expires.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMapping {
    pub itemid: u64,
    /// Host name as Zabbix reports it, before any sanitization.
    pub host: String,
    /// The unexpanded Zabbix item key.
    pub key: String,
    pub metric: String,
    pub tags: TagSet,
    /// Unix seconds after which the mapping must be rebuilt.
    pub next_refresh_at: i64,
}

impl ItemMapping {
    pub fn is_mappable(&self) -> bool {
        !self.metric.is_empty()
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        now < self.next_refresh_at
    }
}

/// Aggregate state of the item cache, for the telemetry loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub total: u64,
    pub active: u64,
    pub expired: u64,
    pub per_host: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_order_and_replaces_in_place() {
        let mut tags = TagSet::new();
        tags.insert("cpu", "all");
        tags.insert("sampleInterval", "avg1");
        tags.insert("cpu", "0");
        let collected: Vec<_> = tags.iter().collect();
        assert_eq!(collected, vec![("cpu", "0"), ("sampleInterval", "avg1")]);
    }

    #[test]
    fn insert_if_absent_does_not_override() {
        let mut tags = TagSet::new();
        tags.insert("host", "web01");
        tags.insert_if_absent("host", "other");
        assert_eq!(tags.get("host"), Some("web01"));
    }

    #[test]
    fn rename_moves_to_end() {
        let mut tags = TagSet::new();
        tags.insert("host", "inner");
        tags.insert("type", "Memory");
        tags.rename("host", "jmx_host");
        let collected: Vec<_> = tags.iter().collect();
        assert_eq!(collected, vec![("type", "Memory"), ("jmx_host", "inner")]);
    }

    #[test]
    fn negative_cache_entry_is_unmappable() {
        let m = ItemMapping {
            itemid: 7,
            host: "web01".into(),
            key: "{$UNDEF}.thing".into(),
            metric: String::new(),
            tags: TagSet::new(),
            next_refresh_at: 100,
        };
        assert!(!m.is_mappable());
        assert!(m.is_fresh(99));
        assert!(!m.is_fresh(100));
    }
}
