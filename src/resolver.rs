use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;

use crate::config::BridgeConfig;
use crate::keymap::{self, HostRuleSet, RuleSet};
use crate::map_store::{GLOBAL_HOST, MapStore};
use crate::models::{ItemMapping, TagSet};
use crate::sanitize::Sanitizer;
use crate::stats::{self, Counters};
use crate::zabbix_db::ZabbixDb;

static MACRO_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\$\w+\}").expect("macro token pattern"));

/// After this many consecutive failed resolves of one itemid, it is
/// negative-cached so the broken item stops hammering the Zabbix DB.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Outcome of a resolve. Transport and store failures are reported
/// separately as errors; these three are the well-defined answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ItemMapping),
    /// The item exists but cannot be mapped to a metric (unresolved macro,
    /// unparseable key, ignored host). A negative cache row suppresses the
    /// pipeline until the TTL elapses.
    Unmappable,
    /// Zabbix does not know the itemid at all.
    NotFound,
}

/// Expand `{$WORD}` macros in an item key. Host macros win over the
/// configured per-host macros, which win over the configured globals.
/// The fixed-point iteration is bounded by the number of tokens in the
/// original string, so a macro expanding to another macro cannot loop.
/// Returns `None` when a token is left without a binding.
pub fn expand_macros(
    key: &str,
    host_macros: &HashMap<String, String>,
    config_host: Option<&HashMap<String, String>>,
    config_global: Option<&HashMap<String, String>>,
) -> Option<String> {
    let initial_tokens = MACRO_TOKEN.find_iter(key).count();
    if initial_tokens == 0 {
        return Some(key.to_string());
    }
    let mut expanded = key.to_string();
    for _ in 0..initial_tokens {
        let Some(found) = MACRO_TOKEN.find(&expanded) else {
            return Some(expanded);
        };
        let token = found.as_str();
        let binding = host_macros
            .get(token)
            .or_else(|| config_host.and_then(|m| m.get(token)))
            .or_else(|| config_global.and_then(|m| m.get(token)));
        match binding {
            Some(value) => expanded = expanded.replace(token, value),
            None => break,
        }
    }
    if MACRO_TOKEN.is_match(&expanded) {
        None
    } else {
        Some(expanded)
    }
}

/// Translates itemids into metric mappings: cache hit, or the full
/// pipeline of Zabbix lookup, macro expansion, key parsing, host tagging
/// and sanitization, persisted with a jittered TTL.
pub struct Resolver {
    store: Arc<MapStore>,
    db: ZabbixDb,
    rules: RuleSet,
    host_rules: HostRuleSet,
    sanitizer: Arc<Sanitizer>,
    config_macros: HashMap<String, HashMap<String, String>>,
    ignored_keys: Vec<String>,
    ignored_hosts: Vec<String>,
    counters: Arc<Counters>,
    fail_counts: Mutex<HashMap<u64, u32>>,
}

impl Resolver {
    pub fn new(
        config: &BridgeConfig,
        store: Arc<MapStore>,
        db: ZabbixDb,
        sanitizer: Arc<Sanitizer>,
        counters: Arc<Counters>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            db,
            rules: RuleSet::compile(&config.mappings.item_key)?,
            host_rules: HostRuleSet::compile(&config.mappings.item_host)?,
            sanitizer,
            config_macros: config.mappings.macros.clone(),
            ignored_keys: config.ignored_keys.clone(),
            ignored_hosts: config.ignored_hosts.clone(),
            counters,
            fail_counts: Mutex::new(HashMap::new()),
        })
    }

    pub async fn resolve(&self, itemid: u64) -> anyhow::Result<Resolution> {
        let now = chrono::Utc::now().timestamp();
        let cached = self.store.get_item(itemid)?;
        let had_row = cached.is_some();
        if let Some(mapping) = cached {
            if mapping.is_fresh(now) {
                stats::inc(&self.counters.items_cache_reads);
                return Ok(if mapping.is_mappable() {
                    Resolution::Resolved(mapping)
                } else {
                    Resolution::Unmappable
                });
            }
        }

        match self.refresh_item(itemid).await {
            Ok(resolution) => {
                self.fail_counts.lock().unwrap().remove(&itemid);
                if !had_row {
                    if let Resolution::Resolved(mapping) = &resolution {
                        stats::inc(&self.counters.updated);
                        tracing::info!(itemid, key = %mapping.key, "added item to mapping cache");
                    }
                }
                Ok(resolution)
            }
            Err(e) => {
                let failures = {
                    let mut fails = self.fail_counts.lock().unwrap();
                    let count = fails.entry(itemid).or_insert(0);
                    *count += 1;
                    *count
                };
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    self.fail_counts.lock().unwrap().remove(&itemid);
                    tracing::warn!(
                        itemid,
                        failures,
                        "negative-caching item after consecutive resolve failures"
                    );
                    self.store_negative(itemid, "", "")?;
                }
                Err(e)
            }
        }
    }

    async fn refresh_item(&self, itemid: u64) -> anyhow::Result<Resolution> {
        let Some(zitem) = self.db.fetch_item(itemid).await? else {
            tracing::warn!(itemid, "itemid not present in Zabbix");
            return Ok(Resolution::NotFound);
        };

        if self.ignored_hosts.iter().any(|h| h == &zitem.host)
            || self.ignored_keys.iter().any(|k| k == &zitem.key)
        {
            tracing::debug!(itemid, host = %zitem.host, "item is on an ignore list");
            self.store_negative(itemid, &zitem.host, &zitem.key)?;
            return Ok(Resolution::Unmappable);
        }

        let macros = self.get_or_refresh_macros(&zitem.host).await?;
        let Some(expanded_key) = expand_macros(
            &zitem.key,
            &macros,
            self.config_macros.get(&zitem.host),
            self.config_macros.get(GLOBAL_HOST),
        ) else {
            tracing::warn!(host = %zitem.host, key = %zitem.key, "unresolved macro in item key");
            self.store_negative(itemid, &zitem.host, &zitem.key)?;
            return Ok(Resolution::Unmappable);
        };

        match self.build_mapping(
            itemid,
            &zitem.host,
            &zitem.key,
            zitem.proxy.as_deref(),
            &expanded_key,
        ) {
            Some(mut mapping) => {
                mapping.next_refresh_at = self.store.put_item(&mapping)?;
                stats::inc(&self.counters.items_cache_writes);
                Ok(Resolution::Resolved(mapping))
            }
            None => {
                self.store_negative(itemid, &zitem.host, &zitem.key)?;
                Ok(Resolution::Unmappable)
            }
        }
    }

    /// The pure mapping steps: key parsing, host-pattern tags, the proxy
    /// and host tags, sanitization. `None` means the key is unmappable.
    fn build_mapping(
        &self,
        itemid: u64,
        raw_host: &str,
        raw_key: &str,
        proxy: Option<&str>,
        expanded_key: &str,
    ) -> Option<ItemMapping> {
        let parsed = keymap::parse_item_key(&self.rules, expanded_key)?;

        let mut tags = parsed.tags;
        keymap::apply_host_tags(&self.host_rules, raw_host, &mut tags);
        if let Some(proxy) = proxy {
            if !proxy.is_empty() {
                tags.insert_if_absent("proxy", proxy);
            }
        }
        if !tags.contains_key("host") {
            tags.insert("host", raw_host);
        }

        let metric = self.sanitizer.sanitize_metric(&parsed.metric);
        if metric.is_empty() {
            tracing::warn!(key = expanded_key, "metric sanitized away to nothing");
            return None;
        }
        let mut clean_tags = TagSet::new();
        for (k, v) in tags.iter() {
            let (ck, cv) = self.sanitizer.sanitize_tag_pair(k, v);
            if !ck.is_empty() {
                clean_tags.insert(ck, cv);
            }
        }

        Some(ItemMapping {
            itemid,
            host: raw_host.to_string(),
            key: raw_key.to_string(),
            metric,
            tags: clean_tags,
            next_refresh_at: 0,
        })
    }

    /// Serve macros from the cache, re-querying Zabbix first when the host
    /// has no rows yet or any row has expired.
    pub async fn get_or_refresh_macros(
        &self,
        host: &str,
    ) -> anyhow::Result<HashMap<String, String>> {
        if self.store.macros_need_refresh(host)? {
            // Replace the whole host even on an empty result, so bindings
            // deleted in Zabbix stop being served from the cache.
            let fetched = self.db.fetch_host_macros(host).await?;
            stats::add(&self.counters.macros_written, fetched.len() as u64);
            self.store.put_macros(host, &fetched)?;
            tracing::debug!(host, count = fetched.len(), "refreshed host macros");
        }
        let macros = self.store.get_macros(host)?;
        stats::add(&self.counters.macros_read, macros.len() as u64);
        Ok(macros)
    }

    fn store_negative(&self, itemid: u64, host: &str, key: &str) -> anyhow::Result<()> {
        self.store.put_item(&ItemMapping {
            itemid,
            host: host.to_string(),
            key: key.to_string(),
            metric: String::new(),
            tags: TagSet::new(),
            next_refresh_at: 0,
        })?;
        stats::inc(&self.counters.items_cache_writes);
        Ok(())
    }
}
