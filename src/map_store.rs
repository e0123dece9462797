use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::models::{CacheStats, ItemMapping, TagSet};

/// Hosts without their own macro rows share this bucket.
pub const GLOBAL_HOST: &str = "__global__";

/// Persistent cache of item and macro mappings, backed by an embedded
/// SQLite database. All access is serialized through one connection
/// mutex; every logical update commits as a single transaction.
pub struct MapStore {
    conn: Mutex<Connection>,
    item_ttl: i64,
    macro_ttl: i64,
}

impl MapStore {
    pub fn open(path: &str, item_ttl: i64, macro_ttl: i64) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
            item_ttl,
            macro_ttl,
        };
        store.run_migrations()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory(item_ttl: i64, macro_ttl: i64) -> anyhow::Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            item_ttl,
            macro_ttl,
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS items (
                itemid          INTEGER PRIMARY KEY,
                host            TEXT NOT NULL,
                key             TEXT NOT NULL,
                metric          TEXT NOT NULL,
                next_refresh_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tags (
                itemid    INTEGER NOT NULL,
                tag_key   TEXT NOT NULL,
                tag_value TEXT NOT NULL,
                pos       INTEGER NOT NULL,
                UNIQUE(itemid, tag_key, tag_value)
            );
            CREATE INDEX IF NOT EXISTS idx_tags_itemid ON tags(itemid);

            CREATE TABLE IF NOT EXISTS macros (
                host            TEXT NOT NULL,
                macro           TEXT NOT NULL,
                value           TEXT NOT NULL,
                next_refresh_at INTEGER NOT NULL,
                PRIMARY KEY(host, macro, value)
            );
            ",
        )?;
        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Expiry for a fresh row: `now + ttl` plus up to 10% extra so a cold
    /// start does not schedule every row to refresh in the same second.
    fn jittered_expiry(now: i64, ttl: i64) -> i64 {
        let spread = ttl / 10;
        let jitter = if spread > 0 {
            rand::rng().random_range(0..=spread)
        } else {
            0
        };
        now + ttl + jitter
    }

    // ── Item operations ──

    pub fn get_item(&self, itemid: u64) -> anyhow::Result<Option<ItemMapping>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT itemid, host, key, metric, next_refresh_at FROM items WHERE itemid = ?1",
        )?;
        let mut rows = stmt.query_map(params![itemid], |row| {
            Ok(ItemMapping {
                itemid: row.get(0)?,
                host: row.get(1)?,
                key: row.get(2)?,
                metric: row.get(3)?,
                tags: TagSet::new(),
                next_refresh_at: row.get(4)?,
            })
        })?;
        let Some(mut item) = rows.next().transpose()? else {
            return Ok(None);
        };
        drop(rows);
        drop(stmt);

        let mut stmt = conn
            .prepare("SELECT tag_key, tag_value FROM tags WHERE itemid = ?1 ORDER BY pos ASC")?;
        let tags = stmt
            .query_map(params![itemid], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        item.tags = tags.into_iter().collect();
        Ok(Some(item))
    }

    /// Upsert an item and replace its tag rows in one transaction. The
    /// stored expiry is freshly computed; the one on `item` is ignored.
    /// Returns the expiry that was written.
    pub fn put_item(&self, item: &ItemMapping) -> anyhow::Result<i64> {
        let next_refresh_at = Self::jittered_expiry(Self::now(), self.item_ttl);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO items (itemid, host, key, metric, next_refresh_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![item.itemid, item.host, item.key, item.metric, next_refresh_at],
        )?;
        tx.execute("DELETE FROM tags WHERE itemid = ?1", params![item.itemid])?;
        for (pos, (k, v)) in item.tags.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO tags (itemid, tag_key, tag_value, pos) VALUES (?1, ?2, ?3, ?4)",
                params![item.itemid, k, v, pos as i64],
            )?;
        }
        tx.commit()?;
        Ok(next_refresh_at)
    }

    // ── Macro operations ──

    /// All macros that apply to `host`: its own rows merged over the
    /// `__global__` rows.
    pub fn get_macros(&self, host: &str) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host, macro, value FROM macros WHERE host = ?1 OR host = ?2",
        )?;
        let rows = stmt
            .query_map(params![host, GLOBAL_HOST], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut macros = HashMap::new();
        // global first, so host-specific bindings win
        for (row_host, macro_name, value) in &rows {
            if row_host == GLOBAL_HOST {
                macros.insert(macro_name.clone(), value.clone());
            }
        }
        for (row_host, macro_name, value) in rows {
            if row_host != GLOBAL_HOST {
                macros.insert(macro_name, value);
            }
        }
        Ok(macros)
    }

    /// Replace a host's macro rows with a fresh set, one transaction.
    pub fn put_macros(&self, host: &str, macros: &HashMap<String, String>) -> anyhow::Result<()> {
        let host = if host.is_empty() { GLOBAL_HOST } else { host };
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM macros WHERE host = ?1", params![host])?;
        for (macro_name, value) in macros {
            let next_refresh_at = Self::jittered_expiry(Self::now(), self.macro_ttl);
            tx.execute(
                "INSERT OR REPLACE INTO macros (host, macro, value, next_refresh_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![host, macro_name, value, next_refresh_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Does `host` need a macro refresh? True when it has no rows at all
    /// or any row has expired. A host may gain new macros in Zabbix at any
    /// time, so the whole host refreshes together.
    pub fn macros_need_refresh(&self, host: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let (total, expired): (i64, i64) = conn.query_row(
            "SELECT count(*), \
             coalesce(sum(case when next_refresh_at <= ?2 then 1 else 0 end), 0) \
             FROM macros WHERE host = ?1",
            params![host, Self::now()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(total == 0 || expired > 0)
    }

    /// Hosts with at least one expired macro row, with the expired row
    /// count per host.
    pub fn expired_macro_hosts(&self) -> anyhow::Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host, count(*) FROM macros WHERE next_refresh_at <= ?1 GROUP BY host",
        )?;
        let rows = stmt
            .query_map(params![Self::now()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Telemetry ──

    pub fn cache_stats(&self) -> anyhow::Result<CacheStats> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        let (expired, active, total): (u64, u64, u64) = conn.query_row(
            "SELECT coalesce(sum(case when next_refresh_at <= ?1 then 1 else 0 end), 0), \
             coalesce(sum(case when next_refresh_at > ?1 then 1 else 0 end), 0), \
             count(*) FROM items",
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let mut stmt = conn.prepare("SELECT host, count(*) FROM items GROUP BY host")?;
        let per_host = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CacheStats {
            total,
            active,
            expired,
            per_host,
        })
    }
}
