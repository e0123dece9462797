use std::collections::HashMap;
use std::time::Duration;

use mysql_async::prelude::Queryable;
use mysql_async::{params, Opts, OptsBuilder, Pool};

use crate::config::MysqlConfig;
use crate::map_store::GLOBAL_HOST;

/// One row of the Zabbix `items`/`hosts` join.
#[derive(Debug, Clone, PartialEq)]
pub struct ZabbixItem {
    pub itemid: u64,
    pub host: String,
    pub key: String,
    /// Host name of the proxy this item reports through, when any.
    pub proxy: Option<String>,
}

/// Queries against the Zabbix schema, bounded by a deadline so that a
/// stuck database cannot stall the consumer loop indefinitely.
#[derive(Clone)]
pub struct ZabbixDb {
    pool: Pool,
    deadline: Duration,
}

pub const QUERY_DEADLINE: Duration = Duration::from_secs(10);

pub fn build_opts(cfg: &MysqlConfig) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(cfg.host.clone())
        .tcp_port(cfg.port)
        .user(Some(cfg.user.clone()))
        .pass(Some(cfg.passwd.clone()))
        .db_name(Some(cfg.db.clone()))
        .into()
}

impl ZabbixDb {
    pub fn connect(cfg: &MysqlConfig) -> Self {
        Self {
            pool: Pool::new(build_opts(cfg)),
            deadline: QUERY_DEADLINE,
        }
    }

    async fn with_deadline<T, F>(&self, what: &str, fut: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = Result<T, mysql_async::Error>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(res) => res.map_err(|e| anyhow::anyhow!("{what} failed: {e}")),
            Err(_) => anyhow::bail!("{what} exceeded the {}s deadline", self.deadline.as_secs()),
        }
    }

    /// Startup probe: the most recently created itemid. Verifies both
    /// connectivity and SELECT privileges before the stream attaches.
    pub async fn probe_last_itemid(&self) -> anyhow::Result<Option<u64>> {
        self.with_deadline("itemid probe", async {
            let mut conn = self.pool.get_conn().await?;
            conn.query_first("SELECT itemid FROM items ORDER BY itemid DESC LIMIT 1")
                .await
        })
        .await
    }

    /// Item details for one itemid. Hosts in status 3 (templates) are
    /// excluded; returns `None` when Zabbix does not know the item.
    pub async fn fetch_item(&self, itemid: u64) -> anyhow::Result<Option<ZabbixItem>> {
        let row: Option<(u64, String, String, Option<String>)> = self
            .with_deadline("item fetch", async {
                let mut conn = self.pool.get_conn().await?;
                conn.exec_first(
                    "SELECT i.itemid, h.host, i.key_, h2.host AS proxy \
                     FROM items i \
                     JOIN hosts h ON i.hostid = h.hostid \
                     LEFT JOIN hosts h2 ON h2.hostid = h.proxy_hostid \
                     WHERE h.status <> 3 AND i.itemid = :itemid",
                    params! { "itemid" => itemid },
                )
                .await
            })
            .await?;
        Ok(row.map(|(itemid, host, key, proxy)| ZabbixItem {
            itemid,
            host,
            key,
            proxy,
        }))
    }

    /// Macros for one host, walking the template chain the same way the
    /// Zabbix frontend does. The `__global__` sentinel selects macro rows
    /// not bound to any template host.
    pub async fn fetch_host_macros(&self, host: &str) -> anyhow::Result<HashMap<String, String>> {
        const BASE: &str = "SELECT tt.host, m.macro, m.value \
             FROM hostmacro m \
             JOIN hosts h ON m.hostid = h.hostid \
             LEFT JOIN hosts_templates ht ON ht.templateid = h.hostid \
             LEFT JOIN hosts tt ON tt.hostid = ht.hostid";
        let rows: Vec<(Option<String>, String, String)> = self
            .with_deadline("macro fetch", async {
                let mut conn = self.pool.get_conn().await?;
                if host == GLOBAL_HOST {
                    conn.query(format!("{BASE} WHERE tt.host IS NULL")).await
                } else {
                    conn.exec(
                        format!("{BASE} WHERE tt.host = :host"),
                        params! { "host" => host },
                    )
                    .await
                }
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(_, macro_name, value)| (macro_name, value))
            .collect())
    }

    pub async fn disconnect(self) -> anyhow::Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }
}
