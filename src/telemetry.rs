use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::emitter::{Emitter, format_line};
use crate::map_store::MapStore;
use crate::models::{MetricValue, TagSet};
use crate::sanitize::Sanitizer;
use crate::stats::{self, Counters};
use crate::zabbix_db::ZabbixDb;

const EMIT_INTERVAL: Duration = Duration::from_secs(15);

/// Lag worth shouting about in the log, on top of the emitted gauge.
const FRESHNESS_ALERT_S: i64 = 300;

/// The bridge reports on itself through the same channel it feeds.
const METRIC_PREFIX: &str = "zabbix.bridge";

/// Spawn the telemetry loop as a background task (fire-and-forget).
/// Every ~15s it emits the counter set, cache statistics and replication
/// lag, and sweeps expired macro hosts while it is at it.
///
/// The only error the loop itself cannot absorb is a dead stdout; that
/// one is handed to `fatal_tx` so main maps it to an exit code the same
/// way it does for the consumer.
pub fn spawn_telemetry(
    store: Arc<MapStore>,
    db: ZabbixDb,
    counters: Arc<Counters>,
    emitter: Arc<Emitter>,
    sanitizer: Arc<Sanitizer>,
    fatal_tx: oneshot::Sender<anyhow::Error>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EMIT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so rates have a window
        interval.tick().await;

        let mut last_received = 0u64;
        loop {
            interval.tick().await;
            if let Err(e) = emit_tick(
                &store,
                &db,
                &counters,
                &emitter,
                &sanitizer,
                &mut last_received,
            )
            .await
            {
                tracing::error!("telemetry write failed: {e:#}");
                let _ = fatal_tx.send(anyhow::anyhow!("stdout write failed: {e}"));
                return;
            }
        }
    });
}

async fn emit_tick(
    store: &MapStore,
    db: &ZabbixDb,
    counters: &Counters,
    emitter: &Emitter,
    sanitizer: &Sanitizer,
    last_received: &mut u64,
) -> std::io::Result<()> {
    let now = chrono::Utc::now().timestamp();
    let tags: TagSet = [("collector".to_string(), "zabbix".to_string())]
        .into_iter()
        .collect();

    let snapshot = counters.snapshot();
    for (name, value) in &snapshot {
        emitter.emit(&counter_line(name, now, MetricValue::Uint(*value), &tags))?;
    }

    let received = snapshot
        .iter()
        .find(|(n, _)| *n == "received")
        .map(|(_, v)| *v)
        .unwrap_or(0);
    let rate = (received.saturating_sub(*last_received)) as f64 / EMIT_INTERVAL.as_secs_f64();
    *last_received = received;
    emitter.emit(&counter_line(
        "items_per_second",
        now,
        MetricValue::Float(rate),
        &tags,
    ))?;

    if let Some(delay) = counters.delay_seconds(now) {
        emitter.emit(&counter_line(
            "delay_seconds",
            now,
            MetricValue::Uint(delay as u64),
            &tags,
        ))?;
        if delay > FRESHNESS_ALERT_S {
            tracing::warn!(delay, "bridge is behind the master database");
        }
    }

    match store.cache_stats() {
        Ok(cache) => {
            emitter.emit(&counter_line(
                "items_cache_total",
                now,
                MetricValue::Uint(cache.total),
                &tags,
            ))?;
            emitter.emit(&counter_line(
                "items_cache_active",
                now,
                MetricValue::Uint(cache.active),
                &tags,
            ))?;
            emitter.emit(&counter_line(
                "items_cache_expired",
                now,
                MetricValue::Uint(cache.expired),
                &tags,
            ))?;
            for (host, count) in &cache.per_host {
                let mut host_tags = tags.clone();
                host_tags.insert("item_host", sanitizer.sanitize_metric(host));
                emitter.emit(&counter_line(
                    "items_cache_per_host",
                    now,
                    MetricValue::Uint(*count),
                    &host_tags,
                ))?;
            }
            tracing::info!(
                total = cache.total,
                active = cache.active,
                expired = cache.expired,
                rate,
                "cache status"
            );
        }
        Err(e) => tracing::warn!("cache stats unavailable: {e:#}"),
    }

    sweep_expired_macros(store, db, counters).await;
    Ok(())
}

fn counter_line(name: &str, now: i64, value: MetricValue, tags: &TagSet) -> String {
    format_line(&format!("{METRIC_PREFIX}.{name}"), now, value, tags)
}

/// Refresh every host that has at least one expired macro row. A whole
/// host refreshes together because new macros may have appeared for it.
async fn sweep_expired_macros(store: &MapStore, db: &ZabbixDb, counters: &Counters) {
    let expired = match store.expired_macro_hosts() {
        Ok(hosts) => hosts,
        Err(e) => {
            tracing::warn!("expired macro scan failed: {e:#}");
            return;
        }
    };
    for (host, expired_rows) in expired {
        stats::add(&counters.macros_expired, expired_rows);
        match db.fetch_host_macros(&host).await {
            Ok(macros) => {
                stats::add(&counters.macros_written, macros.len() as u64);
                if let Err(e) = store.put_macros(&host, &macros) {
                    tracing::warn!(host, "macro upsert failed: {e:#}");
                } else {
                    tracing::debug!(host, count = macros.len(), "swept expired macros");
                }
            }
            Err(e) => tracing::warn!(host, "macro refresh failed: {e:#}"),
        }
    }
}
