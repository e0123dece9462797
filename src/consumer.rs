use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, Value};
use tokio::sync::watch;

use crate::config::BridgeConfig;
use crate::emitter::{self, Emitter};
use crate::models::{MetricValue, StreamEvent};
use crate::resolver::{Resolution, Resolver};
use crate::stats::{self, Counters};
use crate::zabbix_db;

/// Rows older than this are dropped instead of resolved; replaying a
/// backlog after downtime should never flood the downstream with stale
/// samples.
pub const FRESHNESS_WINDOW_S: i64 = 300;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A stale row is skipped, not resolved.
pub fn should_skip(now: i64, clock: i64) -> bool {
    now - clock > FRESHNESS_WINDOW_S
}

#[derive(Debug, Clone)]
struct BinlogPosition {
    file: String,
    pos: u64,
}

#[derive(Debug, thiserror::Error)]
enum StreamError {
    /// Reconnect from the last known position, with backoff.
    #[error("transient stream error: {0}")]
    Transient(#[source] anyhow::Error),
    /// Unrecoverable; the process exits non-zero.
    #[error("fatal stream error: {0}")]
    Fatal(#[source] anyhow::Error),
}

fn transient(e: impl Into<anyhow::Error>) -> StreamError {
    StreamError::Transient(e.into())
}

fn fatal(e: impl Into<anyhow::Error>) -> StreamError {
    StreamError::Fatal(e.into())
}

/// Tails the replication stream and turns every fresh `history` /
/// `history_uint` insert into one output line.
pub struct Consumer {
    opts: Opts,
    slave_id: u32,
    schema: String,
    resolver: Arc<Resolver>,
    emitter: Arc<Emitter>,
    counters: Arc<Counters>,
}

impl Consumer {
    pub fn new(
        config: &BridgeConfig,
        resolver: Arc<Resolver>,
        emitter: Arc<Emitter>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            opts: zabbix_db::build_opts(&config.mysql),
            slave_id: config.slave_id,
            schema: config.mysql.db.clone(),
            resolver,
            emitter,
            counters,
        }
    }

    /// Consume until shutdown. Transient failures reconnect forever with
    /// capped exponential backoff; only a fatal error returns `Err`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut position: Option<BinlogPosition> = None;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self
                .stream_once(&mut position, &mut shutdown, &mut backoff)
                .await
            {
                Ok(()) => {
                    tracing::info!("binlog stream closed, shutting down");
                    return Ok(());
                }
                Err(StreamError::Fatal(e)) => return Err(e),
                Err(StreamError::Transient(e)) => {
                    tracing::warn!(
                        "stream error: {e:#}; reconnecting in {}s",
                        backoff.as_secs()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn stream_once(
        &self,
        position: &mut Option<BinlogPosition>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> Result<(), StreamError> {
        let mut conn = Conn::new(self.opts.clone()).await.map_err(transient)?;

        let start = match position.clone() {
            Some(p) => p,
            None => self.master_position(&mut conn).await?,
        };
        tracing::info!(
            file = %start.file,
            pos = start.pos,
            slave_id = self.slave_id,
            "attaching to binlog stream"
        );
        let mut stream = conn
            .get_binlog_stream(
                BinlogStreamRequest::new(self.slave_id)
                    .with_filename(start.file.as_bytes())
                    .with_pos(start.pos),
            )
            .await
            .map_err(transient)?;
        *position = Some(start);

        loop {
            let next = tokio::select! {
                ev = stream.next() => ev,
                _ = shutdown.wait_for(|stop| *stop) => {
                    let _ = stream.close().await;
                    return Ok(());
                }
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(transient(e)),
                None => return Err(transient(anyhow::anyhow!("binlog stream ended"))),
            };
            *backoff = INITIAL_BACKOFF;

            self.handle_event(&stream, &event, position).await?;

            // Events report the position that follows them; remember it so
            // a reconnect resumes without replaying this event.
            let log_pos = event.header().log_pos();
            if log_pos > 0 {
                if let Some(p) = position.as_mut() {
                    p.pos = u64::from(log_pos);
                }
            }
        }
    }

    /// Current master position, used only on the very first attach. From
    /// then on the stream's own rotate events keep the position current.
    async fn master_position(&self, conn: &mut Conn) -> Result<BinlogPosition, StreamError> {
        let row: Option<mysql_async::Row> = conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(transient)?;
        let row = row.ok_or_else(|| {
            fatal(anyhow::anyhow!(
                "SHOW MASTER STATUS returned no row; is binary logging enabled?"
            ))
        })?;
        let file: String = row
            .get(0)
            .ok_or_else(|| fatal(anyhow::anyhow!("unreadable binlog file name")))?;
        let pos: u64 = row
            .get(1)
            .ok_or_else(|| fatal(anyhow::anyhow!("unreadable binlog position")))?;
        Ok(BinlogPosition { file, pos })
    }

    async fn handle_event(
        &self,
        stream: &BinlogStream,
        event: &Event,
        position: &mut Option<BinlogPosition>,
    ) -> Result<(), StreamError> {
        let Some(data) = event.read_data().map_err(transient)? else {
            return Ok(());
        };
        match data {
            EventData::RotateEvent(rotate) => {
                *position = Some(BinlogPosition {
                    file: rotate.name().into_owned(),
                    pos: rotate.position(),
                });
            }
            EventData::RowsEvent(rows_event) => {
                if !matches!(
                    rows_event,
                    RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_)
                ) {
                    return Ok(());
                }
                let Some(tme) = stream.get_tme(rows_event.table_id()) else {
                    return Ok(());
                };
                if tme.database_name() != self.schema {
                    return Ok(());
                }
                let is_uint = match tme.table_name().as_ref() {
                    "history" => false,
                    "history_uint" => true,
                    _ => return Ok(()),
                };
                for row in rows_event.rows(tme) {
                    let (before, after) = row
                        .map_err(|e| fatal(anyhow::anyhow!("undecodable binlog row: {e}")))?;
                    let Some(row) = after.or(before) else {
                        continue;
                    };
                    self.handle_row(&row, is_uint).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_row(&self, row: &BinlogRow, is_uint: bool) -> Result<(), StreamError> {
        stats::inc(&self.counters.received);
        let event = decode_row(row, is_uint).map_err(fatal)?;
        self.counters.observe_clock(event.clock);

        let now = chrono::Utc::now().timestamp();
        if should_skip(now, event.clock) {
            stats::inc(&self.counters.rows_skipped);
            return Ok(());
        }

        match self.resolver.resolve(event.itemid).await {
            Ok(Resolution::Resolved(mapping)) => {
                if !mapping.tags.contains_key("host") {
                    // resolver output must always carry a host tag
                    tracing::error!(
                        itemid = event.itemid,
                        metric = %mapping.metric,
                        "mapping without host tag, dropping row"
                    );
                    stats::inc(&self.counters.errors);
                    return Ok(());
                }
                let line =
                    emitter::format_line(&mapping.metric, event.clock, event.value, &mapping.tags);
                self.emitter
                    .emit(&line)
                    .map_err(|e| fatal(anyhow::anyhow!("stdout write failed: {e}")))?;
                stats::inc(&self.counters.sent);
            }
            Ok(Resolution::Unmappable) | Ok(Resolution::NotFound) => {
                stats::inc(&self.counters.errors);
            }
            Err(e) => {
                tracing::warn!(itemid = event.itemid, "resolve failed: {e:#}");
                stats::inc(&self.counters.errors);
            }
        }
        Ok(())
    }
}

fn decode_row(row: &BinlogRow, is_uint: bool) -> anyhow::Result<StreamEvent> {
    let itemid = decode_int(row, 0)
        .ok_or_else(|| anyhow::anyhow!("history row without a numeric itemid"))?;
    let clock = decode_int(row, 1)
        .ok_or_else(|| anyhow::anyhow!("history row without a numeric clock"))?
        as i64;
    let value = row
        .as_ref(2)
        .and_then(|v| decode_value(v, is_uint))
        .ok_or_else(|| anyhow::anyhow!("history row without a numeric value"))?;
    let ns = decode_int(row, 3).map(|n| n as i64).unwrap_or(0);
    Ok(StreamEvent {
        itemid,
        clock,
        value,
        ns,
    })
}

fn decode_int(row: &BinlogRow, idx: usize) -> Option<u64> {
    match row.as_ref(idx)? {
        BinlogValue::Value(Value::Int(n)) => Some(*n as u64),
        BinlogValue::Value(Value::UInt(n)) => Some(*n),
        _ => None,
    }
}

fn decode_value(value: &BinlogValue<'_>, is_uint: bool) -> Option<MetricValue> {
    let BinlogValue::Value(value) = value else {
        return None;
    };
    match (value, is_uint) {
        (Value::UInt(n), _) => Some(MetricValue::Uint(*n)),
        (Value::Int(n), true) => Some(MetricValue::Uint(*n as u64)),
        (Value::Int(n), false) => Some(MetricValue::Float(*n as f64)),
        (Value::Double(f), _) => Some(MetricValue::Float(*f)),
        (Value::Float(f), _) => Some(MetricValue::Float(f64::from(*f))),
        _ => None,
    }
}
