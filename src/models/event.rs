use std::fmt;

/// A numeric sample value. `history` rows carry doubles, `history_uint`
/// rows carry unsigned 64-bit integers; keeping them apart preserves the
/// integer text form on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Float(f64),
    Uint(u64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Uint(v) => write!(f, "{v}"),
        }
    }
}

/// One inserted history row pulled off the replication stream. Transient;
/// never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub itemid: u64,
    /// Sample time, unix seconds.
    pub clock: i64,
    pub value: MetricValue,
    /// Sub-second part of the sample time.
    pub ns: i64,
}
