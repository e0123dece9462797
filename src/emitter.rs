use std::io::{self, Write};
use std::sync::Mutex;

use crate::models::{MetricValue, TagSet};

/// Build one OpenTSDB `put`-form text line: `metric ts value [k=v ...]`.
/// Tags with empty values are omitted. The caller is responsible for
/// sanitizing metric and tags beforehand.
pub fn format_line(metric: &str, timestamp: i64, value: MetricValue, tags: &TagSet) -> String {
    let mut line = format!("{metric} {timestamp} {value}");
    for (k, v) in tags.iter() {
        if k.is_empty() || v.is_empty() {
            continue;
        }
        line.push(' ');
        line.push_str(k);
        line.push('=');
        line.push_str(v);
    }
    line.push('\n');
    line
}

/// Line-oriented writer for the downstream collector pipe.
///
/// Both the consumer loop and the telemetry loop write here; the mutex
/// makes each line atomic. Lines are fully assembled before the lock is
/// taken, so no suspension point ever holds the writer.
pub struct Emitter {
    out: Mutex<io::Stdout>,
}

impl Emitter {
    pub fn stdout() -> Self {
        Self {
            out: Mutex::new(io::stdout()),
        }
    }

    /// Write one pre-assembled line. A failure here means the downstream
    /// pipe is gone; the caller treats it as fatal.
    pub fn emit(&self, line: &str) -> io::Result<()> {
        let mut out = self.out.lock().unwrap();
        out.write_all(line.as_bytes())?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn formats_value_and_tags_in_order() {
        let line = format_line(
            "system.cpu.load",
            1_599_999_990,
            MetricValue::Float(0.5),
            &tags(&[("cpu", "all"), ("sampleInterval", "avg1"), ("host", "web01.dc1.prod")]),
        );
        assert_eq!(
            line,
            "system.cpu.load 1599999990 0.5 cpu=all sampleInterval=avg1 host=web01.dc1.prod\n"
        );
    }

    #[test]
    fn empty_tag_values_are_omitted() {
        let line = format_line(
            "net.interface.in",
            1_599_999_990,
            MetricValue::Uint(17),
            &tags(&[("mode", ""), ("interface", "eth0")]),
        );
        assert_eq!(line, "net.interface.in 1599999990 17 interface=eth0\n");
    }

    #[test]
    fn untagged_line_has_no_trailing_space() {
        let line = format_line("weird_thing", 1, MetricValue::Uint(3), &TagSet::new());
        assert_eq!(line, "weird_thing 1 3\n");
    }

    #[test]
    fn lines_match_the_put_grammar() {
        let grammar = Regex::new(r"^[A-Za-z0-9._/-]+ \d+ -?[0-9]+(\.[0-9]+)?( \S+=\S+)*\n$")
            .unwrap();
        let cases = [
            format_line("m.a", 10, MetricValue::Float(-1.25), &tags(&[("k", "v")])),
            format_line("m", 10, MetricValue::Uint(0), &TagSet::new()),
            format_line(
                "jmx.java.lang.HeapMemoryUsage.used",
                1_599_999_990,
                MetricValue::Uint(123456),
                &tags(&[("type", "Memory"), ("host", "web01.dc1.prod")]),
            ),
        ];
        for line in cases {
            assert!(grammar.is_match(&line), "line failed grammar: {line:?}");
        }
    }
}
