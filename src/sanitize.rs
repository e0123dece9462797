use regex::Regex;

/// Text normalization for metric names and tag pairs.
///
/// Zabbix item keys and host names are free-form; OpenTSDB only accepts
/// `[A-Za-z0-9._/-]`. The passes below run left-to-right, once each, and the
/// final disallow scrub guarantees the result is stable under re-application.
#[derive(Debug)]
pub struct Sanitizer {
    quotes: Regex,
    ws_upper: Regex,
    ws_lower: Regex,
    ws_digit: Regex,
    disallow: Regex,
}

impl Sanitizer {
    /// `disallow` is the character class to strip in the final pass,
    /// e.g. `[^a-zA-Z0-9\-_\./]`.
    pub fn new(disallow: &str) -> anyhow::Result<Self> {
        Ok(Self {
            quotes: Regex::new(r#"^"(.*)"$"#)?,
            ws_upper: Regex::new(r"\s([A-Z])")?,
            ws_lower: Regex::new(r"\s([a-z])")?,
            ws_digit: Regex::new(r"\s([0-9])")?,
            disallow: Regex::new(disallow)?,
        })
    }

    /// Shared passes: quote strip, whitespace folding, disallow scrub.
    fn scrub(&self, s: &str, lower_first: bool) -> String {
        let s = self.quotes.replace(s, "$1");
        let s = self.ws_upper.replace_all(&s, "$1");
        let s = self.ws_lower.replace_all(&s, "_$1");
        let s = self.ws_digit.replace_all(&s, ".$1");
        let s = if lower_first {
            lowercase_first(&s)
        } else {
            s.into_owned()
        };
        self.disallow.replace_all(&s, "").into_owned()
    }

    pub fn sanitize_metric(&self, metric: &str) -> String {
        // A template group that expands to nothing can leave a dangling
        // separator (`net.interface{1}.{3}` -> `net.interface.in.`).
        self.scrub(metric, true).trim_matches('.').to_string()
    }

    /// Tag keys get the full treatment including first-letter lowering;
    /// tag values keep their case.
    pub fn sanitize_tag_pair(&self, key: &str, value: &str) -> (String, String) {
        (self.scrub(key, true), self.scrub(value, false))
    }
}

fn lowercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {
            let mut out = String::with_capacity(s.len());
            out.push(c.to_ascii_lowercase());
            out.push_str(chars.as_str());
            out
        }
        _ => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_DISALLOW: &str = r"[^a-zA-Z0-9\-_\./]";

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(DEFAULT_DISALLOW).unwrap()
    }

    #[test]
    fn whitespace_folding() {
        let s = sanitizer();
        assert_eq!(s.sanitize_metric("Camel Case"), "camelCase");
        assert_eq!(s.sanitize_metric("camel case"), "camel_case");
        assert_eq!(s.sanitize_metric("item 1"), "item.1");
    }

    #[test]
    fn quote_stripping() {
        let s = sanitizer();
        assert_eq!(s.sanitize_metric("\"quoted.metric\""), "quoted.metric");
        // A stray quote is not a pair; the disallow pass removes it.
        assert_eq!(s.sanitize_metric("HeapMemoryUsage.used\""), "heapMemoryUsage.used");
    }

    #[test]
    fn metric_boundary_dots_are_trimmed() {
        let s = sanitizer();
        assert_eq!(s.sanitize_metric("net.interface.in."), "net.interface.in");
        // Tag values keep their dots verbatim.
        let (_, v) = s.sanitize_tag_pair("k", "v.");
        assert_eq!(v, "v.");
    }

    #[test]
    fn tag_values_keep_case() {
        let s = sanitizer();
        let (k, v) = s.sanitize_tag_pair("Tag Key", "Tag Value");
        assert_eq!(k, "tagKey");
        assert_eq!(v, "TagValue");
    }

    #[test]
    fn idempotent_over_corpus() {
        let s = sanitizer();
        let corpus = [
            "system.cpu.load",
            "Camel Case Metric",
            "\"quoted thing\"",
            "item 1 of 2",
            "weird!@#$chars%^&*()here",
            "a  B",
            "trailing space ",
            " leading",
            "jmx.java.lang:type=Memory",
            "",
            "\"\"double\"\"",
        ];
        for input in corpus {
            let once = s.sanitize_metric(input);
            assert_eq!(s.sanitize_metric(&once), once, "not idempotent for {input:?}");
            let (k1, v1) = s.sanitize_tag_pair(input, input);
            let (k2, v2) = s.sanitize_tag_pair(&k1, &v1);
            assert_eq!((k1.clone(), v1.clone()), (k2, v2), "tag pair not idempotent for {input:?}");
        }
    }

    #[test]
    fn output_charset_is_safe() {
        let s = sanitizer();
        let safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-');
        for input in ["a b!c\"d", "ünïcode stuff", "tab\there", "{$MACRO}[x,y]"] {
            assert!(s.sanitize_metric(input).chars().all(safe), "bad chars for {input:?}");
        }
    }
}
