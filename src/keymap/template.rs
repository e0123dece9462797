//! The small templating layer used by metric and tag templates.
//!
//! Two token forms are substituted:
//!   `{N}`      - capture group N of the rule regex ({0} is the whole match;
//!                a group that did not participate expands to "")
//!   `{@name}`  - a parameter produced by the rule's argument parser
//!
//! Anything else, including unrecognized brace forms, passes through as
//! literal text. An unresolved `{@name}` aborts the rule (soft error).

use regex::Captures;

use super::types::{ParamMap, RuleSkip};

/// Expand `{N}` and `{@name}` tokens in one left-to-right pass.
pub fn expand(
    template: &str,
    caps: &Captures<'_>,
    params: &ParamMap,
) -> Result<String, RuleSkip> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match token_end(tail) {
            Some(end) => {
                let token = &tail[1..end]; // without braces
                match resolve(token, caps, params)? {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&tail[..=end]), // literal
                }
                rest = &tail[end + 1..];
            }
            None => {
                // unterminated brace, keep verbatim
                out.push_str(tail);
                return Ok(out);
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn token_end(s: &str) -> Option<usize> {
    s.find('}')
}

fn resolve<'a>(
    token: &str,
    caps: &'a Captures<'_>,
    params: &'a ParamMap,
) -> Result<Option<&'a str>, RuleSkip> {
    if let Some(name) = token.strip_prefix('@') {
        if !name.is_empty() && name.chars().all(is_param_char) {
            return match params.get(name) {
                Some(v) => Ok(Some(v)),
                None => Err(RuleSkip::UnresolvedParam(name.to_string())),
            };
        }
        return Ok(None);
    }
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        let n: usize = token.parse().unwrap_or(usize::MAX);
        return Ok(Some(caps.get(n).map(|m| m.as_str()).unwrap_or("")));
    }
    Ok(None)
}

fn is_param_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn caps<'a>(pattern: &str, haystack: &'a str) -> Captures<'a> {
        Regex::new(pattern).unwrap().captures(haystack).unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> ParamMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_groups_by_number() {
        let c = caps(r"net\.if(\.[^\[]*)\[([^,]+),?([^,]*)\]", "net.if.in[eth0]");
        let out = expand("net.interface{1}.{3}", &c, &ParamMap::new()).unwrap();
        assert_eq!(out, "net.interface.in.");
        let out = expand("{2}", &c, &ParamMap::new()).unwrap();
        assert_eq!(out, "eth0");
    }

    #[test]
    fn group_zero_is_the_whole_match() {
        let c = caps(r".+", "weird_thing");
        assert_eq!(expand("{0}", &c, &ParamMap::new()).unwrap(), "weird_thing");
    }

    #[test]
    fn nonparticipating_group_expands_empty() {
        let c = caps(r"a(x)?(b)", "ab");
        assert_eq!(expand("[{1}][{2}]", &c, &ParamMap::new()).unwrap(), "[][b]");
    }

    #[test]
    fn expands_parameters_by_name() {
        let c = caps(r".+", "jmx[...]");
        let p = params(&[("jmx.domain", "java.lang"), ("jmx.attribute", "Heap")]);
        let out = expand("jmx.{@jmx.domain}.{@jmx.attribute}", &c, &p).unwrap();
        assert_eq!(out, "jmx.java.lang.Heap");
    }

    #[test]
    fn unresolved_parameter_is_a_soft_error() {
        let c = caps(r".+", "x");
        let err = expand("vfs.fs.{@attribute}", &c, &ParamMap::new()).unwrap_err();
        assert_eq!(err, RuleSkip::UnresolvedParam("attribute".to_string()));
    }

    #[test]
    fn unknown_brace_forms_stay_literal() {
        let c = caps(r".+", "x");
        let p = ParamMap::new();
        assert_eq!(expand("a{foo}b", &c, &p).unwrap(), "a{foo}b");
        assert_eq!(expand("a{", &c, &p).unwrap(), "a{");
        assert_eq!(expand("{$MACRO}", &c, &p).unwrap(), "{$MACRO}");
    }
}
