//! Argument parsing for the four rule parser kinds.
//!
//! Zabbix key arguments are CSV with a backslash escape, double quotes
//! only significant at the start of a cell, and no quote doubling.

use regex::Captures;

use crate::config::ItemKeyRule;
use crate::models::TagSet;

use super::template::expand;
use super::types::{ParamMap, ParsedKey, RuleSkip};

/// Split an argument string into cells under the Zabbix CSV dialect.
/// An empty string has no cells at all.
pub fn split_args(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = s.chars();
    let mut at_field_start = true;
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                field.push(chars.next().unwrap_or('\\'));
                at_field_start = false;
            }
            '"' if at_field_start => {
                in_quotes = true;
                at_field_start = false;
            }
            '"' if in_quotes => in_quotes = false,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
                at_field_start = true;
            }
            _ => {
                field.push(c);
                at_field_start = false;
            }
        }
    }
    fields.push(field);
    fields
}

fn expand_rule_tags(
    tags: &mut TagSet,
    rule: &ItemKeyRule,
    caps: &Captures<'_>,
    params: &ParamMap,
) -> Result<(), RuleSkip> {
    for (key_tpl, value_tpl) in &rule.tags {
        let k = expand(key_tpl, caps, params)?;
        let v = expand(value_tpl, caps, params)?;
        if !k.is_empty() && !v.is_empty() {
            tags.insert(k, v);
        }
    }
    Ok(())
}

fn finish(
    rule: &ItemKeyRule,
    caps: &Captures<'_>,
    params: &ParamMap,
    mut tags: TagSet,
) -> Result<ParsedKey, RuleSkip> {
    expand_rule_tags(&mut tags, rule, caps, params)?;
    let metric = expand(&rule.metric, caps, params)?;
    Ok(ParsedKey { metric, tags })
}

/// No arguments; metric and tags come from regex groups alone.
pub fn parse_default(caps: &Captures<'_>, rule: &ItemKeyRule) -> Result<ParsedKey, RuleSkip> {
    finish(rule, caps, &ParamMap::new(), TagSet::new())
}

/// Positional arguments. Cells are exposed as `{@<prefix><n>}` (1-based),
/// or under `flags.named_parameters`; cells beyond the name list fall back
/// to their index.
pub fn parse_index(
    arg_str: &str,
    caps: &Captures<'_>,
    rule: &ItemKeyRule,
) -> Result<ParsedKey, RuleSkip> {
    let flags = &rule.flags;
    let mut params = ParamMap::new();
    for (idx, cell) in split_args(arg_str).into_iter().enumerate() {
        let name = match flags.named_parameters.get(idx) {
            Some(n) => format!("{}{}", flags.parameter_prefix, n),
            None => format!("{}{}", flags.parameter_prefix, idx + 1),
        };
        params.insert(name, cell);
    }
    let tags = if flags.expand_parameters {
        params.clone()
    } else {
        TagSet::new()
    };
    finish(rule, caps, &params, tags)
}

/// `key=value` arguments. A parsed `host` tag is renamed `tagged_host` so
/// it cannot shadow the outer host tag.
pub fn parse_named(
    arg_str: &str,
    caps: &Captures<'_>,
    rule: &ItemKeyRule,
) -> Result<ParsedKey, RuleSkip> {
    let flags = &rule.flags;
    let mut params = ParamMap::new();
    for cell in split_args(arg_str) {
        let (k, v) = cell
            .split_once(&flags.key_value_split)
            .ok_or_else(|| RuleSkip::MalformedPair(cell.clone()))?;
        params.insert(format!("{}{}", flags.parameter_prefix, k), v);
    }
    let tags = if flags.expand_parameters {
        params.clone()
    } else {
        TagSet::new()
    };
    let mut parsed = finish(rule, caps, &params, tags)?;
    parsed.tags.rename("host", "tagged_host");
    Ok(parsed)
}

/// JMX arguments: `domain:k1=v1,k2=v2` followed by an attribute cell.
/// Query keys plus `domain` and `attribute` all become parameters; the
/// expanded tag set excludes `domain` and `attribute`.
pub fn parse_jmx(
    arg_str: &str,
    caps: &Captures<'_>,
    rule: &ItemKeyRule,
) -> Result<ParsedKey, RuleSkip> {
    let flags = &rule.flags;
    let cells = split_args(arg_str);
    if cells.len() < 2 {
        return Err(RuleSkip::MalformedJmx(arg_str.to_string()));
    }
    let (domain, query) = cells[0]
        .split_once(':')
        .ok_or_else(|| RuleSkip::MalformedJmx(cells[0].clone()))?;

    let mut params = ParamMap::new();
    for part in query.split(',') {
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| RuleSkip::MalformedPair(part.to_string()))?;
        params.insert(format!("{}{}", flags.parameter_prefix, k), v);
    }
    let domain_key = format!("{}domain", flags.parameter_prefix);
    let attribute_key = format!("{}attribute", flags.parameter_prefix);
    params.insert(domain_key.clone(), domain);
    params.insert(attribute_key.clone(), cells[1].clone());

    let tags = if flags.expand_parameters {
        let mut t = params.clone();
        t.remove(&domain_key);
        t.remove(&attribute_key);
        t
    } else {
        TagSet::new()
    };
    let mut parsed = finish(rule, caps, &params, tags)?;
    parsed.tags.rename("host", "jmx_host");
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArgParserKind, ParserFlags};
    use regex::Regex;

    fn caps<'a>(pattern: &str, haystack: &'a str) -> Captures<'a> {
        Regex::new(pattern).unwrap().captures(haystack).unwrap()
    }

    fn rule(metric: &str, parser: ArgParserKind, flags: ParserFlags) -> ItemKeyRule {
        ItemKeyRule {
            regex: String::new(),
            metric: metric.to_string(),
            tags: Vec::new(),
            arg_parser: parser,
            arg_string: None,
            flags,
        }
    }

    fn tag_vec(parsed: &ParsedKey) -> Vec<(String, String)> {
        parsed
            .tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn split_plain_cells() {
        assert_eq!(split_args("all,avg1"), vec!["all", "avg1"]);
        assert_eq!(split_args("a,,c"), vec!["a", "", "c"]);
        assert_eq!(split_args(""), Vec::<String>::new());
    }

    #[test]
    fn split_backslash_escapes_delimiter() {
        assert_eq!(split_args(r"a\,b,c"), vec!["a,b", "c"]);
        assert_eq!(split_args(r"tail\"), vec![r"tail\"]);
    }

    #[test]
    fn split_quotes_only_open_at_cell_start() {
        assert_eq!(
            split_args(r#""java.lang:type=Memory",HeapMemoryUsage.used""#),
            vec!["java.lang:type=Memory", "HeapMemoryUsage.used\""]
        );
        assert_eq!(split_args(r#""a,b",c"#), vec!["a,b", "c"]);
    }

    #[test]
    fn index_named_parameters_expand_to_tags() {
        let flags = ParserFlags {
            named_parameters: vec!["cpu".into(), "sampleInterval".into()],
            expand_parameters: true,
            ..Default::default()
        };
        let r = rule("system.cpu.load", ArgParserKind::Index, flags);
        let c = caps(r".+", "system.cpu.load[all,avg1]");
        let parsed = parse_index("all,avg1", &c, &r).unwrap();
        assert_eq!(parsed.metric, "system.cpu.load");
        assert_eq!(
            tag_vec(&parsed),
            vec![
                ("cpu".to_string(), "all".to_string()),
                ("sampleInterval".to_string(), "avg1".to_string())
            ]
        );
    }

    #[test]
    fn index_extra_cells_fall_back_to_position() {
        let flags = ParserFlags {
            named_parameters: vec!["port".into()],
            expand_parameters: true,
            ..Default::default()
        };
        let r = rule("net.tcp.listen", ArgParserKind::Index, flags);
        let c = caps(r".+", "net.tcp.listen[80,extra]");
        let parsed = parse_index("80,extra", &c, &r).unwrap();
        assert_eq!(
            tag_vec(&parsed),
            vec![
                ("port".to_string(), "80".to_string()),
                ("2".to_string(), "extra".to_string())
            ]
        );
    }

    #[test]
    fn index_without_arguments_yields_no_params() {
        let flags = ParserFlags {
            named_parameters: vec!["target".into()],
            expand_parameters: true,
            ..Default::default()
        };
        let r = rule("icmp.ping.success", ArgParserKind::Index, flags);
        let c = caps(r".+", "icmpping[]");
        let parsed = parse_index("", &c, &r).unwrap();
        assert_eq!(parsed.metric, "icmp.ping.success");
        assert!(parsed.tags.is_empty());
    }

    #[test]
    fn named_parser_splits_pairs_and_renames_host() {
        let flags = ParserFlags {
            expand_parameters: true,
            ..Default::default()
        };
        let r = rule("{2}", ArgParserKind::Named, flags);
        let c = caps(
            r#"haproxy\.trap\["(.*)::(.*)"\]"#,
            r#"haproxy.trap["instance=hap-ext,host=lb01::haproxy.bck"]"#,
        );
        let parsed = parse_named("instance=hap-ext,host=lb01", &c, &r).unwrap();
        assert_eq!(parsed.metric, "haproxy.bck");
        assert_eq!(
            tag_vec(&parsed),
            vec![
                ("instance".to_string(), "hap-ext".to_string()),
                ("tagged_host".to_string(), "lb01".to_string())
            ]
        );
    }

    #[test]
    fn named_parser_rejects_cell_without_separator() {
        let r = rule("m", ArgParserKind::Named, ParserFlags::default());
        let c = caps(r".+", "x[a]");
        assert_eq!(
            parse_named("noseparator", &c, &r),
            Err(RuleSkip::MalformedPair("noseparator".to_string()))
        );
    }

    #[test]
    fn jmx_parser_builds_params_and_filters_domain_attribute() {
        let flags = ParserFlags {
            expand_parameters: true,
            ..Default::default()
        };
        let r = rule("jmx.{@domain}.{@attribute}", ArgParserKind::Jmx, flags);
        let c = caps(r".+", "jmx[...]");
        let parsed =
            parse_jmx(r#""java.lang:type=Memory",HeapMemoryUsage.used"#, &c, &r).unwrap();
        assert_eq!(parsed.metric, "jmx.java.lang.HeapMemoryUsage.used");
        assert_eq!(
            tag_vec(&parsed),
            vec![("type".to_string(), "Memory".to_string())]
        );
    }

    #[test]
    fn jmx_parser_applies_parameter_prefix() {
        let flags = ParserFlags {
            parameter_prefix: "jmx.".into(),
            expand_parameters: true,
            ..Default::default()
        };
        let r = rule("jmx.{@jmx.domain}.{@jmx.attribute}", ArgParserKind::Jmx, flags);
        let c = caps(r".+", "jmx[...]");
        let parsed = parse_jmx(r#""java.lang:type=Memory,name=G1",Usage"#, &c, &r).unwrap();
        assert_eq!(parsed.metric, "jmx.java.lang.Usage");
        assert_eq!(
            tag_vec(&parsed),
            vec![
                ("jmx.type".to_string(), "Memory".to_string()),
                ("jmx.name".to_string(), "G1".to_string())
            ]
        );
    }

    #[test]
    fn jmx_parser_requires_domain_form() {
        let r = rule("m", ArgParserKind::Jmx, ParserFlags::default());
        let c = caps(r".+", "x");
        assert!(matches!(
            parse_jmx("noquery,attr", &c, &r),
            Err(RuleSkip::MalformedJmx(_))
        ));
        assert!(matches!(
            parse_jmx("onlyonecell", &c, &r),
            Err(RuleSkip::MalformedJmx(_))
        ));
    }
}
