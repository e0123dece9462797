use regex::Captures;

use crate::config::ArgParserKind;
use crate::models::TagSet;

use super::args;
use super::template::expand;
use super::types::{CompiledRule, HostRuleSet, ParamMap, ParsedKey, RuleSet, RuleSkip};

/// Run an item key through the ordered mapping rules. The first regex that
/// matches AND whose rule applies cleanly wins; a rule that fails softly
/// (unresolved parameter, malformed arguments) is skipped and the search
/// continues. Returns `None` only when no rule produced a mapping.
pub fn parse_item_key(rules: &RuleSet, item_key: &str) -> Option<ParsedKey> {
    for compiled in &rules.rules {
        let Some(caps) = compiled.regex.captures(item_key) else {
            continue;
        };
        match apply_rule(compiled, &caps) {
            Ok(parsed) => {
                tracing::debug!(key = item_key, rule = %compiled.rule.regex, metric = %parsed.metric, "item-key matched");
                return Some(parsed);
            }
            Err(skip) => {
                tracing::debug!(key = item_key, rule = %compiled.rule.regex, %skip, "rule skipped");
            }
        }
    }
    tracing::error!(key = item_key, "no item-key mapping matched");
    None
}

fn apply_rule(compiled: &CompiledRule, caps: &Captures<'_>) -> Result<ParsedKey, RuleSkip> {
    let rule = &compiled.rule;
    let arg_string = match &rule.arg_string {
        Some(template) => expand(template, caps, &ParamMap::new())?,
        None => caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string(),
    };
    match rule.arg_parser {
        ArgParserKind::Default => args::parse_default(caps, rule),
        ArgParserKind::Index => args::parse_index(&arg_string, caps, rule),
        ArgParserKind::Named => args::parse_named(&arg_string, caps, rule),
        ArgParserKind::Jmx => args::parse_jmx(&arg_string, caps, rule),
    }
}

/// Apply host-pattern tags. Only the first matching rule contributes; its
/// templates are expanded against the host regex groups. Within one rule
/// the first occurrence of a tag key wins; against the existing tag set
/// the host rule overrides.
pub fn apply_host_tags(rules: &HostRuleSet, raw_host: &str, tags: &mut TagSet) {
    for rule in &rules.rules {
        let Some(caps) = rule.regex.captures(raw_host) else {
            continue;
        };
        let mut local = TagSet::new();
        for (key_tpl, value_tpl) in &rule.tags {
            let empty = ParamMap::new();
            match (expand(key_tpl, &caps, &empty), expand(value_tpl, &caps, &empty)) {
                (Ok(k), Ok(v)) if !k.is_empty() => local.insert_if_absent(k, v),
                _ => {}
            }
        }
        tracing::debug!(host = raw_host, rule = %rule.regex, "item-host matched");
        for (k, v) in local.iter() {
            tags.insert(k, v);
        }
        return;
    }
}
