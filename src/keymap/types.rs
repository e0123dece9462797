use regex::Regex;

use crate::config::{ItemHostRule, ItemKeyRule};
use crate::models::TagSet;

/// Parameters produced by an argument parser, keyed by (possibly
/// prefixed) name. Insertion order matters: `expand_parameters` turns the
/// map into tags as-is.
pub type ParamMap = TagSet;

/// Result of running an item key through the mapping rules: the metric
/// template fully expanded, plus whatever tags the rule and its argument
/// parser produced. Host tagging and sanitization happen later, in the
/// resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedKey {
    pub metric: String,
    pub tags: TagSet,
}

/// Why a matching rule was abandoned. Soft errors: the next rule in the
/// list is tried.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RuleSkip {
    #[error("unresolved parameter {{@{0}}}")]
    UnresolvedParam(String),
    #[error("cell {0:?} has no key/value separator")]
    MalformedPair(String),
    #[error("jmx argument {0:?} lacks a domain:query first cell")]
    MalformedJmx(String),
}

/// An item-key rule with its regex compiled. Patterns are start-anchored:
/// a rule matches a prefix of the key, like the original mapping tables
/// expect.
#[derive(Debug)]
pub struct CompiledRule {
    pub regex: Regex,
    pub rule: ItemKeyRule,
}

#[derive(Debug)]
pub struct RuleSet {
    pub rules: Vec<CompiledRule>,
}

#[derive(Debug)]
pub struct CompiledHostRule {
    pub regex: Regex,
    pub tags: Vec<(String, String)>,
}

/// Ordered host-pattern rules; only the first match contributes tags.
#[derive(Debug, Default)]
pub struct HostRuleSet {
    pub rules: Vec<CompiledHostRule>,
}

fn anchor(pattern: &str) -> anyhow::Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})"))?)
}

impl RuleSet {
    /// Compile the ordered rule list. The list must end in a catch-all so
    /// that every key maps to something; we probe the last pattern with a
    /// key no real mapping would target.
    pub fn compile(rules: &[ItemKeyRule]) -> anyhow::Result<Self> {
        if rules.is_empty() {
            anyhow::bail!("mappings.item_key is empty; at least a catch-all rule is required");
        }
        let compiled = rules
            .iter()
            .map(|r| {
                Ok(CompiledRule {
                    regex: anchor(&r.regex)
                        .map_err(|e| anyhow::anyhow!("bad item_key regex {:?}: {e}", r.regex))?,
                    rule: r.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let last = compiled.last().expect("non-empty");
        if !last.regex.is_match("zbx.catchall.probe[0]") {
            anyhow::bail!(
                "the last mappings.item_key rule ({:?}) is not a catch-all; \
                 every key must map to a metric",
                last.rule.regex
            );
        }
        Ok(Self { rules: compiled })
    }
}

impl HostRuleSet {
    pub fn compile(rules: &[ItemHostRule]) -> anyhow::Result<Self> {
        let compiled = rules
            .iter()
            .map(|r| {
                Ok(CompiledHostRule {
                    regex: anchor(&r.regex)
                        .map_err(|e| anyhow::anyhow!("bad item_host regex {:?}: {e}", r.regex))?,
                    tags: r.tags.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { rules: compiled })
    }
}
