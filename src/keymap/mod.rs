//! Rule-driven translation of Zabbix item keys into metric names and tags.
//!
//! A key looks like `name` or `name[arg1,arg2,...]`. An ordered list of
//! `(regex, rule)` pairs from configuration is tried top to bottom; the
//! winning rule expands a metric template from regex groups and, through
//! one of four argument parsers, from the parsed key arguments.

pub mod args;
pub mod parse;
pub mod template;
pub mod types;

pub use parse::{apply_host_tags, parse_item_key};
pub use types::{HostRuleSet, ParamMap, ParsedKey, RuleSet, RuleSkip};
