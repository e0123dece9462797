use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Top-level config loaded from `zabbix_bridge.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub mysql: MysqlConfig,
    #[serde(default = "default_slave_id")]
    pub slave_id: u32,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Log sink. Stdout carries the metric stream, so logs go to a file
    /// (or stderr when unset).
    #[serde(default)]
    pub logfile: Option<String>,
    /// Character class stripped from metrics and tags in the final
    /// sanitizer pass.
    #[serde(default = "default_disallow")]
    pub disallow: String,
    /// How often (seconds) to reload an item mapping from Zabbix (many and slow).
    #[serde(default = "default_item_refresh")]
    pub item_refresh_interval_s: i64,
    /// How often (seconds) to reload host macros from Zabbix (fast and few).
    #[serde(default = "default_macro_refresh")]
    pub macro_refresh_interval_s: i64,
    /// Path of the embedded mapping cache database.
    #[serde(default = "default_map_db_path")]
    pub map_db_path: String,
    #[serde(default)]
    pub ignored_keys: Vec<String>,
    #[serde(default)]
    pub ignored_hosts: Vec<String>,
    #[serde(default)]
    pub mappings: Mappings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    pub passwd: String,
    #[serde(default = "default_mysql_db")]
    pub db: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Mappings {
    /// Fallback macros applied after the Zabbix-side macros, keyed by host.
    /// The sentinel host `__global__` applies to every host.
    #[serde(default)]
    pub macros: HashMap<String, HashMap<String, String>>,
    /// Ordered item-key rules; the first matching regex wins.
    #[serde(default)]
    pub item_key: Vec<ItemKeyRule>,
    /// Ordered host-pattern rules; the first matching regex contributes tags.
    #[serde(default)]
    pub item_host: Vec<ItemHostRule>,
}

/// One `(regex, rule)` entry of the item-key mapping list.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemKeyRule {
    pub regex: String,
    /// Metric template; `{N}` expands regex groups, `{@name}` expands
    /// argument-parser parameters.
    pub metric: String,
    /// Tag templates as ordered `[key, value]` pairs; same substitution
    /// rules on both sides.
    #[serde(default)]
    pub tags: Vec<(String, String)>,
    #[serde(default)]
    pub arg_parser: ArgParserKind,
    /// Template for the substring handed to the argument parser; defaults
    /// to the whole regex match.
    #[serde(default)]
    pub arg_string: Option<String>,
    #[serde(default)]
    pub flags: ParserFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArgParserKind {
    #[default]
    Default,
    Index,
    Named,
    Jmx,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserFlags {
    /// Prefix prepended to every parameter name the parser produces.
    #[serde(default)]
    pub parameter_prefix: String,
    /// Names assigned to positional parameters by the `index` parser.
    #[serde(default)]
    pub named_parameters: Vec<String>,
    /// Turn every parsed parameter into a tag.
    #[serde(default)]
    pub expand_parameters: bool,
    /// Separator used by the `named` parser to split cells into key/value.
    #[serde(default = "default_kv_split")]
    pub key_value_split: String,
}

impl Default for ParserFlags {
    fn default() -> Self {
        Self {
            parameter_prefix: String::new(),
            named_parameters: Vec::new(),
            expand_parameters: false,
            key_value_split: default_kv_split(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemHostRule {
    pub regex: String,
    /// Tag templates as ordered `[key, value]` pairs; `{N}` expands groups
    /// of the host regex.
    pub tags: Vec<(String, String)>,
}

fn default_slave_id() -> u32 {
    21
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_disallow() -> String {
    r"[^a-zA-Z0-9\-_\./]".to_string()
}

fn default_item_refresh() -> i64 {
    86_400
}

fn default_macro_refresh() -> i64 {
    7_200
}

fn default_map_db_path() -> String {
    "/tmp/zabbix_map.sqlite".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_mysql_db() -> String {
    "zabbix".to_string()
}

fn default_kv_split() -> String {
    "=".to_string()
}

impl BridgeConfig {
    /// Load config from a TOML file. Unlike a server with sane built-in
    /// defaults, the bridge cannot run without replication credentials, so
    /// a missing file is a startup error.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config: BridgeConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        slave_id = 42
        ignored_hosts = ["Website", "localhost"]

        [mysql]
        host = "db.example.net"
        user = "zabbix_repl"
        passwd = "secret"

        [mappings.macros."hostfoo.domain"]
        "{$APP1_CONTEXT}" = "app1"

        [[mappings.item_key]]
        regex = 'system\.cpu\.load\[([^\]]*)\]'
        metric = "system.cpu.load"
        arg_parser = "index"
        flags = { named_parameters = ["cpu", "sampleInterval"], expand_parameters = true }

        [[mappings.item_key]]
        regex = ".+"
        metric = "{0}"

        [[mappings.item_host]]
        regex = '(\w+)\.([\w-]+)\.(\w+)'
        tags = [["environment", "{2}.{3}"], ["class", "{3}"]]
    "#;

    #[test]
    fn parses_sample_config() {
        let cfg: BridgeConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.mysql.host, "db.example.net");
        assert_eq!(cfg.mysql.port, 3306);
        assert_eq!(cfg.mysql.db, "zabbix");
        assert_eq!(cfg.slave_id, 42);
        assert_eq!(cfg.item_refresh_interval_s, 86_400);
        assert_eq!(cfg.macro_refresh_interval_s, 7_200);
        assert_eq!(cfg.ignored_hosts, vec!["Website", "localhost"]);
        assert_eq!(cfg.mappings.item_key.len(), 2);

        let cpu = &cfg.mappings.item_key[0];
        assert_eq!(cpu.arg_parser, ArgParserKind::Index);
        assert!(cpu.flags.expand_parameters);
        assert_eq!(cpu.flags.named_parameters, vec!["cpu", "sampleInterval"]);
        assert_eq!(cpu.flags.key_value_split, "=");

        let host_rule = &cfg.mappings.item_host[0];
        assert_eq!(host_rule.tags[0].0, "environment");

        let macros = &cfg.mappings.macros["hostfoo.domain"];
        assert_eq!(macros["{$APP1_CONTEXT}"], "app1");
    }

    #[test]
    fn rule_order_is_preserved() {
        let cfg: BridgeConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.mappings.item_key[0].metric, "system.cpu.load");
        assert_eq!(cfg.mappings.item_key[1].metric, "{0}");
    }
}
