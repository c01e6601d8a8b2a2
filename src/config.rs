// ABOUTME: Routing configuration loaded from routing.toml
// ABOUTME: Declares identity, channels, group links, routers, triggers and engine tuning

use anyhow::{bail, Context, Result};
use change_log::EventType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Router id recorded on events routed for tables that have no trigger-router.
pub const DEFAULT_ROUTER_ID: &str = "default";

/// The node this engine routes on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub node_id: String,
    pub node_group_id: String,
}

/// How a channel decides where one outgoing batch ends and the next begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAlgorithm {
    /// Close once a threshold is reached, but only at a transaction boundary.
    #[default]
    Default,
    /// Close every open batch at every transaction boundary.
    Transactional,
    /// Close as soon as a threshold is reached, even mid-transaction.
    NonTransactional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: String,
    #[serde(default)]
    pub batch_algorithm: BatchAlgorithm,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChannelConfig {
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            batch_algorithm: BatchAlgorithm::Default,
            max_batch_size: default_max_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            enabled: true,
        }
    }

    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }
}

/// Direction of data flow between two node groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupLink {
    pub source_node_group_id: String,
    pub target_node_group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub router_id: String,
    #[serde(default = "default_router_type")]
    pub router_type: String,
    #[serde(default)]
    pub expression: Option<String>,
    pub source_node_group_id: String,
    pub target_node_group_id: String,
    #[serde(default = "default_true")]
    pub sync_on_insert: bool,
    #[serde(default = "default_true")]
    pub sync_on_update: bool,
    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
}

impl RouterConfig {
    pub fn new(router_id: &str, router_type: &str, source_group: &str, target_group: &str) -> Self {
        Self {
            router_id: router_id.to_string(),
            router_type: router_type.to_string(),
            expression: None,
            source_node_group_id: source_group.to_string(),
            target_node_group_id: target_group.to_string(),
            sync_on_insert: true,
            sync_on_update: true,
            sync_on_delete: true,
        }
    }

    pub fn with_expression(mut self, expression: &str) -> Self {
        self.expression = Some(expression.to_string());
        self
    }

    /// Whether this router wants rows of the given event type at all.
    pub fn routes_event(&self, event_type: EventType) -> bool {
        match event_type {
            EventType::Insert => self.sync_on_insert,
            EventType::Update => self.sync_on_update,
            EventType::Delete => self.sync_on_delete,
            _ => true,
        }
    }

    pub fn expression(&self) -> &str {
        self.expression.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub trigger_id: String,
    pub source_table_name: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRouterConfig {
    pub trigger_id: String,
    pub router_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Gaps named in one reader query before the last range is widened.
    #[serde(default = "default_max_gaps_in_query")]
    pub max_gaps_in_query: usize,
    /// Width of the open gap kept ahead of the newest routed change.
    #[serde(default = "default_max_gap_size")]
    pub max_gap_size: i64,
    #[serde(default = "default_max_rows_per_pass")]
    pub max_rows_per_pass: usize,
    #[serde(default = "default_stale_gap_timeout_secs")]
    pub stale_gap_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_gaps_in_query: default_max_gaps_in_query(),
            max_gap_size: default_max_gap_size(),
            max_rows_per_pass: default_max_rows_per_pass(),
            stale_gap_timeout_secs: default_stale_gap_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl RouterSettings {
    pub fn stale_gap_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_gap_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Full routing configuration, usually read from `routing.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub identity: Identity,
    #[serde(default)]
    pub settings: RouterSettings,
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default, rename = "group_link")]
    pub group_links: Vec<NodeGroupLink>,
    #[serde(default, rename = "router")]
    pub routers: Vec<RouterConfig>,
    #[serde(default, rename = "trigger")]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default, rename = "trigger_router")]
    pub trigger_routers: Vec<TriggerRouterConfig>,
    /// External id to node id, consulted by `:REDIRECT_NODE` expressions.
    #[serde(default)]
    pub redirects: BTreeMap<String, String>,
}

impl RoutingConfig {
    pub fn new(node_id: &str, node_group_id: &str) -> Self {
        Self {
            identity: Identity {
                node_id: node_id.to_string(),
                node_group_id: node_group_id.to_string(),
            },
            settings: RouterSettings::default(),
            channels: Vec::new(),
            group_links: Vec::new(),
            routers: Vec::new(),
            triggers: Vec::new(),
            trigger_routers: Vec::new(),
            redirects: BTreeMap::new(),
        }
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read routing config from {:?}", path))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid routing config in {:?}", path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: RoutingConfig =
            toml::from_str(contents).context("Failed to parse routing config")?;
        config.validate()?;
        Ok(config)
    }

    /// Default config location: `~/.data-router/routing.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home_dir =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home_dir.join(".data-router").join("routing.toml"))
    }

    /// Default routing database: `~/.data-router/routing.db`
    pub fn default_db_path() -> Result<PathBuf> {
        Ok(Self::default_path()?.with_file_name("routing.db"))
    }

    /// Checks cross references between channels, links, routers and triggers
    pub fn validate(&self) -> Result<()> {
        if self.identity.node_id.trim().is_empty() {
            bail!("identity.node_id must not be empty");
        }
        if self.settings.max_gap_size < 1 {
            bail!("settings.max_gap_size must be at least 1");
        }
        if self.settings.max_gaps_in_query < 1 {
            bail!("settings.max_gaps_in_query must be at least 1");
        }

        let channel_ids = unique_ids("channel", self.channels.iter().map(|c| &c.channel_id))?;
        let router_ids = unique_ids("router", self.routers.iter().map(|r| &r.router_id))?;
        let trigger_ids = unique_ids("trigger", self.triggers.iter().map(|t| &t.trigger_id))?;

        for channel in &self.channels {
            if channel.max_batch_size == 0 {
                bail!(
                    "Channel '{}' must allow at least one row per batch",
                    channel.channel_id
                );
            }
        }

        for router in &self.routers {
            let linked = self.group_links.iter().any(|link| {
                link.source_node_group_id == router.source_node_group_id
                    && link.target_node_group_id == router.target_node_group_id
            });
            if !linked {
                bail!(
                    "Router '{}' uses group link {} -> {} which is not configured",
                    router.router_id,
                    router.source_node_group_id,
                    router.target_node_group_id
                );
            }
        }

        for trigger in &self.triggers {
            if !channel_ids.contains(trigger.channel_id.as_str()) {
                bail!(
                    "Trigger '{}' references unknown channel '{}'",
                    trigger.trigger_id,
                    trigger.channel_id
                );
            }
        }

        let mut links = HashSet::new();
        for link in &self.trigger_routers {
            if !links.insert((link.trigger_id.as_str(), link.router_id.as_str())) {
                bail!(
                    "Duplicate trigger router '{}' -> '{}'",
                    link.trigger_id,
                    link.router_id
                );
            }
            if !trigger_ids.contains(link.trigger_id.as_str()) {
                bail!(
                    "Trigger router references unknown trigger '{}'",
                    link.trigger_id
                );
            }
            if !router_ids.contains(link.router_id.as_str()) {
                bail!(
                    "Trigger router references unknown router '{}'",
                    link.router_id
                );
            }
        }

        Ok(())
    }

    pub fn channel(&self, channel_id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }

    pub fn router(&self, router_id: &str) -> Option<&RouterConfig> {
        self.routers.iter().find(|r| r.router_id == router_id)
    }

    /// Node groups this node sends to.
    pub fn target_groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = self
            .group_links
            .iter()
            .filter(|link| link.source_node_group_id == self.identity.node_group_id)
            .map(|link| link.target_node_group_id.as_str())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// Router lookup keyed by channel and upper-cased table name.
    pub fn trigger_router_index(&self) -> TriggerRouterIndex {
        let mut routes: HashMap<(String, String), Vec<RouterConfig>> = HashMap::new();
        for link in self.trigger_routers.iter().filter(|link| link.enabled) {
            let trigger = self.triggers.iter().find(|t| t.trigger_id == link.trigger_id);
            let router = self.router(&link.router_id);
            if let (Some(trigger), Some(router)) = (trigger, router) {
                if router.source_node_group_id != self.identity.node_group_id {
                    continue;
                }
                let routers = routes
                    .entry((
                        trigger.channel_id.clone(),
                        trigger.source_table_name.to_uppercase(),
                    ))
                    .or_default();
                // Several triggers on one table may share a router; route through it once.
                if !routers.iter().any(|r| r.router_id == router.router_id) {
                    routers.push(router.clone());
                }
            }
        }
        TriggerRouterIndex { routes }
    }

    /// Returns a stable fingerprint for the routing configuration
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.identity.node_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.identity.node_group_id.as_bytes());
        hasher.update(b"#");
        // Serialization of owned config types cannot fail.
        let body = serde_json::to_string(&(
            &self.settings,
            &self.channels,
            &self.group_links,
            &self.routers,
            &self.triggers,
            &self.trigger_routers,
            &self.redirects,
        ))
        .unwrap_or_default();
        hasher.update(body.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Pre-resolved `(channel, table) -> routers` map.
#[derive(Debug, Clone, Default)]
pub struct TriggerRouterIndex {
    routes: HashMap<(String, String), Vec<RouterConfig>>,
}

impl TriggerRouterIndex {
    pub fn routers_for(&self, channel_id: &str, table_name: &str) -> &[RouterConfig] {
        self.routes
            .get(&(channel_id.to_string(), table_name.to_uppercase()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn unique_ids<'a>(
    kind: &str,
    ids: impl Iterator<Item = &'a String>,
) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            bail!("{} id must not be empty", kind);
        }
        if !seen.insert(id.as_str()) {
            bail!("Duplicate {} id '{}'", kind, id);
        }
    }
    Ok(seen)
}

fn default_true() -> bool {
    true
}

fn default_router_type() -> String {
    "default".to_string()
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_batch_wait_ms() -> u64 {
    60_000
}

fn default_max_gaps_in_query() -> usize {
    100
}

fn default_max_gap_size() -> i64 {
    50_000_000
}

fn default_max_rows_per_pass() -> usize {
    100_000
}

fn default_stale_gap_timeout_secs() -> u64 {
    1200
}

fn default_poll_interval_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[identity]
node_id = "corp-000"
node_group_id = "corp"

[settings]
max_gaps_in_query = 10

[[channel]]
channel_id = "default"

[[channel]]
channel_id = "sale"
batch_algorithm = "transactional"
max_batch_size = 50

[[group_link]]
source_node_group_id = "corp"
target_node_group_id = "store"

[[router]]
router_id = "corp-2-store"
router_type = "column"
expression = "STORE_ID=:EXTERNAL_ID"
source_node_group_id = "corp"
target_node_group_id = "store"

[[trigger]]
trigger_id = "sale"
source_table_name = "sale_transaction"
channel_id = "sale"

[[trigger_router]]
trigger_id = "sale"
router_id = "corp-2-store"

[redirects]
"42" = "store-b"
"#;

    #[test]
    fn test_parses_sample_config() {
        let config = RoutingConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.identity.node_id, "corp-000");
        assert_eq!(config.settings.max_gaps_in_query, 10);
        assert_eq!(config.settings.max_gap_size, 50_000_000);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(
            config.channel("sale").unwrap().batch_algorithm,
            BatchAlgorithm::Transactional
        );
        assert_eq!(config.channel("default").unwrap().max_batch_size, 1000);
        assert_eq!(config.redirects.get("42").map(String::as_str), Some("store-b"));
        assert_eq!(config.target_groups(), vec!["store"]);
    }

    #[test]
    fn test_index_matches_tables_case_insensitively() {
        let config = RoutingConfig::from_toml_str(SAMPLE).unwrap();
        let index = config.trigger_router_index();
        let routers = index.routers_for("sale", "SALE_TRANSACTION");
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].router_id, "corp-2-store");
        assert!(index.routers_for("default", "sale_transaction").is_empty());
    }

    #[test]
    fn test_rejects_router_without_group_link() {
        let broken = SAMPLE.replace(
            "[[group_link]]\nsource_node_group_id = \"corp\"\ntarget_node_group_id = \"store\"\n",
            "",
        );
        let err = RoutingConfig::from_toml_str(&broken).unwrap_err();
        assert!(format!("{:#}", err).contains("not configured"));
    }

    #[test]
    fn test_rejects_duplicate_channels() {
        let mut config = RoutingConfig::new("corp-000", "corp");
        config.channels.push(ChannelConfig::new("default"));
        config.channels.push(ChannelConfig::new("default"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate channel id 'default'"));
    }

    #[test]
    fn test_rejects_duplicate_trigger_router() {
        let duplicated = format!(
            "{}\n[[trigger_router]]\ntrigger_id = \"sale\"\nrouter_id = \"corp-2-store\"\n",
            SAMPLE
        );
        let err = RoutingConfig::from_toml_str(&duplicated).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicate trigger router 'sale' -> 'corp-2-store'"));
    }

    #[test]
    fn test_index_lists_shared_router_once() {
        let mut config = RoutingConfig::from_toml_str(SAMPLE).unwrap();
        config.triggers.push(TriggerConfig {
            trigger_id: "sale-copy".into(),
            source_table_name: "SALE_TRANSACTION".into(),
            channel_id: "sale".into(),
        });
        config.trigger_routers.push(TriggerRouterConfig {
            trigger_id: "sale-copy".into(),
            router_id: "corp-2-store".into(),
            enabled: true,
        });
        config.validate().unwrap();
        let index = config.trigger_router_index();
        assert_eq!(index.routers_for("sale", "sale_transaction").len(), 1);
    }

    #[test]
    fn test_rejects_trigger_on_unknown_channel() {
        let mut config = RoutingConfig::new("corp-000", "corp");
        config.triggers.push(TriggerConfig {
            trigger_id: "t".into(),
            source_table_name: "item".into(),
            channel_id: "missing".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_event_filters() {
        let mut router = RouterConfig::new("r", "default", "corp", "store");
        router.sync_on_delete = false;
        assert!(router.routes_event(EventType::Insert));
        assert!(!router.routes_event(EventType::Delete));
        assert!(router.routes_event(EventType::Sql));
    }

    #[test]
    fn test_fingerprint_differs_for_different_configs() {
        let a = RoutingConfig::from_toml_str(SAMPLE).unwrap();
        let mut b = a.clone();
        b.redirects.insert("43".into(), "store-c".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }
}
