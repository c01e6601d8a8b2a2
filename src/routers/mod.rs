// ABOUTME: DataRouter trait, per-row routing metadata and the router type registry
// ABOUTME: Built-in routers: default, column, subselect, config and trigger-table

pub mod column_match;
pub mod configuration;
pub mod subselect;
pub mod trigger_table;

use change_log::{DataRow, Node};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::routing::batch::OutgoingBatch;
use crate::routing::context::ChannelRouterContext;

pub use column_match::ColumnMatchDataRouter;
pub use configuration::{
    ConfigurationChangedDataRouter, ConfigurationListener, LoggingConfigurationListener,
    RecordingConfigurationListener,
};
pub use subselect::SubSelectDataRouter;
pub use trigger_table::TriggerTableSupportingDataRouter;

/// Node ids a row goes to, or `None` when no node wants it.
pub type RouteResult = Result<Option<BTreeSet<String>>, RouterError>;

/// Configuration changes observed while routing, delivered after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextEvent {
    ReloadParameters,
    ReloadChannels,
    SyncTriggers,
}

/// Decides which of the candidate nodes receive a change row.
///
/// Implementations are shared across channels and passes, so per-pass state
/// belongs in the context's scratch cache, not in the router.
pub trait DataRouter: Send + Sync {
    fn route_to_nodes(
        &self,
        ctx: &mut ChannelRouterContext<'_>,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        initial_load: bool,
    ) -> RouteResult;

    /// Called once per batch that closed with this router's events, after commit.
    fn on_batch_complete(&self, _batch: &OutgoingBatch) {}

    /// Called once per pass after commit with the events the pass recorded.
    fn on_context_committed(&self, _events: &[ContextEvent]) {}
}

/// Column values of a row keyed by upper-cased name. Old values are also
/// present under an `OLD_` prefix.
#[derive(Debug, Clone, Default)]
pub struct RowValues {
    values: HashMap<String, Option<String>>,
}

impl RowValues {
    pub fn from_row(row: &DataRow) -> Self {
        let mut values = HashMap::with_capacity(row.row_data.len() * 2);
        if let Some(old) = &row.old_data {
            for (name, value) in old {
                values.insert(format!("OLD_{}", name.to_uppercase()), value.clone());
            }
        }
        for (name, value) in &row.row_data {
            values.insert(name.to_uppercase(), value.clone());
        }
        // Deletes only carry old values; expose them under the plain names too.
        if row.row_data.is_empty() {
            if let Some(old) = &row.old_data {
                for (name, value) in old {
                    values.insert(name.to_uppercase(), value.clone());
                }
            }
        }
        Self { values }
    }

    /// Value of a column; absent columns read as null.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .get(&column.to_uppercase())
            .and_then(|value| value.as_deref())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(&column.to_uppercase())
    }
}

/// Everything a router sees about the row it is routing.
pub struct DataMetaData<'a> {
    pub row: &'a DataRow,
    pub router: &'a RouterConfig,
    values: &'a RowValues,
}

impl<'a> DataMetaData<'a> {
    pub fn new(row: &'a DataRow, router: &'a RouterConfig, values: &'a RowValues) -> Self {
        Self {
            row,
            router,
            values,
        }
    }

    pub fn values(&self) -> &'a RowValues {
        self.values
    }

    pub fn table_name(&self) -> &str {
        &self.row.table_name
    }
}

/// Sends every row to every candidate node.
#[derive(Debug, Default)]
pub struct DefaultDataRouter;

impl DataRouter for DefaultDataRouter {
    fn route_to_nodes(
        &self,
        _ctx: &mut ChannelRouterContext<'_>,
        _data: &DataMetaData<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> RouteResult {
        Ok(Some(all_nodes(nodes)))
    }
}

pub(crate) fn all_nodes(nodes: &[Node]) -> BTreeSet<String> {
    nodes.iter().map(|node| node.node_id.clone()).collect()
}

/// Router implementations by router type.
#[derive(Clone, Default)]
pub struct RouterRegistry {
    routers: HashMap<String, Arc<dyn DataRouter>>,
}

impl RouterRegistry {
    /// Registry with every built-in router type.
    pub fn with_builtin(listener: Arc<dyn ConfigurationListener>) -> Self {
        let mut registry = Self::default();
        registry.register("default", Arc::new(DefaultDataRouter));
        registry.register("column", Arc::new(ColumnMatchDataRouter));
        registry.register("subselect", Arc::new(SubSelectDataRouter));
        registry.register(
            "config",
            Arc::new(ConfigurationChangedDataRouter::new(listener)),
        );
        registry.register("trigger-table", Arc::new(TriggerTableSupportingDataRouter));
        registry
    }

    /// Adds or replaces the implementation behind a router type.
    pub fn register(&mut self, router_type: &str, router: Arc<dyn DataRouter>) {
        self.routers.insert(router_type.to_string(), router);
    }

    pub fn resolve(&self, router_type: &str) -> Option<Arc<dyn DataRouter>> {
        self.routers.get(router_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routers.keys().map(String::as_str).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, RoutingConfig};
    use crate::routing::topology::NodeTopology;
    use change_log::{ChangeLog, ColumnMap, EventType, NodeStore};
    use chrono::Utc;
    use tempfile::tempdir;

    /// Runs `f` against a context over a fresh database holding `topology`.
    pub(crate) fn with_context<T>(
        config: &RoutingConfig,
        topology: NodeTopology,
        f: impl FnOnce(&mut ChannelRouterContext<'_>) -> T,
    ) -> T {
        let dir = tempdir().unwrap();
        let log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
        let store = NodeStore::new(log.connection());
        for node in topology.nodes() {
            store.upsert(node).unwrap();
        }
        let channel = ChannelConfig::new("default");
        let mut ctx =
            ChannelRouterContext::new(log.connection(), config, &channel, Arc::new(topology));
        f(&mut ctx)
    }

    pub(crate) fn row_with(
        table: &str,
        event_type: EventType,
        new: &[(&str, Option<&str>)],
        old: Option<&[(&str, Option<&str>)]>,
    ) -> DataRow {
        fn map(pairs: &[(&str, Option<&str>)]) -> ColumnMap {
            pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
                .collect()
        }
        DataRow {
            data_id: 1,
            table_name: table.to_string(),
            event_type,
            row_data: map(new),
            old_data: old.map(map),
            channel_id: "default".to_string(),
            transaction_id: None,
            source_node_id: None,
            node_list: None,
            create_time: Utc::now(),
        }
    }

    #[test]
    fn test_row_values_are_case_insensitive_with_old_prefix() {
        let row = row_with(
            "item",
            EventType::Update,
            &[("store_id", Some("s1")), ("note", None)],
            Some(&[("store_id", Some("s0"))]),
        );
        let values = RowValues::from_row(&row);
        assert_eq!(values.get("STORE_ID"), Some("s1"));
        assert_eq!(values.get("store_id"), Some("s1"));
        assert_eq!(values.get("OLD_STORE_ID"), Some("s0"));
        assert_eq!(values.get("NOTE"), None);
        assert!(values.contains("NOTE"));
        assert!(!values.contains("MISSING"));
    }

    #[test]
    fn test_delete_rows_expose_old_values_by_plain_name() {
        let row = row_with("item", EventType::Delete, &[], Some(&[("STORE_ID", Some("s0"))]));
        let values = RowValues::from_row(&row);
        assert_eq!(values.get("STORE_ID"), Some("s0"));
        assert_eq!(values.get("OLD_STORE_ID"), Some("s0"));
    }

    #[test]
    fn test_builtin_registry_types() {
        let registry = RouterRegistry::with_builtin(Arc::new(LoggingConfigurationListener));
        assert_eq!(
            registry.types(),
            vec!["column", "config", "default", "subselect", "trigger-table"]
        );
        assert!(registry.resolve("bsh").is_none());
    }
}
