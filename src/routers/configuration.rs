// ABOUTME: Configuration router - routes changes to the engine's own sym_* tables
// ABOUTME: Node rows follow the registration tree; other config rows raise post-commit reload events

use change_log::{table_name, Node};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

use super::{all_nodes, ContextEvent, DataMetaData, DataRouter, RouteResult};
use crate::routing::context::ChannelRouterContext;

const SCRATCH_NAMESPACE: &str = "configuration";

/// Receives the configuration changes a committed pass routed.
pub trait ConfigurationListener: Send + Sync {
    fn reload_parameters(&self);
    fn reload_channels(&self);
    fn sync_triggers(&self);
}

/// Listener that only records the request in the log.
#[derive(Debug, Default)]
pub struct LoggingConfigurationListener;

impl ConfigurationListener for LoggingConfigurationListener {
    fn reload_parameters(&self) {
        info!("Parameters changed, reload requested");
    }

    fn reload_channels(&self) {
        info!("Channels changed, reload requested");
    }

    fn sync_triggers(&self) {
        info!("Trigger configuration changed, trigger sync requested");
    }
}

fn is_node_table(table: &str) -> bool {
    ["node", "node_security", "node_host"]
        .iter()
        .any(|suffix| table.eq_ignore_ascii_case(&table_name(suffix)))
}

/// Event raised when a row of the given engine table changes.
pub fn event_for_table(table: &str) -> Option<ContextEvent> {
    let matches = |suffix: &str| table.eq_ignore_ascii_case(&table_name(suffix));
    if matches("parameter") {
        Some(ContextEvent::ReloadParameters)
    } else if matches("channel") {
        Some(ContextEvent::ReloadChannels)
    } else if ["trigger", "router", "trigger_router", "node_group_link"]
        .iter()
        .any(|suffix| matches(suffix))
    {
        Some(ContextEvent::SyncTriggers)
    } else {
        None
    }
}

/// Routes rows of the engine's configuration tables.
///
/// Rows describing a node only travel along that node's registration
/// branch: to its ancestors, its descendants and the node that registered it,
/// never to its peers at the routing node's depth and never to itself.
pub struct ConfigurationChangedDataRouter {
    listener: Arc<dyn ConfigurationListener>,
}

impl ConfigurationChangedDataRouter {
    pub fn new(listener: Arc<dyn ConfigurationListener>) -> Self {
        Self { listener }
    }

    fn route_node_row(
        &self,
        ctx: &mut ChannelRouterContext<'_>,
        data: &DataMetaData<'_>,
        nodes: &[Node],
    ) -> BTreeSet<String> {
        let values = data.values();
        let Some(subject) = values.get("NODE_ID").or_else(|| values.get("OLD_NODE_ID")) else {
            return all_nodes(nodes);
        };

        let topology = ctx.topology();
        let depths = ctx
            .scratch_mut()
            .get_or_insert_with(SCRATCH_NAMESPACE, "depths", || topology.depths());
        let created_at = values
            .get("CREATED_AT_NODE_ID")
            .map(str::to_string)
            .or_else(|| {
                topology
                    .node(subject)
                    .and_then(|node| node.created_at_node_id.clone())
            });
        let my_depth = depths.get(&ctx.identity().node_id).copied();

        let mut targets = BTreeSet::new();
        for node in nodes {
            let target = node.node_id.as_str();
            if target == subject {
                continue;
            }
            if created_at.as_deref() == Some(target) {
                targets.insert(node.node_id.clone());
                continue;
            }
            if my_depth.is_some() && depths.get(target).copied() == my_depth {
                continue;
            }
            if topology.is_ancestor(target, subject) || topology.is_ancestor(subject, target) {
                targets.insert(node.node_id.clone());
            }
        }
        targets
    }
}

impl DataRouter for ConfigurationChangedDataRouter {
    fn route_to_nodes(
        &self,
        ctx: &mut ChannelRouterContext<'_>,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> RouteResult {
        if is_node_table(data.table_name()) {
            return Ok(Some(self.route_node_row(ctx, data, nodes)));
        }
        if let Some(event) = event_for_table(data.table_name()) {
            ctx.record_event(event);
        }
        Ok(Some(all_nodes(nodes)))
    }

    fn on_context_committed(&self, events: &[ContextEvent]) {
        for event in events {
            match event {
                ContextEvent::ReloadParameters => self.listener.reload_parameters(),
                ContextEvent::ReloadChannels => self.listener.reload_channels(),
                ContextEvent::SyncTriggers => self.listener.sync_triggers(),
            }
        }
    }
}

/// Counts listener calls; handy for tests of post-commit delivery.
#[derive(Debug, Default)]
pub struct RecordingConfigurationListener {
    calls: std::sync::Mutex<HashMap<&'static str, usize>>,
}

impl RecordingConfigurationListener {
    pub fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(call).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn record(&self, call: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(call).or_default() += 1;
        }
    }
}

impl ConfigurationListener for RecordingConfigurationListener {
    fn reload_parameters(&self) {
        self.record("reload_parameters");
    }

    fn reload_channels(&self) {
        self.record("reload_channels");
    }

    fn sync_triggers(&self) {
        self.record("sync_triggers");
    }
}
