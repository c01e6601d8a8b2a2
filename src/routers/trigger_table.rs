// ABOUTME: Trigger-table router - routes the engine's trigger and router configuration rows
// ABOUTME: Withholds router rows from nodes on protocol versions that cannot apply them

use change_log::{table_name, Node};

use super::{all_nodes, DataMetaData, DataRouter, RouteResult};
use crate::routing::context::ChannelRouterContext;

/// Oldest protocol that understands router and trigger-router rows.
pub const MIN_ROUTER_PROTOCOL_VERSION: u32 = 2;

/// Routes trigger configuration, holding router rows back from nodes too old
/// to apply them.
#[derive(Debug, Default)]
pub struct TriggerTableSupportingDataRouter;

impl DataRouter for TriggerTableSupportingDataRouter {
    fn route_to_nodes(
        &self,
        _ctx: &mut ChannelRouterContext<'_>,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> RouteResult {
        let table = data.table_name();
        let router_rows = ["router", "trigger_router"]
            .iter()
            .any(|suffix| table.eq_ignore_ascii_case(&table_name(suffix)));
        if !router_rows {
            return Ok(Some(all_nodes(nodes)));
        }
        Ok(Some(
            nodes
                .iter()
                .filter(|node| node.protocol_version >= MIN_ROUTER_PROTOCOL_VERSION)
                .map(|node| node.node_id.clone())
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouterConfig, RoutingConfig};
    use crate::routers::tests::{row_with, with_context};
    use crate::routers::RowValues;
    use crate::routing::topology::NodeTopology;
    use change_log::EventType;

    fn route(table: &str) -> Vec<String> {
        let nodes = vec![
            Node::new("store-new", "store"),
            Node::new("store-old", "store").with_protocol_version(1),
        ];
        let config = RoutingConfig::new("corp", "corp");
        let router = RouterConfig::new("triggers", "trigger-table", "corp", "store");
        let row = row_with(table, EventType::Insert, &[("router_id", Some("r1"))], None);
        let values = RowValues::from_row(&row);
        let data = DataMetaData::new(&row, &router, &values);
        with_context(&config, NodeTopology::new(nodes.clone()), |ctx| {
            TriggerTableSupportingDataRouter.route_to_nodes(ctx, &data, &nodes, false)
        })
        .unwrap()
        .unwrap()
        .into_iter()
        .collect()
    }

    #[test]
    fn test_router_rows_skip_old_protocol_nodes() {
        assert_eq!(route("sym_router"), vec!["store-new"]);
        assert_eq!(route("SYM_TRIGGER_ROUTER"), vec!["store-new"]);
    }

    #[test]
    fn test_other_tables_go_everywhere() {
        assert_eq!(route("sym_trigger"), vec!["store-new", "store-old"]);
    }
}
