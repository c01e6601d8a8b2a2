// ABOUTME: Subselect router - routes with a SQL predicate evaluated against the node table
// ABOUTME: Named parameters bind to the row's column values inside the pass transaction

use change_log::{table_name, Node};
use std::collections::BTreeSet;
use tracing::debug;

use super::{DataMetaData, DataRouter, RouteResult};
use crate::error::RouterError;
use crate::routing::context::ChannelRouterContext;

/// Query prefix; the router expression is appended as the final predicate
/// over the node table aliased `c`.
pub fn subselect_sql(expression: &str) -> String {
    format!(
        "SELECT c.node_id FROM {} c \
         WHERE c.node_group_id = :NODE_GROUP_ID AND c.sync_enabled = 1 AND ({})",
        table_name("node"),
        expression
    )
}

/// Routes to the candidate nodes selected by a SQL expression.
///
/// Parameters such as `:STORE_ID` or `:OLD_STATUS` take the row's values;
/// `:NODE_GROUP_ID` is the router's target group. Unknown names bind NULL.
#[derive(Debug, Default)]
pub struct SubSelectDataRouter;

impl DataRouter for SubSelectDataRouter {
    fn route_to_nodes(
        &self,
        ctx: &mut ChannelRouterContext<'_>,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> RouteResult {
        let router = data.router;
        let expression = router.expression().trim();
        if expression.is_empty() {
            return Err(RouterError::invalid_expression(
                &router.router_id,
                expression,
                "subselect expression is empty",
            ));
        }

        let sql_error = |source| RouterError::Sql {
            router_id: router.router_id.clone(),
            source,
        };
        let mut stmt = ctx
            .connection()
            .prepare_cached(&subselect_sql(expression))
            .map_err(|err| {
                RouterError::invalid_expression(&router.router_id, expression, err.to_string())
            })?;

        let names: Vec<Option<String>> = (1..=stmt.parameter_count())
            .map(|idx| stmt.parameter_name(idx).map(str::to_string))
            .collect();
        for (offset, name) in names.iter().enumerate() {
            let key = name
                .as_deref()
                .map(|n| n.trim_start_matches([':', '@', '$']).to_uppercase())
                .unwrap_or_default();
            let value = if key == "NODE_GROUP_ID" {
                Some(router.target_node_group_id.as_str())
            } else {
                if !data.values().contains(&key) {
                    debug!(
                        router = %router.router_id,
                        parameter = %key,
                        "Subselect parameter is not a column of the row, binding NULL"
                    );
                }
                data.values().get(&key)
            };
            stmt.raw_bind_parameter(offset + 1, value)
                .map_err(sql_error)?;
        }

        let candidates: BTreeSet<&str> = nodes.iter().map(|node| node.node_id.as_str()).collect();
        let mut targets = BTreeSet::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(sql_error)? {
            let node_id: String = row.get(0).map_err(sql_error)?;
            if candidates.contains(node_id.as_str()) {
                targets.insert(node_id);
            }
        }
        Ok(Some(targets))
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

    fn topology() -> Vec<Node> {
        vec![
            Node::new("corp", "corp"),
            Node::new("store-a", "store").with_external_id("east"),
            Node::new("store-b", "store").with_external_id("west"),
            Node::new("store-c", "store").with_external_id("west").disabled(),
        ]
    }

    fn route(expression: &str, columns: &[(&str, Option<&str>)]) -> RouteResult {
        let config = RoutingConfig::new("corp", "corp");
        let router =
            RouterConfig::new("by-region", "subselect", "corp", "store").with_expression(expression);
        let row = row_with("sale", EventType::Insert, columns, None);
        let values = RowValues::from_row(&row);
        let data = DataMetaData::new(&row, &router, &values);
        let candidates: Vec<Node> = topology()
            .into_iter()
            .filter(|node| node.node_group_id == "store" && node.sync_enabled)
            .collect();
        with_context(&config, NodeTopology::new(topology()), |ctx| {
            SubSelectDataRouter.route_to_nodes(ctx, &data, &candidates, false)
        })
    }

    #[test]
    fn test_binds_row_values_to_named_parameters() {
        let targets = route("c.external_id = :REGION", &[("region", Some("west"))])
            .unwrap()
            .unwrap();
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["store-b"]);
    }

    #[test]
    fn test_unknown_parameter_binds_null() {
        let targets = route("c.external_id = :MISSING", &[]).unwrap().unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn test_sql_syntax_error_is_invalid_expression() {
        let err = route("c.external_id = = 1", &[]).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.router_id(), "by-region");
    }
}
