// ABOUTME: Column match router - routes on column = value / column != value expressions
// ABOUTME: Supports NULL, node attribute, redirect and other-column operands

use change_log::Node;
use std::collections::BTreeSet;

use super::{all_nodes, DataMetaData, DataRouter, RouteResult};
use crate::error::RouterError;
use crate::routing::context::ChannelRouterContext;

const SCRATCH_NAMESPACE: &str = "column-match";

/// Right-hand side of a clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(String),
    Null,
    NodeId,
    ExternalId,
    NodeGroupId,
    /// The node the column value is redirected to.
    RedirectNode,
    /// Another column of the same row.
    Column(String),
}

/// One `COLUMN=operand` or `COLUMN!=operand` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub column: String,
    pub equals: bool,
    pub operand: Operand,
}

/// Parses a router expression. Clauses are separated by newlines or `OR`
/// and a row goes to every node selected by any clause.
pub fn parse_expressions(text: &str) -> Result<Vec<Expression>, String> {
    let mut expressions = Vec::new();
    for line in text.lines() {
        for clause in split_or(line) {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            expressions.push(parse_clause(clause)?);
        }
    }
    if expressions.is_empty() {
        return Err("expression is empty".to_string());
    }
    Ok(expressions)
}

fn split_or(line: &str) -> Vec<&str> {
    let lower = line.to_ascii_lowercase();
    let mut clauses = Vec::new();
    let mut start = 0;
    while let Some(pos) = lower[start..].find(" or ") {
        clauses.push(&line[start..start + pos]);
        start += pos + 4;
    }
    clauses.push(&line[start..]);
    clauses
}

fn parse_clause(clause: &str) -> Result<Expression, String> {
    let (column, value, equals) = if let Some((lhs, rhs)) = clause.split_once("!=") {
        (lhs, rhs, false)
    } else if let Some((lhs, rhs)) = clause.split_once("<>") {
        (lhs, rhs, false)
    } else if let Some((lhs, rhs)) = clause.split_once('=') {
        (lhs, rhs, true)
    } else {
        return Err(format!("'{}' has no = or != operator", clause));
    };

    let column = column.trim().to_uppercase();
    if column.is_empty() {
        return Err(format!("'{}' has no column name", clause));
    }
    Ok(Expression {
        column,
        equals,
        operand: parse_operand(value.trim())?,
    })
}

fn parse_operand(value: &str) -> Result<Operand, String> {
    if value.eq_ignore_ascii_case("null") {
        return Ok(Operand::Null);
    }
    if let Some(name) = value.strip_prefix(':') {
        let name = name.trim().to_uppercase();
        return Ok(match name.as_str() {
            "" => return Err("':' must be followed by a column or node attribute".to_string()),
            "NODE_ID" => Operand::NodeId,
            "EXTERNAL_ID" => Operand::ExternalId,
            "NODE_GROUP_ID" => Operand::NodeGroupId,
            "REDIRECT_NODE" => Operand::RedirectNode,
            _ => Operand::Column(name),
        });
    }
    let unquoted = ['\'', '"']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|rest| rest.strip_suffix(*quote))
        })
        .unwrap_or(value);
    Ok(Operand::Literal(unquoted.to_string()))
}

fn matches(left: Option<&str>, right: Option<&str>, equals: bool) -> bool {
    (left == right) == equals
}

/// Routes on the values of the changed row.
#[derive(Debug, Default)]
pub struct ColumnMatchDataRouter;

impl DataRouter for ColumnMatchDataRouter {
    fn route_to_nodes(
        &self,
        ctx: &mut ChannelRouterContext<'_>,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> RouteResult {
        let router = data.router;
        let parsed = ctx
            .scratch_mut()
            .get_or_insert_with(SCRATCH_NAMESPACE, &router.router_id, || {
                parse_expressions(router.expression())
            });
        let expressions = match parsed.as_ref() {
            Ok(expressions) => expressions,
            Err(reason) => {
                return Err(RouterError::invalid_expression(
                    &router.router_id,
                    router.expression(),
                    reason.as_str(),
                ))
            }
        };

        let values = data.values();
        let mut targets = BTreeSet::new();
        for expression in expressions {
            let value = values.get(&expression.column);
            match &expression.operand {
                Operand::NodeId => targets.extend(
                    nodes
                        .iter()
                        .filter(|node| matches(value, Some(node.node_id.as_str()), expression.equals))
                        .map(|node| node.node_id.clone()),
                ),
                Operand::ExternalId => targets.extend(
                    nodes
                        .iter()
                        .filter(|node| matches(value, Some(node.external_id.as_str()), expression.equals))
                        .map(|node| node.node_id.clone()),
                ),
                Operand::NodeGroupId => targets.extend(
                    nodes
                        .iter()
                        .filter(|node| {
                            matches(value, Some(node.node_group_id.as_str()), expression.equals)
                        })
                        .map(|node| node.node_id.clone()),
                ),
                Operand::RedirectNode => {
                    let redirect = value.and_then(|v| ctx.redirects().get(v)).map(String::as_str);
                    targets.extend(
                        nodes
                            .iter()
                            .filter(|node| {
                                redirect.is_some()
                                    && matches(redirect, Some(node.node_id.as_str()), expression.equals)
                            })
                            .map(|node| node.node_id.clone()),
                    );
                }
                Operand::Column(other) => {
                    if matches(value, values.get(other), expression.equals) {
                        targets.extend(all_nodes(nodes));
                    }
                }
                Operand::Null => {
                    if value.is_none() == expression.equals {
                        targets.extend(all_nodes(nodes));
                    }
                }
                Operand::Literal(literal) => {
                    if matches(value, Some(literal.as_str()), expression.equals) {
                        targets.extend(all_nodes(nodes));
                    }
                }
            }
            if targets.len() == nodes.len() {
                break;
            }
        }

        Ok(Some(targets))
    }
}
