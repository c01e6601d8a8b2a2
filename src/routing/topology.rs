// ABOUTME: NodeTopology - snapshot of the node registry for one routing pass
// ABOUTME: Answers candidate-node, registration-tree depth and ancestry questions

use anyhow::{Context, Result};
use change_log::{Node, NodeStore};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};

/// Registered nodes, keyed by node id, as seen at the start of a pass.
#[derive(Debug, Clone, Default)]
pub struct NodeTopology {
    nodes: BTreeMap<String, Node>,
}

impl NodeTopology {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| (node.node_id.clone(), node))
                .collect(),
        }
    }

    /// Load the node registry from the routing database.
    pub fn load(conn: &Connection) -> Result<Self> {
        let nodes = NodeStore::new(conn)
            .list()
            .context("Failed to load node registry")?;
        Ok(Self::new(nodes))
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Sync-enabled nodes of the given groups, never the routing node itself
    /// nor the node the change originally came from.
    pub fn candidates(
        &self,
        groups: &[&str],
        identity_node_id: &str,
        source_node_id: Option<&str>,
    ) -> Vec<Node> {
        self.nodes
            .values()
            .filter(|node| node.sync_enabled)
            .filter(|node| groups.contains(&node.node_group_id.as_str()))
            .filter(|node| node.node_id != identity_node_id)
            .filter(|node| Some(node.node_id.as_str()) != source_node_id)
            .cloned()
            .collect()
    }

    fn parent_of(&self, node_id: &str) -> Option<&str> {
        self.nodes
            .get(node_id)
            .and_then(|node| node.created_at_node_id.as_deref())
            .filter(|parent| *parent != node_id)
    }

    /// Number of registration hops between a node and the root, or `None`
    /// when the chain leaves the registry or loops.
    pub fn depth(&self, node_id: &str) -> Option<usize> {
        self.nodes.get(node_id)?;
        let mut depth = 0;
        let mut current = node_id;
        while let Some(parent) = self.parent_of(current) {
            if !self.nodes.contains_key(parent) || depth > self.nodes.len() {
                return None;
            }
            depth += 1;
            current = parent;
        }
        Some(depth)
    }

    pub fn depths(&self) -> HashMap<String, usize> {
        self.nodes
            .keys()
            .filter_map(|id| self.depth(id).map(|depth| (id.clone(), depth)))
            .collect()
    }

    /// True when `ancestor` registered `node_id`, directly or transitively.
    pub fn is_ancestor(&self, ancestor: &str, node_id: &str) -> bool {
        let mut current = node_id;
        let mut hops = 0;
        while let Some(parent) = self.parent_of(current) {
            if parent == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
            current = parent;
        }
        false
    }
}
