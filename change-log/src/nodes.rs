use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// A registered node and the identity attributes routers match against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group_id: String,
    pub external_id: String,
    pub sync_enabled: bool,
    /// The node that registered this one; `None` for the root.
    pub created_at_node_id: Option<String>,
    pub protocol_version: u32,
}

impl Node {
    pub fn new(node_id: &str, node_group_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_group_id: node_group_id.to_string(),
            external_id: node_id.to_string(),
            sync_enabled: true,
            created_at_node_id: None,
            protocol_version: 2,
        }
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = external_id.to_string();
        self
    }

    pub fn created_at(mut self, node_id: &str) -> Self {
        self.created_at_node_id = Some(node_id.to_string());
        self
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.sync_enabled = false;
        self
    }
}

pub struct NodeStore<'a> {
    conn: &'a Connection,
}

impl<'a> NodeStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, node: &Node) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sym_node(node_id, node_group_id, external_id, sync_enabled,
                                      created_at_node_id, protocol_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(node_id) DO UPDATE SET
                    node_group_id = excluded.node_group_id,
                    external_id = excluded.external_id,
                    sync_enabled = excluded.sync_enabled,
                    created_at_node_id = excluded.created_at_node_id,
                    protocol_version = excluded.protocol_version",
                params![
                    node.node_id,
                    node.node_group_id,
                    node.external_id,
                    node.sync_enabled,
                    node.created_at_node_id,
                    node.protocol_version,
                ],
            )
            .with_context(|| format!("failed to register node {}", node.node_id))?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, node_group_id, external_id, sync_enabled, created_at_node_id,
                    protocol_version
             FROM sym_node
             ORDER BY node_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Node {
                node_id: row.get(0)?,
                node_group_id: row.get(1)?,
                external_id: row.get(2)?,
                sync_enabled: row.get(3)?,
                created_at_node_id: row.get(4)?,
                protocol_version: row.get(5)?,
            });
        }
        Ok(out)
    }
}
