// ABOUTME: Error types raised at the data router seam
// ABOUTME: Separates recoverable expression errors from failures that abort a routing pass

use thiserror::Error;

/// Errors a [`DataRouter`](crate::routers::DataRouter) may return for one row.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The router expression could not be parsed or prepared.
    ///
    /// The row is treated as unrouted for this router; the pass continues.
    #[error("invalid expression for router '{router_id}' ({expression}): {reason}")]
    InvalidExpression {
        router_id: String,
        expression: String,
        reason: String,
    },

    /// A query issued by the router failed while executing.
    ///
    /// The pass is aborted and its transaction rolled back.
    #[error("router '{router_id}' query failed")]
    Sql {
        router_id: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Any other failure inside a router. Aborts the pass.
    #[error("router '{router_id}' failed: {message}")]
    Failed { router_id: String, message: String },
}

impl RouterError {
    pub fn invalid_expression(
        router_id: &str,
        expression: &str,
        reason: impl Into<String>,
    ) -> Self {
        RouterError::InvalidExpression {
            router_id: router_id.to_string(),
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the pass may continue with the row left unrouted for this router.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RouterError::InvalidExpression { .. })
    }

    pub fn router_id(&self) -> &str {
        match self {
            RouterError::InvalidExpression { router_id, .. }
            | RouterError::Sql { router_id, .. }
            | RouterError::Failed { router_id, .. } => router_id,
        }
    }
}
