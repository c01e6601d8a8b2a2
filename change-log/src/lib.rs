pub mod batches;
pub mod change;
pub mod gaps;
pub mod log;
pub mod nodes;

pub use batches::{BatchStatus, BatchStore, DataEventRecord, NewOutgoingBatch, OutgoingBatchRecord};
pub use change::{ColumnMap, DataRow, EventType, NewDataRow};
pub use gaps::{DataGap, GapStore};
pub use log::ChangeLog;
pub use nodes::{Node, NodeStore};

/// Prefix shared by every table the engine owns or captures configuration from.
pub const TABLE_PREFIX: &str = "sym";

/// Node id used for the batch that records rows no node was interested in.
pub const UNROUTED_NODE_ID: &str = "-1";

/// Returns the prefixed name of an engine table, e.g. `table_name("node")` is `sym_node`.
pub fn table_name(suffix: &str) -> String {
    format!("{TABLE_PREFIX}_{suffix}")
}
