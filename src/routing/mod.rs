// ABOUTME: Routing engine - gap tracking, gap reads, per-pass context, batching and orchestration
// ABOUTME: RoutingService runs one channel pass; RoutingDaemon schedules passes over all channels

pub mod batch;
pub mod context;
pub mod daemon;
pub mod gaps;
pub mod lock;
pub mod reader;
pub mod service;
pub mod topology;

pub use batch::{BatchAccumulator, BatchState, DataEvent, OutgoingBatch};
pub use context::{ChannelRouterContext, ChannelRoutingStats, RoutingPhase, ScratchCache};
pub use daemon::{CycleStats, DaemonConfig, RoutingDaemon};
pub use gaps::{DataGapTracker, GapUpdate};
pub use lock::{ChannelLock, LocalChannelLock, LockGuard};
pub use reader::{GapCursor, PreparedRead, RouteReader};
pub use service::{RoutingService, RoutingStats, RELOAD_ROUTER_ID, UNROUTED_ROUTER_ID};
pub use topology::NodeTopology;
