// ABOUTME: ChannelRouterContext - per-channel, per-pass state shared by the data routers
// ABOUTME: Holds the pass transaction, open batches, scratch cache and collected context events

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::batch::{BatchAccumulator, BatchState, DataEvent};
use super::topology::NodeTopology;
use crate::config::{ChannelConfig, Identity, RouterConfig, RoutingConfig};
use crate::error::RouterError;
use crate::routers::{ContextEvent, DataRouter, RouterRegistry};

/// Where a channel pass is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPhase {
    Idle,
    Reading,
    Routing,
    BatchReady,
    Committing,
    Error,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScratchKey {
    namespace: &'static str,
    key: String,
}

/// Per-pass memo for routers: parsed expressions, depth maps and the like.
///
/// Entries are namespaced so routers cannot see each other's values, and the
/// whole cache is dropped with the context at the end of the pass.
#[derive(Default)]
pub struct ScratchCache {
    entries: HashMap<ScratchKey, Arc<dyn Any + Send + Sync>>,
}

impl ScratchCache {
    pub fn get<T: Any + Send + Sync>(&self, namespace: &'static str, key: &str) -> Option<Arc<T>> {
        let entry = self.entries.get(&ScratchKey {
            namespace,
            key: key.to_string(),
        })?;
        Arc::clone(entry).downcast::<T>().ok()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, namespace: &'static str, key: &str, value: T) {
        self.entries.insert(
            ScratchKey {
                namespace,
                key: key.to_string(),
            },
            Arc::new(value),
        );
    }

    /// Returns the cached value, computing and storing it on first use.
    pub fn get_or_insert_with<T, F>(&mut self, namespace: &'static str, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get::<T>(namespace, key) {
            return value;
        }
        let value = Arc::new(init());
        self.entries.insert(
            ScratchKey {
                namespace,
                key: key.to_string(),
            },
            value.clone(),
        );
        value
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters for one channel pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRoutingStats {
    pub channel_id: String,
    pub rows_read: u64,
    pub rows_routed: u64,
    pub rows_unrouted: u64,
    pub data_events: u64,
    pub router_errors: u64,
    pub transactions: u64,
    pub batch_ids: Vec<i64>,
    pub gaps_removed: usize,
    pub gaps_added: usize,
    pub router_time_ms: u64,
    pub duration_ms: u64,
}

/// State threaded through every router call of one channel pass.
pub struct ChannelRouterContext<'a> {
    conn: &'a Connection,
    config: &'a RoutingConfig,
    channel: &'a ChannelConfig,
    topology: Arc<NodeTopology>,
    scratch: ScratchCache,
    batches: BatchAccumulator,
    last_transaction_id: Option<String>,
    transaction_boundary_crossed: bool,
    events: BTreeSet<ContextEvent>,
    resolved: HashMap<String, Arc<dyn DataRouter>>,
    used: BTreeMap<String, Arc<dyn DataRouter>>,
    reported: HashSet<String>,
    router_time: Duration,
    phase: RoutingPhase,
    stats: ChannelRoutingStats,
}

impl<'a> ChannelRouterContext<'a> {
    pub fn new(
        conn: &'a Connection,
        config: &'a RoutingConfig,
        channel: &'a ChannelConfig,
        topology: Arc<NodeTopology>,
    ) -> Self {
        Self {
            conn,
            config,
            channel,
            topology,
            scratch: ScratchCache::default(),
            batches: BatchAccumulator::new(channel.clone()),
            last_transaction_id: None,
            transaction_boundary_crossed: false,
            events: BTreeSet::new(),
            resolved: HashMap::new(),
            used: BTreeMap::new(),
            reported: HashSet::new(),
            router_time: Duration::ZERO,
            phase: RoutingPhase::Idle,
            stats: ChannelRoutingStats {
                channel_id: channel.channel_id.clone(),
                ..ChannelRoutingStats::default()
            },
        }
    }

    /// The pass transaction. Routers that query run inside it.
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn channel(&self) -> &ChannelConfig {
        self.channel
    }

    pub fn identity(&self) -> &Identity {
        &self.config.identity
    }

    pub fn redirects(&self) -> &BTreeMap<String, String> {
        &self.config.redirects
    }

    pub fn topology(&self) -> Arc<NodeTopology> {
        Arc::clone(&self.topology)
    }

    pub fn scratch(&self) -> &ScratchCache {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut ScratchCache {
        &mut self.scratch
    }

    pub fn phase(&self) -> RoutingPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: RoutingPhase) {
        if self.phase != phase {
            trace!(channel = %self.channel.channel_id, from = ?self.phase, to = ?phase, "Routing phase");
            self.phase = phase;
        }
    }

    /// Records the transaction of the next row and fires the batch boundary
    /// hook when it differs from the previous row's. Rows without a
    /// transaction id are each their own transaction.
    pub fn begin_row(&mut self, transaction_id: Option<&str>) -> bool {
        let crossed = self.stats.rows_read > 0
            && (transaction_id.is_none() || transaction_id != self.last_transaction_id.as_deref());
        if crossed || self.stats.rows_read == 0 {
            self.stats.transactions += 1;
        }
        if crossed && self.batches.on_transaction_boundary() > 0 {
            self.set_phase(RoutingPhase::BatchReady);
        }
        self.transaction_boundary_crossed = crossed;
        self.last_transaction_id = transaction_id.map(str::to_string);
        self.stats.rows_read += 1;
        crossed
    }

    /// Whether the row currently being routed started a new transaction.
    pub fn transaction_boundary_crossed(&self) -> bool {
        self.transaction_boundary_crossed
    }

    pub fn append_event(&mut self, node_id: &str, data_id: i64, router_id: &str, bytes: u64) {
        self.stats.data_events += 1;
        if self.batches.append(node_id, DataEvent::new(data_id, router_id), bytes)
            == BatchState::Ready
        {
            self.set_phase(RoutingPhase::BatchReady);
        }
    }

    pub fn batches(&self) -> &BatchAccumulator {
        &self.batches
    }

    pub fn batches_mut(&mut self) -> &mut BatchAccumulator {
        &mut self.batches
    }

    /// Queues a configuration event, delivered once after commit.
    pub fn record_event(&mut self, event: ContextEvent) {
        self.events.insert(event);
    }

    pub fn events(&self) -> &BTreeSet<ContextEvent> {
        &self.events
    }

    /// Looks up the router implementation for a configured router, once per pass.
    pub fn resolve_router(
        &mut self,
        registry: &RouterRegistry,
        router: &RouterConfig,
    ) -> Result<Arc<dyn DataRouter>> {
        if let Some(found) = self.resolved.get(&router.router_id) {
            return Ok(Arc::clone(found));
        }
        let found = registry.resolve(&router.router_type).ok_or_else(|| {
            anyhow!(
                "Router '{}' has unknown type '{}'",
                router.router_id,
                router.router_type
            )
        })?;
        self.resolved
            .insert(router.router_id.clone(), Arc::clone(&found));
        self.used
            .insert(router.router_type.clone(), Arc::clone(&found));
        Ok(found)
    }

    pub fn add_router_time(&mut self, elapsed: Duration) {
        self.router_time += elapsed;
    }

    /// Logs a recoverable router error: a warning the first time a router
    /// fails in this pass, debug afterwards.
    pub fn report_router_error(&mut self, err: &RouterError, data_id: i64) {
        self.stats.router_errors += 1;
        if self.reported.insert(err.router_id().to_string()) {
            warn!(
                channel = %self.channel.channel_id,
                router = %err.router_id(),
                data_id,
                "{}; row left unrouted for this router",
                err
            );
        } else {
            debug!(router = %err.router_id(), data_id, "{}", err);
        }
    }

    pub fn stats(&self) -> &ChannelRoutingStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ChannelRoutingStats {
        &mut self.stats
    }

    /// Ends the pass: hands back what the post-commit callbacks need.
    pub fn finish(self) -> FinishedContext {
        let mut stats = self.stats;
        stats.router_time_ms = self.router_time.as_millis() as u64;
        FinishedContext {
            routers_by_id: self.resolved,
            routers: self.used.into_values().collect(),
            events: self.events.into_iter().collect(),
            stats,
        }
    }
}

/// What survives a pass once its context is dropped.
pub struct FinishedContext {
    pub routers_by_id: HashMap<String, Arc<dyn DataRouter>>,
    /// One instance per router type used in the pass.
    pub routers: Vec<Arc<dyn DataRouter>>,
    pub events: Vec<ContextEvent>,
    pub stats: ChannelRoutingStats,
}
