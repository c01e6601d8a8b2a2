// ABOUTME: RoutingService - runs routing passes: read gaps, route rows, stage batches, commit
// ABOUTME: Each channel pass is one transaction; router callbacks fire only after it commits

use anyhow::{anyhow, bail, Context, Result};
use change_log::{ChangeLog, DataGap, DataRow, EventType, Node, UNROUTED_NODE_ID};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::batch::OutgoingBatch;
use super::context::{ChannelRouterContext, ChannelRoutingStats, FinishedContext, RoutingPhase};
use super::gaps::DataGapTracker;
use super::reader::RouteReader;
use super::topology::NodeTopology;
use crate::config::{ChannelConfig, RouterConfig, RoutingConfig, TriggerRouterIndex, DEFAULT_ROUTER_ID};
use crate::routers::{DataMetaData, RouterRegistry, RowValues};

/// Router id recorded on events of rows that no node wanted.
pub const UNROUTED_ROUTER_ID: &str = "unrouted";

/// Router id recorded on reload rows sent straight to their node list.
pub const RELOAD_ROUTER_ID: &str = "reload";

/// Outcome of routing every enabled channel once.
#[derive(Debug, Clone, Default)]
pub struct RoutingStats {
    pub channels: Vec<ChannelRoutingStats>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl RoutingStats {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn rows_read(&self) -> u64 {
        self.channels.iter().map(|c| c.rows_read).sum()
    }
}

struct PassOutcome {
    finished: FinishedContext,
    batches: Vec<OutgoingBatch>,
}

/// Routes change rows to target nodes, one channel pass at a time.
pub struct RoutingService {
    config: Arc<RoutingConfig>,
    registry: Arc<RouterRegistry>,
    index: TriggerRouterIndex,
    reader: RouteReader,
    tracker: DataGapTracker,
    fallback_router: RouterConfig,
}

impl RoutingService {
    /// Checks that every configured router type is registered.
    pub fn new(config: Arc<RoutingConfig>, registry: Arc<RouterRegistry>) -> Result<Self> {
        config.validate()?;
        if registry.resolve(DEFAULT_ROUTER_ID).is_none() {
            bail!("Router registry has no '{}' router", DEFAULT_ROUTER_ID);
        }
        for router in &config.routers {
            if registry.resolve(&router.router_type).is_none() {
                bail!(
                    "Router '{}' has unknown type '{}' (known types: {})",
                    router.router_id,
                    router.router_type,
                    registry.types().join(", ")
                );
            }
        }

        let fallback_router = RouterConfig::new(
            DEFAULT_ROUTER_ID,
            DEFAULT_ROUTER_ID,
            &config.identity.node_group_id,
            "",
        );
        Ok(Self {
            index: config.trigger_router_index(),
            reader: RouteReader::new(config.settings.max_gaps_in_query),
            tracker: DataGapTracker::new(&config.settings),
            fallback_router,
            config,
            registry,
        })
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Runs one pass over a channel inside a single transaction.
    ///
    /// On any error, or when `cancel` is raised mid-pass, nothing the pass
    /// wrote survives and the same rows are routed again next time.
    pub fn route_channel(
        &self,
        log: &mut ChangeLog,
        channel_id: &str,
        cancel: &AtomicBool,
    ) -> Result<ChannelRoutingStats> {
        let channel = self
            .config
            .channel(channel_id)
            .ok_or_else(|| anyhow!("Unknown channel '{}'", channel_id))?;
        let started = Instant::now();

        let tx = log.transaction()?;
        let outcome = match self.run_pass(&tx, channel, cancel) {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(channel = %channel_id, "Rollback failed: {}", rollback_err);
                }
                return Err(err);
            }
        };
        tx.commit()
            .with_context(|| format!("Failed to commit routing pass for channel {}", channel_id))?;

        self.dispatch_callbacks(&outcome);

        let mut stats = outcome.finished.stats;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        if stats.rows_read > 0 {
            info!(
                channel = %channel_id,
                rows = stats.rows_read,
                unrouted = stats.rows_unrouted,
                batches = stats.batch_ids.len(),
                duration_ms = stats.duration_ms,
                "Routed channel"
            );
        } else {
            debug!(channel = %channel_id, "Nothing to route");
        }
        Ok(stats)
    }

    /// Routes every enabled channel once, collecting per-channel failures.
    pub fn route_all(&self, log: &mut ChangeLog, cancel: &AtomicBool) -> RoutingStats {
        let started = Instant::now();
        let mut stats = RoutingStats::default();
        for channel in self.config.channels.iter().filter(|c| c.enabled) {
            match self.route_channel(log, &channel.channel_id, cancel) {
                Ok(channel_stats) => stats.channels.push(channel_stats),
                Err(err) => {
                    error!(channel = %channel.channel_id, "Routing failed: {:#}", err);
                    stats.errors.push(format!("{}: {:#}", channel.channel_id, err));
                }
            }
        }
        stats.duration_ms = started.elapsed().as_millis() as u64;
        stats
    }

    fn run_pass(
        &self,
        conn: &Connection,
        channel: &ChannelConfig,
        cancel: &AtomicBool,
    ) -> Result<PassOutcome> {
        let channel_id = channel.channel_id.as_str();
        let gaps = self.tracker.list_gaps(conn, channel_id)?;
        let tail = self.tracker.cover_log_tail(conn, channel_id, &gaps)?;
        let span = gap_span(&gaps);
        let topology = Arc::new(NodeTopology::load(conn)?);
        let mut ctx = ChannelRouterContext::new(conn, &self.config, channel, topology);

        ctx.set_phase(RoutingPhase::Reading);
        let mut prepared = self.reader.prepare(conn, channel_id, &gaps)?;
        let mut cursor = prepared.query()?;
        let max_rows = self.config.settings.max_rows_per_pass as u64;
        while ctx.stats().rows_read < max_rows {
            if cancel.load(Ordering::Relaxed) {
                ctx.set_phase(RoutingPhase::Rollback);
                bail!("Routing of channel {} cancelled", channel_id);
            }
            let Some(row) = cursor
                .next_row()
                .with_context(|| format!("Failed to read channel {} gaps {}", channel_id, span))?
            else {
                break;
            };
            ctx.set_phase(RoutingPhase::Routing);
            if let Err(err) = self.route_row(&mut ctx, &row) {
                ctx.set_phase(RoutingPhase::Error);
                return Err(err.context(format!(
                    "Failed to route data_id {} on channel {} (gaps {})",
                    row.data_id, channel_id, span
                )));
            }
        }
        let scan = cursor.stats();
        let observed = cursor.into_observed();
        drop(prepared);
        debug!(
            channel = %channel_id,
            scanned = scan.scanned,
            outside_gaps = scan.outside_gaps,
            other_channels = scan.other_channels,
            "Gap scan finished"
        );

        ctx.set_phase(RoutingPhase::Committing);
        let batches = ctx.batches_mut().persist(conn)?;
        let mut all_gaps = gaps;
        all_gaps.extend(tail);
        let update = self.tracker.advance(conn, channel_id, &all_gaps, &observed)?;

        let stats = ctx.stats_mut();
        stats.batch_ids = batches.iter().filter_map(|batch| batch.batch_id).collect();
        stats.gaps_removed = update.removed.len();
        stats.gaps_added = update.added.len();
        Ok(PassOutcome {
            finished: ctx.finish(),
            batches,
        })
    }

    fn route_row(&self, ctx: &mut ChannelRouterContext<'_>, row: &DataRow) -> Result<()> {
        ctx.begin_row(row.transaction_id.as_deref());
        let bytes = row.estimated_bytes();
        let initial_load = row.event_type == EventType::Reload;
        let mut routed = false;
        // One event per (node, router id); a batch may not hold the same pair twice.
        let mut appended: BTreeSet<(String, String)> = BTreeSet::new();

        if initial_load && row.node_list.is_some() {
            for node_id in row.target_nodes() {
                if appended.insert((node_id.clone(), RELOAD_ROUTER_ID.to_string())) {
                    ctx.append_event(&node_id, row.data_id, RELOAD_ROUTER_ID, bytes);
                }
                routed = true;
            }
        } else {
            let values = RowValues::from_row(row);
            for (router_config, candidates) in self.routers_for_row(ctx, row) {
                if !router_config.routes_event(row.event_type) {
                    continue;
                }
                let router = ctx.resolve_router(&self.registry, router_config)?;
                let data = DataMetaData::new(row, router_config, &values);
                let started = Instant::now();
                let result = router.route_to_nodes(ctx, &data, &candidates, initial_load);
                ctx.add_router_time(started.elapsed());

                match result {
                    Ok(Some(targets)) => {
                        let allowed: BTreeSet<&str> =
                            candidates.iter().map(|node| node.node_id.as_str()).collect();
                        for node_id in targets.iter().filter(|id| allowed.contains(id.as_str())) {
                            let key = (node_id.clone(), router_config.router_id.clone());
                            if appended.insert(key) {
                                ctx.append_event(node_id, row.data_id, &router_config.router_id, bytes);
                            }
                            routed = true;
                        }
                    }
                    Ok(None) => {}
                    Err(err) if err.is_recoverable() => ctx.report_router_error(&err, row.data_id),
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if routed {
            ctx.stats_mut().rows_routed += 1;
        } else {
            ctx.append_event(UNROUTED_NODE_ID, row.data_id, UNROUTED_ROUTER_ID, bytes);
            ctx.stats_mut().rows_unrouted += 1;
        }
        Ok(())
    }

    /// Routers for the row's table with their candidate nodes. Tables with no
    /// trigger-router fall back to the default router over every target group.
    fn routers_for_row(
        &self,
        ctx: &ChannelRouterContext<'_>,
        row: &DataRow,
    ) -> Vec<(&RouterConfig, Vec<Node>)> {
        let topology = ctx.topology();
        let identity = ctx.identity().node_id.as_str();
        let source = row.source_node_id.as_deref();

        let configured = self.index.routers_for(&row.channel_id, &row.table_name);
        if configured.is_empty() {
            let groups = self.config.target_groups();
            return vec![(
                &self.fallback_router,
                topology.candidates(&groups, identity, source),
            )];
        }
        configured
            .iter()
            .map(|router| {
                let groups = [router.target_node_group_id.as_str()];
                (router, topology.candidates(&groups, identity, source))
            })
            .collect()
    }

    fn dispatch_callbacks(&self, outcome: &PassOutcome) {
        let finished = &outcome.finished;
        for batch in &outcome.batches {
            let router_ids: BTreeSet<&str> = batch
                .events
                .iter()
                .map(|event| event.router_id.as_str())
                .collect();
            for router_id in router_ids {
                if let Some(router) = finished.routers_by_id.get(router_id) {
                    router.on_batch_complete(batch);
                }
            }
        }
        if !finished.events.is_empty() {
            for router in &finished.routers {
                router.on_context_committed(&finished.events);
            }
        }
    }
}

fn gap_span(gaps: &[DataGap]) -> String {
    match (gaps.first(), gaps.last()) {
        (Some(first), Some(last)) => format!("{}-{} ({} gaps)", first.start_id, last.end_id, gaps.len()),
        _ => "none".to_string(),
    }
}
