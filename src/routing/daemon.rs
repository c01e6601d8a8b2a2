// ABOUTME: RoutingDaemon - runs routing cycles over all channels at a fixed interval
// ABOUTME: Channels route in parallel on blocking tasks, each guarded by the channel lock

use anyhow::{Context, Result};
use change_log::ChangeLog;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use super::context::ChannelRoutingStats;
use super::lock::ChannelLock;
use super::service::RoutingService;
use crate::config::RouterSettings;

/// Configuration for the RoutingDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between routing cycles
    pub poll_interval: Duration,
    /// Routing database shared with the capture layer
    pub db_path: PathBuf,
    /// Channels to route (empty = every enabled channel)
    pub channels: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: RouterSettings::default().poll_interval(),
            db_path: PathBuf::from(".data-router/routing.db"),
            channels: Vec::new(),
        }
    }
}

/// Statistics from one routing cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub channels_routed: usize,
    pub channels_skipped: usize,
    pub rows_routed: u64,
    pub batches_created: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleStats {
    /// Check if the cycle completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

enum ChannelOutcome {
    Routed(ChannelRoutingStats),
    Skipped,
}

/// RoutingDaemon drives the routing service continuously.
///
/// Every cycle starts one pass per channel. A channel whose lock is taken,
/// by a pass still running from an earlier cycle or by another engine, is
/// skipped until the next cycle.
pub struct RoutingDaemon {
    service: Arc<RoutingService>,
    lock: Arc<dyn ChannelLock>,
    config: DaemonConfig,
}

impl RoutingDaemon {
    pub fn new(service: Arc<RoutingService>, lock: Arc<dyn ChannelLock>, config: DaemonConfig) -> Self {
        Self {
            service,
            lock,
            config,
        }
    }

    fn channels(&self) -> Vec<String> {
        if !self.config.channels.is_empty() {
            return self.config.channels.clone();
        }
        self.service
            .config()
            .channels
            .iter()
            .filter(|channel| channel.enabled)
            .map(|channel| channel.channel_id.clone())
            .collect()
    }

    /// Run one routing pass for every channel, in parallel.
    ///
    /// Raising `cancel` makes passes still in flight roll back.
    pub async fn run_cycle(&self, cancel: Arc<AtomicBool>) -> Result<CycleStats> {
        let start = std::time::Instant::now();
        let mut stats = CycleStats::default();

        let tasks = self.channels().into_iter().map(|channel_id| {
            let service = Arc::clone(&self.service);
            let lock = Arc::clone(&self.lock);
            let db_path = self.config.db_path.clone();
            let cancel = Arc::clone(&cancel);
            tokio::task::spawn_blocking(move || {
                let outcome = route_locked(&service, lock.as_ref(), &db_path, &channel_id, &cancel);
                (channel_id, outcome)
            })
        });

        for joined in join_all(tasks).await {
            let (channel_id, outcome) = joined.context("Routing task panicked")?;
            match outcome {
                Ok(ChannelOutcome::Routed(channel_stats)) => {
                    stats.channels_routed += 1;
                    stats.rows_routed += channel_stats.rows_read;
                    stats.batches_created += channel_stats.batch_ids.len();
                }
                Ok(ChannelOutcome::Skipped) => {
                    tracing::debug!("Channel {} is locked by another pass, skipping", channel_id);
                    stats.channels_skipped += 1;
                }
                Err(e) => {
                    // Log with :? to show full error chain including root cause
                    tracing::error!("Failed to route channel {}: {:?}", channel_id, e);
                    stats
                        .errors
                        .push(format!("Failed to route channel {}: {}", channel_id, e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Run the daemon continuously until stopped.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut poll_interval = interval(self.config.poll_interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting RoutingDaemon with poll_interval={:?}, db={:?}",
            self.config.poll_interval,
            self.config.db_path
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping RoutingDaemon");
                    break;
                }
                _ = poll_interval.tick() => {
                    cycles += 1;
                    tracing::debug!("Starting routing cycle {}", cycles);
                    let cancel = Arc::new(AtomicBool::new(false));

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during routing cycle, rolling back");
                            cancel.store(true, Ordering::Relaxed);
                            break;
                        }
                        result = self.run_cycle(Arc::clone(&cancel)) => {
                            match result {
                                Ok(stats) => {
                                    if stats.rows_routed > 0 {
                                        tracing::info!(
                                            "Routing cycle {} completed: {} channels, {} rows, {} batches in {}ms",
                                            cycles,
                                            stats.channels_routed,
                                            stats.rows_routed,
                                            stats.batches_created,
                                            stats.duration_ms
                                        );
                                    }
                                    if !stats.errors.is_empty() {
                                        tracing::warn!("Routing cycle had {} errors", stats.errors.len());
                                    }
                                }
                                Err(e) => {
                                    tracing::error!("Routing cycle {} failed: {}", cycles, e);
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn route_locked(
    service: &RoutingService,
    lock: &dyn ChannelLock,
    db_path: &std::path::Path,
    channel_id: &str,
    cancel: &AtomicBool,
) -> Result<ChannelOutcome> {
    // Skip busy channels without opening the database.
    if lock.is_held(channel_id) {
        return Ok(ChannelOutcome::Skipped);
    }
    let Some(_guard) = lock.try_acquire(channel_id) else {
        return Ok(ChannelOutcome::Skipped);
    };
    let mut log = ChangeLog::open(db_path)
        .with_context(|| format!("Failed to open routing database {:?}", db_path))?;
    let stats = service.route_channel(&mut log, channel_id, cancel)?;
    Ok(ChannelOutcome::Routed(stats))
}
