// ABOUTME: DataGapTracker - per-channel bookkeeping of change ids not yet routed
// ABOUTME: Seeds, extends, splits and expires gaps inside the routing pass transaction

use anyhow::{Context, Result};
use change_log::log::{count_in_range, max_data_id};
use change_log::{DataGap, GapStore};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RouterSettings;

/// Gap rows to delete and insert when a pass commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapUpdate {
    pub removed: Vec<DataGap>,
    pub added: Vec<DataGap>,
}

impl GapUpdate {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Tracks which change ids of a channel still need routing.
///
/// Gaps are inclusive ranges. The highest gap is the open-ended trailing gap
/// that new changes land in; every other gap is a hole left between ids that
/// were already seen, waiting for a late commit to fill it.
#[derive(Debug, Clone)]
pub struct DataGapTracker {
    max_gap_size: i64,
    stale_gap_timeout: Duration,
}

impl DataGapTracker {
    pub fn new(settings: &RouterSettings) -> Self {
        Self {
            max_gap_size: settings.max_gap_size,
            stale_gap_timeout: settings.stale_gap_timeout(),
        }
    }

    /// Committed gaps of a channel in ascending order. A channel seen for the
    /// first time gets its initial trailing gap `[1, max_gap_size]`.
    pub fn list_gaps(&self, conn: &Connection, channel_id: &str) -> Result<Vec<DataGap>> {
        let store = GapStore::new(conn);
        let gaps = store
            .list(channel_id)
            .with_context(|| format!("Failed to load data gaps for channel {}", channel_id))?;
        if !gaps.is_empty() {
            return Ok(gaps);
        }

        let seed = DataGap::new(1, self.max_gap_size);
        store.insert(channel_id, &seed)?;
        info!(
            channel = %channel_id,
            end_id = seed.end_id,
            "Seeded initial data gap"
        );
        Ok(vec![seed])
    }

    /// Synthesizes a gap for change ids committed past the trailing gap.
    ///
    /// Returns the new gap, already persisted. It becomes the trailing gap and
    /// is read on the next pass; the previous trailing gap is then treated
    /// like any other hole.
    pub fn cover_log_tail(
        &self,
        conn: &Connection,
        channel_id: &str,
        gaps: &[DataGap],
    ) -> Result<Option<DataGap>> {
        let (Some(max_id), Some(last)) = (max_data_id(conn)?, gaps.last()) else {
            return Ok(None);
        };
        if max_id <= last.end_id {
            return Ok(None);
        }

        let synthesized = DataGap::new(last.end_id + 1, self.tail_end(max_id));
        warn!(
            channel = %channel_id,
            trailing_end = last.end_id,
            max_data_id = max_id,
            "Change log has rows beyond the last data gap, adding gap {}-{}",
            synthesized.start_id,
            synthesized.end_id
        );
        GapStore::new(conn).insert(channel_id, &synthesized)?;
        Ok(Some(synthesized))
    }

    /// Computes the gap changes implied by the ids observed while reading.
    ///
    /// `observed` must be ascending and every id must fall in one of `gaps`.
    pub fn detect(&self, gaps: &[DataGap], observed: &[i64], now: DateTime<Utc>) -> GapUpdate {
        let mut update = GapUpdate::default();
        let mut ids = observed.iter().copied().peekable();

        for (idx, gap) in gaps.iter().enumerate() {
            let is_trailing = idx + 1 == gaps.len();

            while ids.next_if(|id| *id < gap.start_id).is_some() {}
            let mut inside = Vec::new();
            while let Some(id) = ids.next_if(|id| *id <= gap.end_id) {
                inside.push(id);
            }
            let Some(&highest) = inside.last() else {
                continue;
            };

            update.removed.push(gap.clone());

            // Holes under the trailing gap are new; holes in an older gap keep its age.
            let created = if is_trailing { now } else { gap.create_time };
            let mut next = gap.start_id;
            for id in &inside {
                if *id > next {
                    update.added.push(gap_at(next, id - 1, created));
                }
                next = id.saturating_add(1);
            }

            if is_trailing {
                // Never pull the tail below ids the old gap still covered.
                let end_id = self.tail_end(next).max(gap.end_id);
                update.added.push(gap_at(next, end_id, now));
            } else if next <= gap.end_id {
                update.added.push(gap_at(next, gap.end_id, created));
            }
            debug!(
                start_id = gap.start_id,
                end_id = gap.end_id,
                observed = inside.len(),
                highest,
                "Data gap narrowed"
            );
        }

        update
    }

    /// Applies detection and stale-gap expiry, writing through `conn`.
    pub fn advance(
        &self,
        conn: &Connection,
        channel_id: &str,
        gaps: &[DataGap],
        observed: &[i64],
    ) -> Result<GapUpdate> {
        let now = Utc::now();
        let mut update = self.detect(gaps, observed, now);
        self.expire_stale(conn, channel_id, gaps, now, &mut update)?;

        GapStore::new(conn)
            .replace(channel_id, &update.removed, &update.added)
            .with_context(|| format!("Failed to update data gaps for channel {}", channel_id))?;
        Ok(update)
    }

    /// Last id of a `max_gap_size` wide gap starting at `start_id`, clamped at `i64::MAX`.
    fn tail_end(&self, start_id: i64) -> i64 {
        start_id.saturating_add(self.max_gap_size - 1)
    }

    /// Drops non-trailing gaps that have outlived the timeout with no rows in them.
    fn expire_stale(
        &self,
        conn: &Connection,
        channel_id: &str,
        gaps: &[DataGap],
        now: DateTime<Utc>,
        update: &mut GapUpdate,
    ) -> Result<()> {
        let Some((_, holes)) = gaps.split_last() else {
            return Ok(());
        };
        for gap in holes {
            if update.removed.iter().any(|removed| removed.same_range(gap)) {
                continue;
            }
            let expired = now
                .signed_duration_since(gap.create_time)
                .to_std()
                .map_or(false, |age| age >= self.stale_gap_timeout);
            if !expired || count_in_range(conn, gap.start_id, gap.end_id)? > 0 {
                continue;
            }
            info!(
                channel = %channel_id,
                start_id = gap.start_id,
                end_id = gap.end_id,
                "Expiring stale data gap"
            );
            update.removed.push(gap.clone());
        }
        Ok(())
    }
}

fn gap_at(start_id: i64, end_id: i64, create_time: DateTime<Utc>) -> DataGap {
    DataGap {
        start_id,
        end_id,
        create_time,
    }
}
