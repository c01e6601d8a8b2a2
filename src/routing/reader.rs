// ABOUTME: RouteReader - streams change rows that fall inside a channel's data gaps
// ABOUTME: Builds one range query per pass and records every id observed in a gap

use anyhow::{Context, Result};
use change_log::change::{CHANNEL_COLUMN_INDEX, DATA_COLUMNS};
use change_log::{DataGap, DataRow};
use rusqlite::{params_from_iter, Connection, Rows, Statement};
use tracing::debug;

/// Turns a gap list into the query that reads a channel's unrouted changes.
#[derive(Debug, Clone)]
pub struct RouteReader {
    max_gaps_in_query: usize,
}

impl RouteReader {
    pub fn new(max_gaps_in_query: usize) -> Self {
        Self {
            max_gaps_in_query: max_gaps_in_query.max(1),
        }
    }

    /// Id ranges named in the query.
    ///
    /// With more gaps than fit in one query the last named range is widened to
    /// the end of the highest gap, so rows between gaps may come back and are
    /// filtered out by the cursor.
    pub fn query_ranges(&self, gaps: &[DataGap]) -> Vec<(i64, i64)> {
        let mut ranges: Vec<(i64, i64)> = gaps
            .iter()
            .take(self.max_gaps_in_query)
            .map(|gap| (gap.start_id, gap.end_id))
            .collect();
        if gaps.len() > self.max_gaps_in_query {
            let highest = gaps.iter().map(|gap| gap.end_id).max();
            if let (Some(last), Some(highest)) = (ranges.last_mut(), highest) {
                last.1 = last.1.max(highest);
            }
        }
        ranges
    }

    /// Prepares the gap query for a channel; `gaps` must be ascending.
    pub fn prepare<'c>(
        &self,
        conn: &'c Connection,
        channel_id: &str,
        gaps: &[DataGap],
    ) -> Result<PreparedRead<'c>> {
        let ranges = self.query_ranges(gaps);
        let predicate = if ranges.is_empty() {
            "0".to_string()
        } else {
            (0..ranges.len())
                .map(|idx| format!("(data_id BETWEEN ?{} AND ?{})", idx * 2 + 1, idx * 2 + 2))
                .collect::<Vec<_>>()
                .join(" OR ")
        };
        let sql = format!(
            "SELECT {DATA_COLUMNS} FROM sym_data WHERE {predicate} ORDER BY data_id ASC"
        );
        let stmt = conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare gap query for channel {}", channel_id))?;
        debug!(
            channel = %channel_id,
            gaps = gaps.len(),
            ranges = ranges.len(),
            "Prepared gap query"
        );

        Ok(PreparedRead {
            stmt,
            ranges,
            gaps: gaps.to_vec(),
            channel_id: channel_id.to_string(),
        })
    }
}

/// A prepared gap query. Call [`PreparedRead::query`] to stream its rows.
pub struct PreparedRead<'c> {
    stmt: Statement<'c>,
    ranges: Vec<(i64, i64)>,
    gaps: Vec<DataGap>,
    channel_id: String,
}

impl<'c> PreparedRead<'c> {
    pub fn query(&mut self) -> Result<GapCursor<'_>> {
        let PreparedRead {
            stmt,
            ranges,
            gaps,
            channel_id,
        } = self;
        let rows = stmt.query(params_from_iter(
            ranges.iter().flat_map(|&(start, end)| [start, end]),
        ))?;
        Ok(GapCursor {
            rows,
            gaps: gaps.as_slice(),
            channel_id: channel_id.as_str(),
            current: 0,
            observed: Vec::new(),
            stats: CursorStats::default(),
        })
    }
}

/// What the cursor skipped, for debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorStats {
    pub scanned: u64,
    pub outside_gaps: u64,
    pub other_channels: u64,
}

/// Forward-only cursor over the rows of one channel that sit in a gap.
pub struct GapCursor<'s> {
    rows: Rows<'s>,
    gaps: &'s [DataGap],
    channel_id: &'s str,
    current: usize,
    observed: Vec<i64>,
    stats: CursorStats,
}

impl<'s> GapCursor<'s> {
    /// Next row of this channel in ascending id order.
    ///
    /// Rows of other channels are not returned, but their ids still count as
    /// observed so they stop being holes in this channel's gap list.
    pub fn next_row(&mut self) -> Result<Option<DataRow>> {
        while let Some(row) = self.rows.next()? {
            self.stats.scanned += 1;
            let data_id: i64 = row.get(0)?;

            while self
                .gaps
                .get(self.current)
                .is_some_and(|gap| data_id > gap.end_id)
            {
                self.current += 1;
            }
            let in_gap = self
                .gaps
                .get(self.current)
                .is_some_and(|gap| gap.contains(data_id));
            if !in_gap {
                self.stats.outside_gaps += 1;
                continue;
            }

            self.observed.push(data_id);
            let channel_id: String = row.get(CHANNEL_COLUMN_INDEX)?;
            if channel_id != self.channel_id {
                self.stats.other_channels += 1;
                continue;
            }
            return DataRow::from_sql_row(row).map(Some);
        }
        Ok(None)
    }

    pub fn stats(&self) -> CursorStats {
        self.stats
    }

    /// Ids seen inside gaps so far, ascending.
    pub fn observed(&self) -> &[i64] {
        &self.observed
    }

    pub fn into_observed(self) -> Vec<i64> {
        self.observed
    }
}
