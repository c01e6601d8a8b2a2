use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// An inclusive range of change ids not yet confirmed routed for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataGap {
    pub start_id: i64,
    pub end_id: i64,
    pub create_time: DateTime<Utc>,
}

impl DataGap {
    pub fn new(start_id: i64, end_id: i64) -> Self {
        Self {
            start_id,
            end_id,
            create_time: Utc::now(),
        }
    }

    pub fn contains(&self, data_id: i64) -> bool {
        data_id >= self.start_id && data_id <= self.end_id
    }

    /// Same range, ignoring when the gap was recorded.
    pub fn same_range(&self, other: &DataGap) -> bool {
        self.start_id == other.start_id && self.end_id == other.end_id
    }
}

/// Reads and writes `sym_data_gap` on whatever connection or transaction it borrows.
pub struct GapStore<'a> {
    conn: &'a Connection,
}

impl<'a> GapStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn list(&self, channel_id: &str) -> Result<Vec<DataGap>> {
        let mut stmt = self.conn.prepare(
            "SELECT start_id, end_id, create_time
             FROM sym_data_gap
             WHERE channel_id = ?1
             ORDER BY start_id ASC",
        )?;
        let mut rows = stmt.query([channel_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DataGap {
                start_id: row.get(0)?,
                end_id: row.get(1)?,
                create_time: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn insert(&self, channel_id: &str, gap: &DataGap) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sym_data_gap(channel_id, start_id, end_id, create_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![channel_id, gap.start_id, gap.end_id, gap.create_time],
        )?;
        Ok(())
    }

    pub fn delete(&self, channel_id: &str, gap: &DataGap) -> Result<u64> {
        let deleted = self.conn.execute(
            "DELETE FROM sym_data_gap WHERE channel_id = ?1 AND start_id = ?2 AND end_id = ?3",
            params![channel_id, gap.start_id, gap.end_id],
        )?;
        Ok(deleted as u64)
    }

    /// Deletes `removed` then inserts `added`; callers run this inside the pass transaction.
    pub fn replace(&self, channel_id: &str, removed: &[DataGap], added: &[DataGap]) -> Result<()> {
        for gap in removed {
            self.delete(channel_id, gap)?;
        }
        for gap in added {
            self.insert(channel_id, gap)?;
        }
        Ok(())
    }
}
