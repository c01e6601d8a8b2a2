use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Ready for extraction.
    New,
    /// Nothing to send; used for the unrouted batch.
    Ok,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Ok => "OK",
        }
    }

    fn from_code(value: &str) -> Result<Self> {
        match value {
            "NE" => Ok(BatchStatus::New),
            "OK" => Ok(BatchStatus::Ok),
            other => Err(anyhow!("unknown batch status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutgoingBatch {
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    pub data_row_count: u64,
    pub byte_count: u64,
    pub first_data_id: i64,
    pub last_data_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingBatchRecord {
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    pub data_row_count: u64,
    pub byte_count: u64,
    pub first_data_id: i64,
    pub last_data_id: i64,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataEventRecord {
    pub data_id: i64,
    pub batch_id: i64,
    pub router_id: String,
}

pub struct BatchStore<'a> {
    conn: &'a Connection,
}

impl<'a> BatchStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Inserts a batch header and returns the allocated batch id.
    pub fn insert_batch(&self, batch: &NewOutgoingBatch) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sym_outgoing_batch(node_id, channel_id, status, data_row_count,
                                                byte_count, first_data_id, last_data_id, create_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    batch.node_id,
                    batch.channel_id,
                    batch.status.as_str(),
                    batch.data_row_count as i64,
                    batch.byte_count as i64,
                    batch.first_data_id,
                    batch.last_data_id,
                    Utc::now(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert outgoing batch for node {} on channel {}",
                    batch.node_id, batch.channel_id
                )
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_data_events(&self, events: &[DataEventRecord]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO sym_data_event(data_id, batch_id, router_id) VALUES (?1, ?2, ?3)",
        )?;
        for event in events {
            stmt.execute(params![event.data_id, event.batch_id, event.router_id])
                .with_context(|| {
                    format!(
                        "failed to insert data event {} into batch {}",
                        event.data_id, event.batch_id
                    )
                })?;
        }
        Ok(())
    }

    pub fn list_batches(&self, channel_id: &str) -> Result<Vec<OutgoingBatchRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, node_id, channel_id, status, data_row_count, byte_count,
                    first_data_id, last_data_id, create_time
             FROM sym_outgoing_batch
             WHERE channel_id = ?1
             ORDER BY batch_id ASC",
        )?;
        let mut rows = stmt.query([channel_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(3)?;
            let data_row_count: i64 = row.get(4)?;
            let byte_count: i64 = row.get(5)?;
            out.push(OutgoingBatchRecord {
                batch_id: row.get(0)?,
                node_id: row.get(1)?,
                channel_id: row.get(2)?,
                status: BatchStatus::from_code(&status)?,
                data_row_count: data_row_count as u64,
                byte_count: byte_count as u64,
                first_data_id: row.get(6)?,
                last_data_id: row.get(7)?,
                create_time: row.get(8)?,
            });
        }
        Ok(out)
    }

    /// Events of one batch in the order they were routed.
    pub fn list_data_events(&self, batch_id: i64) -> Result<Vec<DataEventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT data_id, batch_id, router_id
             FROM sym_data_event
             WHERE batch_id = ?1
             ORDER BY data_id ASC, router_id ASC",
        )?;
        let mut rows = stmt.query([batch_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DataEventRecord {
                data_id: row.get(0)?,
                batch_id: row.get(1)?,
                router_id: row.get(2)?,
            });
        }
        Ok(out)
    }

    /// Every data event, ordered by change id then batch.
    pub fn all_data_events(&self) -> Result<Vec<DataEventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT data_id, batch_id, router_id
             FROM sym_data_event
             ORDER BY data_id ASC, batch_id ASC, router_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DataEventRecord {
                data_id: row.get(0)?,
                batch_id: row.get(1)?,
                router_id: row.get(2)?,
            });
        }
        Ok(out)
    }
}
