use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::change::{encode_columns, DataRow, NewDataRow, DATA_COLUMNS};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sym_data (
    data_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name      TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    row_data        TEXT,
    old_data        TEXT,
    channel_id      TEXT NOT NULL,
    transaction_id  TEXT,
    source_node_id  TEXT,
    node_list       TEXT,
    create_time     TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS sym_data_gap (
    channel_id   TEXT NOT NULL,
    start_id     INTEGER NOT NULL,
    end_id       INTEGER NOT NULL,
    create_time  TIMESTAMP NOT NULL,
    PRIMARY KEY (channel_id, start_id)
);

CREATE TABLE IF NOT EXISTS sym_outgoing_batch (
    batch_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id         TEXT NOT NULL,
    channel_id      TEXT NOT NULL,
    status          TEXT NOT NULL,
    data_row_count  INTEGER NOT NULL,
    byte_count      INTEGER NOT NULL,
    first_data_id   INTEGER NOT NULL,
    last_data_id    INTEGER NOT NULL,
    create_time     TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS sym_data_event (
    data_id    INTEGER NOT NULL,
    batch_id   INTEGER NOT NULL,
    router_id  TEXT NOT NULL,
    PRIMARY KEY (batch_id, data_id, router_id)
);

CREATE INDEX IF NOT EXISTS sym_data_event_data_id ON sym_data_event (data_id);

CREATE TABLE IF NOT EXISTS sym_node (
    node_id             TEXT PRIMARY KEY,
    node_group_id       TEXT NOT NULL,
    external_id         TEXT NOT NULL,
    sync_enabled        INTEGER NOT NULL DEFAULT 1,
    created_at_node_id  TEXT,
    protocol_version    INTEGER NOT NULL DEFAULT 2
);
"#;

/// Handle on the routing database: change rows, gaps, batches and the node registry.
pub struct ChangeLog {
    path: PathBuf,
    conn: Connection,
}

impl ChangeLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create change log directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open change log database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"wal")
            .context("failed to enable WAL for change log")?;
        conn.pragma_update(None, "synchronous", &"normal").ok();
        conn.busy_timeout(Duration::from_secs(30))
            .context("failed to set change log busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize change log schema")?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Appends a change row and returns its assigned id.
    pub fn append(&self, change: &NewDataRow) -> Result<i64> {
        insert_row(&self.conn, None, change)
    }

    /// Appends a change row with an explicit id, as a capture layer committing
    /// out of id order would.
    pub fn append_with_id(&self, data_id: i64, change: &NewDataRow) -> Result<i64> {
        insert_row(&self.conn, Some(data_id), change)
    }

    pub fn fetch_range(&self, start_id: i64, end_id: i64) -> Result<Vec<DataRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DATA_COLUMNS} FROM sym_data
             WHERE data_id BETWEEN ?1 AND ?2
             ORDER BY data_id ASC"
        ))?;
        let mut rows = stmt.query([start_id, end_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DataRow::from_sql_row(row)?);
        }
        Ok(out)
    }

    pub fn max_data_id(&self) -> Result<Option<i64>> {
        max_data_id(&self.conn)
    }

    /// Opens the write transaction that scopes one routing pass.
    ///
    /// The write lock is taken up front so concurrent passes queue on the
    /// busy timeout instead of failing when upgrading a read snapshot.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin routing transaction")
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn max_data_id(conn: &Connection) -> Result<Option<i64>> {
    conn.query_row("SELECT MAX(data_id) FROM sym_data", [], |row| row.get(0))
        .optional()
        .map(Option::flatten)
        .map_err(Into::into)
}

/// Counts committed change rows, of any channel, within an inclusive id range.
pub fn count_in_range(conn: &Connection, start_id: i64, end_id: i64) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sym_data WHERE data_id BETWEEN ?1 AND ?2",
        [start_id, end_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn insert_row(conn: &Connection, data_id: Option<i64>, change: &NewDataRow) -> Result<i64> {
    conn.execute(
        "INSERT INTO sym_data(data_id, table_name, event_type, row_data, old_data, channel_id,
                              transaction_id, source_node_id, node_list, create_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            data_id,
            change.table_name,
            change.event_type.as_str(),
            encode_columns(&change.row_data),
            change.old_data.as_ref().map(encode_columns),
            change.channel_id,
            change.transaction_id,
            change.source_node_id,
            change.node_list,
            chrono::Utc::now(),
        ],
    )
    .with_context(|| format!("failed to append change row for {}", change.table_name))?;
    Ok(conn.last_insert_rowid())
}
