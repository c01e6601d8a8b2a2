// ABOUTME: Outgoing batch accumulation - one open batch per target node during a pass
// ABOUTME: Applies the channel batch algorithm and persists closed batches with their data events

use anyhow::{Context, Result};
use change_log::{BatchStatus, BatchStore, DataEventRecord, NewOutgoingBatch, UNROUTED_NODE_ID};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

use crate::config::{BatchAlgorithm, ChannelConfig};

/// One change routed to one node by one router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    pub data_id: i64,
    pub router_id: String,
}

impl DataEvent {
    pub fn new(data_id: i64, router_id: &str) -> Self {
        Self {
            data_id,
            router_id: router_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Still accepting events.
    Open,
    /// Closed and waiting to be persisted with the pass.
    Ready,
    /// Written to the outgoing batch table.
    Persisted,
}

#[derive(Debug, Clone)]
pub struct OutgoingBatch {
    pub node_id: String,
    pub channel_id: String,
    /// Assigned when the batch is persisted.
    pub batch_id: Option<i64>,
    pub state: BatchState,
    pub events: Vec<DataEvent>,
    pub byte_count: u64,
    opened_at: Instant,
}

impl OutgoingBatch {
    fn open(node_id: &str, channel_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            batch_id: None,
            state: BatchState::Open,
            events: Vec::new(),
            byte_count: 0,
            opened_at: Instant::now(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.events.len()
    }

    pub fn first_data_id(&self) -> Option<i64> {
        self.events.iter().map(|event| event.data_id).min()
    }

    pub fn last_data_id(&self) -> Option<i64> {
        self.events.iter().map(|event| event.data_id).max()
    }

    /// The batch that records rows no node wanted.
    pub fn is_unrouted(&self) -> bool {
        self.node_id == UNROUTED_NODE_ID
    }

    pub fn status(&self) -> BatchStatus {
        if self.is_unrouted() {
            BatchStatus::Ok
        } else {
            BatchStatus::New
        }
    }

    fn reached_threshold(&self, channel: &ChannelConfig) -> bool {
        self.row_count() >= channel.max_batch_size
            || self.byte_count >= channel.max_batch_bytes
            || self.opened_at.elapsed() >= channel.max_batch_wait()
    }
}

/// Open batches of one channel, keyed by target node.
#[derive(Debug)]
pub struct BatchAccumulator {
    channel: ChannelConfig,
    open: BTreeMap<String, OutgoingBatch>,
    ready: Vec<OutgoingBatch>,
}

impl BatchAccumulator {
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            channel,
            open: BTreeMap::new(),
            ready: Vec::new(),
        }
    }

    /// Adds an event to the node's open batch, opening one if needed.
    ///
    /// Returns [`BatchState::Ready`] when a non-transactional channel closed
    /// the batch because it reached a threshold.
    pub fn append(&mut self, node_id: &str, event: DataEvent, bytes: u64) -> BatchState {
        let channel_id = &self.channel.channel_id;
        let batch = self
            .open
            .entry(node_id.to_string())
            .or_insert_with(|| OutgoingBatch::open(node_id, channel_id));
        batch.events.push(event);
        batch.byte_count += bytes;

        if self.channel.batch_algorithm == BatchAlgorithm::NonTransactional
            && batch.reached_threshold(&self.channel)
        {
            self.close(node_id);
            return BatchState::Ready;
        }
        BatchState::Open
    }

    /// Called between the last row of one source transaction and the first
    /// row of the next. Returns how many batches were closed.
    pub fn on_transaction_boundary(&mut self) -> usize {
        match self.channel.batch_algorithm {
            BatchAlgorithm::Transactional => self.close_all(),
            BatchAlgorithm::Default => {
                let full: Vec<String> = self
                    .open
                    .iter()
                    .filter(|(_, batch)| batch.reached_threshold(&self.channel))
                    .map(|(node_id, _)| node_id.clone())
                    .collect();
                for node_id in &full {
                    self.close(node_id);
                }
                full.len()
            }
            BatchAlgorithm::NonTransactional => 0,
        }
    }

    pub fn close_all(&mut self) -> usize {
        let closed = self.open.len();
        let open = std::mem::take(&mut self.open);
        for (_, batch) in open {
            self.mark_ready(batch);
        }
        closed
    }

    fn close(&mut self, node_id: &str) {
        if let Some(batch) = self.open.remove(node_id) {
            self.mark_ready(batch);
        }
    }

    fn mark_ready(&mut self, mut batch: OutgoingBatch) {
        debug!(
            channel = %batch.channel_id,
            node = %batch.node_id,
            rows = batch.row_count(),
            bytes = batch.byte_count,
            "Batch ready"
        );
        batch.state = BatchState::Ready;
        self.ready.push(batch);
    }

    pub fn open_batch(&self, node_id: &str) -> Option<&OutgoingBatch> {
        self.open.get(node_id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn ready(&self) -> &[OutgoingBatch] {
        &self.ready
    }

    /// Closes whatever is still open and writes every ready batch and its data
    /// events through `conn`, in the order the batches closed.
    pub fn persist(&mut self, conn: &Connection) -> Result<Vec<OutgoingBatch>> {
        self.close_all();
        let store = BatchStore::new(conn);
        let mut persisted = Vec::with_capacity(self.ready.len());

        for mut batch in std::mem::take(&mut self.ready) {
            let (Some(first_data_id), Some(last_data_id)) =
                (batch.first_data_id(), batch.last_data_id())
            else {
                continue;
            };
            let batch_id = store.insert_batch(&NewOutgoingBatch {
                node_id: batch.node_id.clone(),
                channel_id: batch.channel_id.clone(),
                status: batch.status(),
                data_row_count: batch.row_count() as u64,
                byte_count: batch.byte_count,
                first_data_id,
                last_data_id,
            })?;
            let events: Vec<DataEventRecord> = batch
                .events
                .iter()
                .map(|event| DataEventRecord {
                    data_id: event.data_id,
                    batch_id,
                    router_id: event.router_id.clone(),
                })
                .collect();
            store
                .insert_data_events(&events)
                .with_context(|| format!("Failed to write data events for batch {}", batch_id))?;

            batch.batch_id = Some(batch_id);
            batch.state = BatchState::Persisted;
            persisted.push(batch);
        }
        Ok(persisted)
    }
}
