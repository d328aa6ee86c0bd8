use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use runway_common::{RunStream, RunStreamEvent};
use tokio::sync::broadcast;

use super::EventWriter;

/// Per-run channel capacity; slow receivers lag instead of blocking writers.
const CHANNEL_CAPACITY: usize = 256;

/// Events kept per stream for subscribers that join mid-run.
const BACKLOG_LIMIT: usize = 512;

/// Closed run ids remembered so late subscribers are told the stream ended.
const CLOSED_LIMIT: usize = 4096;

struct StreamState {
    tx: broadcast::Sender<String>,
    backlog: VecDeque<String>,
}

impl StreamState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            backlog: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct Streams {
    open: HashMap<String, StreamState>,
    closed: HashSet<String>,
    closed_order: VecDeque<String>,
}

impl Streams {
    fn mark_closed(&mut self, run_id: &str) {
        if !self.closed.insert(run_id.to_string()) {
            return;
        }
        self.closed_order.push_back(run_id.to_string());
        if self.closed_order.len() > CLOSED_LIMIT
            && let Some(oldest) = self.closed_order.pop_front()
        {
            self.closed.remove(&oldest);
        }
    }

    fn reopen(&mut self, run_id: &str) {
        if self.closed.remove(run_id) {
            self.closed_order.retain(|id| id != run_id);
        }
    }
}

/// Result of subscribing to a run's events.
pub enum Subscription {
    /// Events written so far, and a receiver for everything after them.
    Open {
        backlog: Vec<String>,
        rx: broadcast::Receiver<String>,
    },
    /// The run's stream was already closed in this process.
    Closed,
}

/// In-process fan-out of run events, keyed by run id.
///
/// Each event is serialized once and delivered to every subscriber of the
/// run through a tokio broadcast channel. Closing a stream drops its sender,
/// which ends every subscriber's receive loop.
#[derive(Default)]
pub struct EventHub {
    streams: Mutex<Streams>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Streams>> {
        self.streams
            .lock()
            .map_err(|e| anyhow::anyhow!("Event hub lock poisoned: {}", e))
    }

    /// Subscribe to a run's events.
    ///
    /// A run with no stream yet gets one, so a subscriber that connects
    /// before the first event still sees it. Pair with [`release`](Self::release)
    /// when the subscriber goes away.
    pub fn subscribe(&self, run_id: &str) -> Result<Subscription> {
        let mut streams = self.lock()?;
        if streams.closed.contains(run_id) {
            return Ok(Subscription::Closed);
        }
        let state = streams
            .open
            .entry(run_id.to_string())
            .or_insert_with(StreamState::new);
        Ok(Subscription::Open {
            backlog: state.backlog.iter().cloned().collect(),
            rx: state.tx.subscribe(),
        })
    }

    /// Drop a stream nobody wrote to once its last subscriber has gone.
    pub fn release(&self, run_id: &str) {
        let Ok(mut streams) = self.lock() else {
            return;
        };
        let idle = streams
            .open
            .get(run_id)
            .is_some_and(|state| state.backlog.is_empty() && state.tx.receiver_count() == 0);
        if idle {
            streams.open.remove(run_id);
        }
    }

    /// Number of runs with an open stream.
    pub fn open_streams(&self) -> usize {
        self.lock().map(|s| s.open.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventWriter for EventHub {
    async fn write_run_event(&self, stream: &RunStream, event: &RunStreamEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize run event")?;
        let mut streams = self.lock()?;
        // A resumed run writes to its stream again after an earlier close.
        streams.reopen(&stream.run_id);
        let state = streams
            .open
            .entry(stream.run_id.clone())
            .or_insert_with(StreamState::new);
        if state.backlog.len() == BACKLOG_LIMIT {
            state.backlog.pop_front();
        }
        state.backlog.push_back(json.clone());
        // No subscribers is fine: send only fails when nobody is listening.
        let _ = state.tx.send(json);
        Ok(())
    }

    async fn close_run_stream(&self, stream: &RunStream) -> Result<()> {
        let mut streams = self.lock()?;
        streams.open.remove(&stream.run_id);
        streams.mark_closed(&stream.run_id);
        Ok(())
    }
}
