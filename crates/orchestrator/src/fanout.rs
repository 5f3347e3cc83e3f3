//! Per-run event fan-out.
//!
//! One producer (the relay task), many subscribers. Events land in a
//! bounded ring so late joiners can catch up; live delivery gives each
//! subscriber a short grace window and then drops it rather than slow the
//! run. Per-subscriber order always matches the run's event sequence.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use model::{EventRecord, RunStatus};

/// One item on a subscriber stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(EventRecord),
    Progress { fraction: f64 },
    /// The run reached a terminal status; the stream ends after this.
    Terminal { status: RunStatus },
}

struct FanOutState {
    ring: VecDeque<EventRecord>,
    subscribers: Vec<mpsc::Sender<StreamItem>>,
    closed: Option<RunStatus>,
}

/// Fan-out hub for one run.
pub struct FanOut {
    ring_capacity: usize,
    subscriber_buffer: usize,
    send_deadline: Duration,
    state: Mutex<FanOutState>,
}

impl FanOut {
    pub fn new(ring_capacity: usize, subscriber_buffer: usize, send_deadline: Duration) -> Self {
        Self {
            ring_capacity,
            subscriber_buffer,
            send_deadline,
            state: Mutex::new(FanOutState {
                ring: VecDeque::with_capacity(ring_capacity),
                subscribers: Vec::new(),
                closed: None,
            }),
        }
    }

    /// Subscribe, receiving the ring contents first, then live items.
    /// If the run already terminated the stream carries the ring followed
    /// by the terminal marker.
    pub async fn subscribe(&self) -> mpsc::Receiver<StreamItem> {
        let mut state = self.state.lock().await;
        // The replay must fit regardless of the configured buffer.
        let capacity = self.subscriber_buffer + state.ring.len() + 1;
        let (sender, receiver) = mpsc::channel(capacity);
        for record in &state.ring {
            // Cannot fail: the channel was sized for the replay.
            let _ = sender.try_send(StreamItem::Event(record.clone()));
        }
        if let Some(status) = state.closed {
            let _ = sender.try_send(StreamItem::Terminal { status });
        } else {
            state.subscribers.push(sender);
        }
        receiver
    }

    /// Publish one item to the ring (events only) and every live
    /// subscriber. A subscriber that cannot accept the item within the
    /// send deadline is dropped.
    pub async fn publish(&self, item: StreamItem) {
        let mut state = self.state.lock().await;
        if let StreamItem::Event(record) = &item {
            if state.ring.len() == self.ring_capacity {
                state.ring.pop_front();
            }
            state.ring.push_back(record.clone());
        }

        let mut kept = Vec::with_capacity(state.subscribers.len());
        for sender in state.subscribers.drain(..) {
            match sender.send_timeout(item.clone(), self.send_deadline).await {
                Ok(()) => kept.push(sender),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!("subscriber too slow; dropped");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!("subscriber went away");
                }
            }
        }
        state.subscribers = kept;
    }

    /// Mark the run terminal and end every stream. Later subscribers get
    /// the ring followed by the terminal marker.
    pub async fn close(&self, status: RunStatus) {
        let mut state = self.state.lock().await;
        state.closed = Some(status);
        for sender in state.subscribers.drain(..) {
            let _ = sender
                .send_timeout(StreamItem::Terminal { status }, self.send_deadline)
                .await;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }
}
