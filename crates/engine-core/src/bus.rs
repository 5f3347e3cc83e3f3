//! Synchronous FIFO event bus.
//!
//! The bus is the heart of the kernel's determinism: publishers append to a
//! single queue, `drain` dispatches strictly in FIFO order, and handlers
//! that publish further events have them dispatched within the same drain.
//! There are no threads and no interleaving; every handler observes a fully
//! consistent state between events.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use tracing::warn;

use model::{Event, EventKind, EventRecord};

use crate::error::{EngineError, StageError};

/// A pipeline stage registered on the bus.
///
/// Handlers receive the event plus a sink for publishing follow-up events.
/// The sink appends to the same queue the drain is working through, so
/// published events keep global FIFO order and inherit the triggering
/// event's virtual time and trace id.
pub trait Subscriber {
    fn on_event(&mut self, event: &EventRecord, sink: &mut EventSink<'_>)
        -> Result<(), StageError>;
}

/// Write-side handle given to subscribers during dispatch.
pub struct EventSink<'a> {
    queue: &'a mut VecDeque<EventRecord>,
    next_seq: &'a mut u64,
    symbol_seqs: &'a mut HashMap<String, u64>,
    run_id: &'a str,
    occurred_at: DateTime<Utc>,
    trace_id: &'a str,
}

impl EventSink<'_> {
    /// Publish a follow-up event. It inherits the occurred-at timestamp and
    /// trace id of the event currently being handled.
    pub fn publish(&mut self, event: Event) {
        enqueue(
            self.queue,
            self.next_seq,
            self.symbol_seqs,
            self.run_id,
            self.occurred_at,
            self.trace_id.to_string(),
            event,
        );
    }

    /// Virtual time of the event being handled.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Trace id of the event being handled.
    pub fn trace_id(&self) -> &str {
        self.trace_id
    }
}

fn enqueue(
    queue: &mut VecDeque<EventRecord>,
    next_seq: &mut u64,
    symbol_seqs: &mut HashMap<String, u64>,
    run_id: &str,
    occurred_at: DateTime<Utc>,
    trace_id: String,
    event: Event,
) {
    let seq = *next_seq;
    *next_seq += 1;

    let symbol_seq = event.symbol().map(|symbol| {
        let counter = symbol_seqs.entry(symbol.to_string()).or_insert(0);
        *counter += 1;
        *counter
    });

    queue.push_back(EventRecord {
        seq,
        kind: event.kind(),
        occurred_at,
        run_id: run_id.to_string(),
        symbol_seq,
        trace_id,
        payload: event,
    });
}

/// Single-threaded synchronous FIFO dispatcher.
pub struct EventBus {
    run_id: String,
    subscribers: HashMap<EventKind, Vec<Rc<RefCell<dyn Subscriber>>>>,
    queue: VecDeque<EventRecord>,
    next_seq: u64,
    next_trace: u64,
    symbol_seqs: HashMap<String, u64>,
    dispatching: bool,
    tap: Option<Box<dyn FnMut(&EventRecord)>>,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            subscribers: HashMap::new(),
            queue: VecDeque::new(),
            next_seq: 0,
            next_trace: 0,
            symbol_seqs: HashMap::new(),
            dispatching: false,
            tap: None,
        }
    }

    /// Register a handler for one event kind. Handlers for the same kind are
    /// invoked in registration order. Fails while a dispatch is active.
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        handler: Rc<RefCell<dyn Subscriber>>,
    ) -> Result<(), EngineError> {
        if self.dispatching {
            return Err(EngineError::SubscribeWhileDispatching);
        }
        self.subscribers.entry(kind).or_default().push(handler);
        Ok(())
    }

    /// Install an observer invoked for every dispatched event, before its
    /// subscribers. Used by the run worker to relay events upstream.
    pub fn set_tap(&mut self, tap: Box<dyn FnMut(&EventRecord)>) {
        self.tap = Some(tap);
    }

    /// Enqueue an event with a fresh trace id. The envelope sequence number
    /// is assigned here.
    pub fn publish(&mut self, occurred_at: DateTime<Utc>, event: Event) {
        let trace_id = format!("t-{}", self.next_trace);
        self.next_trace += 1;
        enqueue(
            &mut self.queue,
            &mut self.next_seq,
            &mut self.symbol_seqs,
            &self.run_id,
            occurred_at,
            trace_id,
            event,
        );
    }

    /// Number of events waiting for dispatch.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Dequeue events in FIFO order and invoke every handler registered for
    /// each event's kind. Handlers may publish further events; those are
    /// dispatched in the same call. Returns when the queue is empty.
    ///
    /// A handler failing with [`StageError::Recoverable`] is logged and
    /// skipped; [`StageError::Fatal`] aborts the drain. Nested calls fail
    /// with [`EngineError::BusReentrancy`].
    pub fn drain(&mut self) -> Result<(), EngineError> {
        if self.dispatching {
            return Err(EngineError::BusReentrancy);
        }
        self.dispatching = true;
        let result = self.drain_queue();
        self.dispatching = false;
        result
    }

    fn drain_queue(&mut self) -> Result<(), EngineError> {
        while let Some(record) = self.queue.pop_front() {
            if let Some(tap) = self.tap.as_mut() {
                tap(&record);
            }
            let Some(subs) = self.subscribers.get(&record.kind).cloned() else {
                continue;
            };
            for sub in subs {
                let mut sink = EventSink {
                    queue: &mut self.queue,
                    next_seq: &mut self.next_seq,
                    symbol_seqs: &mut self.symbol_seqs,
                    run_id: &self.run_id,
                    occurred_at: record.occurred_at,
                    trace_id: &record.trace_id,
                };
                match sub.borrow_mut().on_event(&record, &mut sink) {
                    Ok(()) => {}
                    Err(StageError::Recoverable(reason)) => {
                        warn!(
                            seq = record.seq,
                            kind = ?record.kind,
                            %reason,
                            "subscriber failed; event skipped"
                        );
                    }
                    Err(StageError::Fatal(err)) => return Err(err),
                }
            }
        }
        Ok(())
    }
}
