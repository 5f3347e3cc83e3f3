//! Channel bridge between async producers and the synchronous kernel.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use tracing::warn;

use engine_core::{DataFeed, FeedError, FeedItem};
use model::{Bar, FeedAlertEvent, FeedAlertKind};

/// Messages a producer task sends toward the engine.
#[derive(Debug)]
pub enum LiveMessage {
    /// A tick, with the source's per-symbol sequence number when available.
    Tick { bar: Bar, seq: Option<u64> },
    /// Producer-side health information (reconnects and the like).
    Alert(FeedAlertEvent),
    /// Orderly end of stream.
    End,
    /// The producer gave up (e.g. reconnect budget exhausted).
    Fatal(String),
}

/// Producer half of the bridge. The channel is bounded, so a slow engine
/// back-pressures the producer instead of buffering without limit.
pub type LiveSender = SyncSender<LiveMessage>;

/// Engine half of the bridge: a `DataFeed` that blocks on the channel.
///
/// `next` waits up to the heartbeat interval for a message; if nothing
/// arrives a heartbeat alert is emitted instead of a bar. Sequence gaps per
/// symbol are detected here, emitting a gap alert before the offending bar.
pub struct ChannelFeed {
    receiver: Receiver<LiveMessage>,
    heartbeat: Duration,
    expected_seq: HashMap<String, u64>,
    queued: VecDeque<FeedItem>,
}

impl ChannelFeed {
    pub fn new(receiver: Receiver<LiveMessage>, heartbeat: Duration) -> Self {
        Self {
            receiver,
            heartbeat,
            expected_seq: HashMap::new(),
            queued: VecDeque::new(),
        }
    }

    fn check_gap(&mut self, bar: &Bar, seq: Option<u64>) -> Option<FeedAlertEvent> {
        let seq = seq?;
        let expected = self.expected_seq.insert(bar.symbol.clone(), seq + 1);
        match expected {
            Some(expected) if seq != expected => {
                warn!(symbol = %bar.symbol, expected, got = seq, "sequence gap detected");
                Some(FeedAlertEvent {
                    alert: FeedAlertKind::Gap { expected, got: seq },
                    symbol: Some(bar.symbol.clone()),
                    detail: format!("expected seq {expected}, got {seq}"),
                })
            }
            _ => None,
        }
    }
}

impl DataFeed for ChannelFeed {
    fn next(&mut self) -> Result<FeedItem, FeedError> {
        if let Some(item) = self.queued.pop_front() {
            return Ok(item);
        }
        match self.receiver.recv_timeout(self.heartbeat) {
            Ok(LiveMessage::Tick { bar, seq }) => {
                if let Some(gap) = self.check_gap(&bar, seq) {
                    self.queued.push_back(FeedItem::Bar(bar));
                    Ok(FeedItem::Alert(gap))
                } else {
                    Ok(FeedItem::Bar(bar))
                }
            }
            Ok(LiveMessage::Alert(alert)) => Ok(FeedItem::Alert(alert)),
            Ok(LiveMessage::End) => Ok(FeedItem::End),
            Ok(LiveMessage::Fatal(reason)) => Err(FeedError::Disconnected(reason)),
            Err(RecvTimeoutError::Timeout) => Ok(FeedItem::Alert(FeedAlertEvent {
                alert: FeedAlertKind::HeartbeatTimeout,
                symbol: None,
                detail: format!("no tick within {:?}", self.heartbeat),
            })),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FeedError::Disconnected("producer task ended".to_string()))
            }
        }
    }
}

/// Create a bounded bridge pair.
pub fn channel(capacity: usize, heartbeat: Duration) -> (LiveSender, ChannelFeed) {
    let (sender, receiver) = std::sync::mpsc::sync_channel(capacity);
    (sender, ChannelFeed::new(receiver, heartbeat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn bar(symbol: &str) -> Bar {
        Bar {
            symbol: symbol.into(),
            timestamp: Utc::now(),
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(0),
            amount: dec!(0),
        }
    }

    #[test]
    fn ticks_flow_through_in_order() {
        let (sender, mut feed) = channel(8, Duration::from_secs(1));
        sender
            .send(LiveMessage::Tick {
                bar: bar("SPY"),
                seq: Some(1),
            })
            .unwrap();
        sender.send(LiveMessage::End).unwrap();

        assert!(matches!(feed.next().unwrap(), FeedItem::Bar(_)));
        assert!(matches!(feed.next().unwrap(), FeedItem::End));
    }

    #[test]
    fn sequence_gap_emits_alert_before_bar() {
        let (sender, mut feed) = channel(8, Duration::from_secs(1));
        for seq in [1u64, 2, 5] {
            sender
                .send(LiveMessage::Tick {
                    bar: bar("SPY"),
                    seq: Some(seq),
                })
                .unwrap();
        }

        assert!(matches!(feed.next().unwrap(), FeedItem::Bar(_)));
        assert!(matches!(feed.next().unwrap(), FeedItem::Bar(_)));
        // Seq jumps 3 -> 5: alert first, then the bar.
        match feed.next().unwrap() {
            FeedItem::Alert(alert) => {
                assert!(matches!(
                    alert.alert,
                    FeedAlertKind::Gap {
                        expected: 3,
                        got: 5
                    }
                ));
            }
            other => panic!("expected gap alert, got {other:?}"),
        }
        assert!(matches!(feed.next().unwrap(), FeedItem::Bar(_)));
    }

    #[test]
    fn silence_produces_heartbeat_alert() {
        let (_sender, mut feed) = channel(8, Duration::from_millis(10));
        match feed.next().unwrap() {
            FeedItem::Alert(alert) => {
                assert!(matches!(alert.alert, FeedAlertKind::HeartbeatTimeout));
            }
            other => panic!("expected heartbeat alert, got {other:?}"),
        }
    }

    #[test]
    fn dropped_producer_is_fatal() {
        let (sender, mut feed) = channel(8, Duration::from_millis(10));
        drop(sender);
        assert!(feed.next().is_err());
    }
}
