//! WebSocket push feed.

use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use common::ExponentialBackoff;
use model::{FeedAlertEvent, FeedAlertKind};

use crate::bridge::{self, ChannelFeed, LiveMessage, LiveSender};
use crate::wire::WireTick;

/// Configuration for a generic JSON WebSocket feed.
///
/// Each text frame must deserialize as [`WireTick`]. Unparseable frames are
/// counted and skipped, not fatal.
#[derive(Debug, Clone)]
pub struct PushFeedConfig {
    pub symbol: String,
    pub url: String,
    /// Reconnect attempts tolerated before the feed gives up.
    pub max_reconnects: u32,
    /// Engine-side heartbeat interval.
    pub heartbeat: Duration,
    pub channel_capacity: usize,
}

impl Default for PushFeedConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            url: String::new(),
            max_reconnects: 5,
            heartbeat: Duration::from_secs(30),
            channel_capacity: 1024,
        }
    }
}

/// Spawn the stream task on `handle` and return the engine-side feed.
pub fn spawn_push_feed(config: PushFeedConfig, handle: &Handle) -> ChannelFeed {
    let (sender, feed) = bridge::channel(config.channel_capacity, config.heartbeat);
    handle.spawn(stream_loop(config, sender));
    feed
}

async fn stream_loop(config: PushFeedConfig, sender: LiveSender) {
    let mut backoff =
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.1);
    let mut attempts: u32 = 0;

    loop {
        info!(symbol = %config.symbol, url = %config.url, attempt = attempts, "connecting push feed");
        match connect_async(&config.url).await {
            Ok((stream, _response)) => {
                if attempts > 0 {
                    let _ = sender.send(LiveMessage::Alert(FeedAlertEvent {
                        alert: FeedAlertKind::Reconnected { attempts },
                        symbol: Some(config.symbol.clone()),
                        detail: "websocket reconnected".to_string(),
                    }));
                }
                attempts = 0;
                backoff.reset();
                if !read_stream(stream, &config, &sender).await {
                    // Engine side went away; nothing left to do.
                    return;
                }
            }
            Err(err) => {
                warn!(symbol = %config.symbol, error = %err, "websocket connect failed");
            }
        }

        attempts += 1;
        if attempts > config.max_reconnects {
            let _ = sender.send(LiveMessage::Fatal(format!(
                "websocket reconnect budget exhausted after {attempts} attempts"
            )));
            return;
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

/// Read frames until the connection drops. Returns false when the engine
/// side of the bridge is gone.
async fn read_stream(
    mut stream: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
    config: &PushFeedConfig,
    sender: &LiveSender,
) -> bool {
    let mut seq: u64 = 0;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<WireTick>(&text) {
                Ok(tick) => {
                    let wire_seq = tick.seq;
                    let bar = tick.into_bar(&config.symbol, Utc::now());
                    seq += 1;
                    let message = LiveMessage::Tick {
                        bar,
                        seq: wire_seq.or(Some(seq)),
                    };
                    if sender.send(message).is_err() {
                        debug!("engine side dropped; stopping stream");
                        return false;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "unparseable frame skipped");
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Ok(Message::Close(_)) => {
                info!(symbol = %config.symbol, "websocket closed by server");
                return true;
            }
            Ok(Message::Frame(_)) => {}
            Err(err) => {
                warn!(symbol = %config.symbol, error = %err, "websocket read error");
                return true;
            }
        }
    }
    true
}
