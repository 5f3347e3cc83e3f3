//! REST polling feed.

use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use common::ExponentialBackoff;
use model::{FeedAlertEvent, FeedAlertKind};

use crate::bridge::{self, ChannelFeed, LiveMessage, LiveSender};
use crate::wire::WireTick;

/// Configuration for a generic JSON polling feed.
///
/// The endpoint must return a JSON object deserializable as [`WireTick`]
/// (at minimum a `price` field).
#[derive(Debug, Clone)]
pub struct PollingFeedConfig {
    pub symbol: String,
    pub url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Consecutive request failures tolerated before the feed gives up.
    pub max_retries: u32,
    /// Engine-side heartbeat interval.
    pub heartbeat: Duration,
    /// Stop after this many ticks (None = run until canceled).
    pub max_ticks: Option<u64>,
    pub channel_capacity: usize,
    /// Bearer token for authenticated endpoints.
    pub bearer_token: Option<String>,
}

impl Default for PollingFeedConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            url: String::new(),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            heartbeat: Duration::from_secs(30),
            max_ticks: None,
            channel_capacity: 1024,
            bearer_token: None,
        }
    }
}

/// Spawn the polling task on `handle` and return the engine-side feed.
pub fn spawn_polling_feed(config: PollingFeedConfig, handle: &Handle) -> ChannelFeed {
    let (sender, feed) = bridge::channel(config.channel_capacity, config.heartbeat);
    handle.spawn(poll_loop(config, sender));
    feed
}

async fn poll_loop(config: PollingFeedConfig, sender: LiveSender) {
    let client = match reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            let _ = sender.send(LiveMessage::Fatal(format!("http client: {err}")));
            return;
        }
    };

    let mut backoff = ExponentialBackoff::new(
        Duration::from_millis(500),
        Duration::from_secs(30),
        0.1,
    );
    let mut failures: u32 = 0;
    let mut ticks: u64 = 0;
    let mut seq: u64 = 0;

    info!(symbol = %config.symbol, url = %config.url, "polling feed started");
    loop {
        match fetch_tick(&client, &config.url, config.bearer_token.as_deref()).await {
            Ok(tick) => {
                if failures > 0 {
                    let attempts = failures;
                    failures = 0;
                    backoff.reset();
                    let _ = sender.send(LiveMessage::Alert(FeedAlertEvent {
                        alert: FeedAlertKind::Reconnected { attempts },
                        symbol: Some(config.symbol.clone()),
                        detail: "polling recovered".to_string(),
                    }));
                }
                seq += 1;
                let bar = tick.into_bar(&config.symbol, Utc::now());
                // A blocked send is back-pressure from the engine; wait it out.
                if sender
                    .send(LiveMessage::Tick {
                        bar,
                        seq: Some(seq),
                    })
                    .is_err()
                {
                    debug!("engine side dropped; stopping poll loop");
                    return;
                }
                ticks += 1;
                if config.max_ticks.is_some_and(|max| ticks >= max) {
                    let _ = sender.send(LiveMessage::End);
                    return;
                }
                tokio::time::sleep(config.poll_interval).await;
            }
            Err(err) => {
                failures += 1;
                warn!(symbol = %config.symbol, attempt = failures, error = %err, "poll failed");
                if failures > config.max_retries {
                    let _ = sender.send(LiveMessage::Fatal(format!(
                        "gave up after {failures} consecutive poll failures: {err}"
                    )));
                    return;
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

async fn fetch_tick(
    client: &reqwest::Client,
    url: &str,
    bearer_token: Option<&str>,
) -> Result<WireTick, reqwest::Error> {
    let mut request = client.get(url);
    if let Some(token) = bearer_token {
        request = request.bearer_auth(token);
    }
    request
        .send()
        .await?
        .error_for_status()?
        .json::<WireTick>()
        .await
}
