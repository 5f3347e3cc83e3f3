//! Live data feeds.
//!
//! Two adapters produce bars from the outside world - a REST polling feed
//! and a WebSocket push feed - and both hand their output to the engine
//! through [`ChannelFeed`], which implements the kernel's synchronous
//! `DataFeed` pull contract. The producer side runs as a tokio task with
//! reconnect backoff; the engine side blocks on the channel with a
//! heartbeat timeout and detects per-symbol sequence gaps.

mod bridge;
mod polling;
mod push;
mod wire;

pub use bridge::{ChannelFeed, LiveMessage, LiveSender};
pub use polling::{spawn_polling_feed, PollingFeedConfig};
pub use push::{spawn_push_feed, PushFeedConfig};
pub use wire::WireTick;
