//! The run configuration document and the component registry.
//!
//! A submitted document is opaque JSON until it passes through here:
//! `parse` deserializes the known sections, `ValidationMode::Strict`
//! additionally rejects unknown keys, and the [`Registry`] resolves
//! `plugin` discriminators to constructors registered by the embedding
//! program before submit - there is no runtime code loading.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use engine_core::{DataFeed, Strategy};
use model::{Bar, Severity};

use crate::error::ConfigError;

/// How unknown keys are treated at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Unknown keys are ignored (forward compatibility).
    #[default]
    Forward,
    /// Unknown keys reject the document.
    Strict,
}

/// The parsed configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    pub data_feed: FeedConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub portfolio: PortfolioSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub risk: Vec<RiskSection>,
    #[serde(default)]
    pub reporters: Vec<ReporterSection>,
    #[serde(default)]
    pub notifications: Option<NotificationsSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedConfig {
    Inmemory {
        bars: Vec<Bar>,
    },
    LocalCsv {
        path: String,
        symbol: String,
        #[serde(default)]
        start: Option<chrono::DateTime<chrono::Utc>>,
        #[serde(default)]
        end: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Alias of `local_csv` kept for older documents.
    LocalFile {
        path: String,
        symbol: String,
        #[serde(default)]
        start: Option<chrono::DateTime<chrono::Utc>>,
        #[serde(default)]
        end: Option<chrono::DateTime<chrono::Utc>>,
    },
    Rest {
        symbol: String,
        url: String,
        #[serde(default = "default_poll_secs")]
        poll_interval_secs: f64,
        #[serde(default)]
        max_ticks: Option<u64>,
        #[serde(default = "default_heartbeat_secs")]
        heartbeat_secs: u64,
    },
    Websocket {
        symbol: String,
        url: String,
        #[serde(default = "default_reconnects")]
        max_reconnects: u32,
        #[serde(default = "default_heartbeat_secs")]
        heartbeat_secs: u64,
    },
    /// Alias of `websocket` for push-style sources.
    PushStream {
        symbol: String,
        url: String,
        #[serde(default = "default_reconnects")]
        max_reconnects: u32,
        #[serde(default = "default_heartbeat_secs")]
        heartbeat_secs: u64,
    },
    /// Authenticated polling endpoint.
    LiveApi {
        symbol: String,
        url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_poll_secs")]
        poll_interval_secs: f64,
        #[serde(default = "default_heartbeat_secs")]
        heartbeat_secs: u64,
    },
    Plugin {
        name: String,
        #[serde(default)]
        params: Value,
    },
}

fn default_poll_secs() -> f64 {
    1.0
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnects() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    MovingAverage {
        #[serde(default)]
        id: Option<String>,
        symbol: String,
        short_window: usize,
        long_window: usize,
        #[serde(default)]
        allow_short: bool,
    },
    Breakout {
        #[serde(default)]
        id: Option<String>,
        symbol: String,
        lookback: usize,
        #[serde(default)]
        allow_short: bool,
    },
    Plugin {
        name: String,
        #[serde(default)]
        params: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    #[default]
    FixedLot,
    TargetWeight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSection {
    #[serde(default = "default_portfolio_type")]
    pub r#type: String,
    #[serde(default = "default_lot_size")]
    pub lot_size: i64,
    #[serde(default = "default_cash")]
    pub initial_cash: Decimal,
    #[serde(default)]
    pub allow_short: bool,
    #[serde(default)]
    pub sizing: SizingMode,
    #[serde(default = "default_leverage")]
    pub max_leverage: Decimal,
}

fn default_portfolio_type() -> String {
    "naive".to_string()
}

fn default_lot_size() -> i64 {
    100
}

fn default_cash() -> Decimal {
    Decimal::from(100_000)
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

impl Default for PortfolioSection {
    fn default() -> Self {
        Self {
            r#type: default_portfolio_type(),
            lot_size: default_lot_size(),
            initial_cash: default_cash(),
            allow_short: false,
            sizing: SizingMode::default(),
            max_leverage: default_leverage(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillTimingConfig {
    CurrentClose,
    #[default]
    NextOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlippageConfig {
    #[default]
    None,
    Relative {
        value: Decimal,
    },
    Absolute {
        value: Decimal,
    },
    BasisPoints {
        value: Decimal,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_execution_type")]
    pub r#type: String,
    #[serde(default)]
    pub slippage: SlippageConfig,
    #[serde(default)]
    pub commission_per_share: Decimal,
    #[serde(default)]
    pub commission_rate: Decimal,
    #[serde(default)]
    pub fill_timing: FillTimingConfig,
    #[serde(default)]
    pub volume_cap: Option<Decimal>,
    #[serde(default)]
    pub staleness_threshold_secs: Option<i64>,
}

fn default_execution_type() -> String {
    "immediate".to_string()
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            r#type: default_execution_type(),
            slippage: SlippageConfig::default(),
            commission_per_share: Decimal::ZERO,
            commission_rate: Decimal::ZERO,
            fill_timing: FillTimingConfig::default(),
            volume_cap: None,
            staleness_threshold_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RiskSection {
    MaxPosition {
        limit: i64,
    },
    BuyingPower {
        #[serde(default)]
        fee_rate: Decimal,
    },
    Concentration {
        max_fraction: Decimal,
    },
    PriceBand {
        band: Decimal,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReporterSection {
    Equity {
        #[serde(default)]
        path: Option<String>,
    },
    Detailed {
        #[serde(default)]
        path: Option<String>,
    },
    Tradelog {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub min_level: Severity,
    #[serde(default = "default_dedupe_ttl")]
    pub dedupe_ttl_seconds: u64,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_true() -> bool {
    true
}

fn default_dedupe_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub r#type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub credentials_reference: Option<String>,
    pub destination: String,
    #[serde(default)]
    pub min_severity: Severity,
}

/// Constructor for a plugin strategy.
pub type StrategyCtor =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Strategy + Send>, ConfigError> + Send + Sync>;
/// Constructor for a plugin data feed.
pub type FeedCtor =
    Arc<dyn Fn(&Value) -> Result<Box<dyn DataFeed + Send>, ConfigError> + Send + Sync>;

/// Build-time registry mapping `plugin` discriminators to constructors.
///
/// Built-in component types are matched structurally by the worker; the
/// registry only resolves the `plugin` escape hatch.
#[derive(Default, Clone)]
pub struct Registry {
    strategies: HashMap<String, StrategyCtor>,
    feeds: HashMap<String, FeedCtor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_strategy(&mut self, name: impl Into<String>, ctor: StrategyCtor) {
        self.strategies.insert(name.into(), ctor);
    }

    pub fn register_feed(&mut self, name: impl Into<String>, ctor: FeedCtor) {
        self.feeds.insert(name.into(), ctor);
    }

    pub fn strategy(&self, name: &str) -> Option<&StrategyCtor> {
        self.strategies.get(name)
    }

    pub fn feed(&self, name: &str) -> Option<&FeedCtor> {
        self.feeds.get(name)
    }
}

impl RunConfig {
    /// Parse and validate a raw document.
    pub fn parse(value: &Value, mode: ValidationMode) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::NotAnObject);
        }
        if mode == ValidationMode::Strict {
            strict_check(value)?;
        }
        let config: RunConfig = serde_json::from_value(value.clone())
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        config.validate_semantics()?;
        Ok(config)
    }

    fn validate_semantics(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Section {
                section: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.portfolio.r#type != "naive" {
            return Err(ConfigError::UnknownComponent {
                category: "portfolio",
                name: self.portfolio.r#type.clone(),
            });
        }
        if self.portfolio.lot_size <= 0 {
            return Err(ConfigError::Section {
                section: "portfolio",
                reason: format!("lot_size must be positive, got {}", self.portfolio.lot_size),
            });
        }
        if self.portfolio.initial_cash <= Decimal::ZERO {
            return Err(ConfigError::Section {
                section: "portfolio",
                reason: "initial_cash must be positive".to_string(),
            });
        }
        if self.execution.r#type != "immediate" {
            return Err(ConfigError::UnknownComponent {
                category: "execution",
                name: self.execution.r#type.clone(),
            });
        }
        if self
            .execution
            .volume_cap
            .is_some_and(|cap| cap <= Decimal::ZERO)
        {
            return Err(ConfigError::Section {
                section: "execution",
                reason: "volume_cap must be positive".to_string(),
            });
        }
        for channel in self
            .notifications
            .iter()
            .flat_map(|section| section.channels.iter())
        {
            if channel.r#type != "webhook" {
                return Err(ConfigError::UnknownComponent {
                    category: "channel",
                    name: channel.r#type.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Known key sets for strict validation, per section and component type.
fn strict_check(value: &Value) -> Result<(), ConfigError> {
    let object = value.as_object().ok_or(ConfigError::NotAnObject)?;
    const TOP: &[&str] = &[
        "name",
        "data_feed",
        "strategies",
        "portfolio",
        "execution",
        "risk",
        "reporters",
        "notifications",
    ];
    check_keys("document", object, TOP)?;

    if let Some(feed) = object.get("data_feed") {
        strict_check_tagged("data_feed", feed, &[
            ("inmemory", &["bars"] as &[&str]),
            ("local_csv", &["path", "symbol", "start", "end"]),
            ("local_file", &["path", "symbol", "start", "end"]),
            ("rest", &["symbol", "url", "poll_interval_secs", "max_ticks", "heartbeat_secs"]),
            ("websocket", &["symbol", "url", "max_reconnects", "heartbeat_secs"]),
            ("push_stream", &["symbol", "url", "max_reconnects", "heartbeat_secs"]),
            ("live_api", &["symbol", "url", "token", "poll_interval_secs", "heartbeat_secs"]),
            ("plugin", &["name", "params"]),
        ])?;
    }
    if let Some(strategies) = object.get("strategies").and_then(Value::as_array) {
        for strategy in strategies {
            strict_check_tagged("strategies", strategy, &[
                ("moving_average", &["id", "symbol", "short_window", "long_window", "allow_short"] as &[&str]),
                ("breakout", &["id", "symbol", "lookback", "allow_short"]),
                ("plugin", &["name", "params"]),
            ])?;
        }
    }
    if let Some(portfolio) = object.get("portfolio").and_then(Value::as_object) {
        check_keys(
            "portfolio",
            portfolio,
            &["type", "lot_size", "initial_cash", "allow_short", "sizing", "max_leverage"],
        )?;
    }
    if let Some(execution) = object.get("execution").and_then(Value::as_object) {
        check_keys(
            "execution",
            execution,
            &[
                "type",
                "slippage",
                "commission_per_share",
                "commission_rate",
                "fill_timing",
                "volume_cap",
                "staleness_threshold_secs",
            ],
        )?;
    }
    if let Some(rules) = object.get("risk").and_then(Value::as_array) {
        for rule in rules {
            strict_check_tagged("risk", rule, &[
                ("max_position", &["limit"] as &[&str]),
                ("buying_power", &["fee_rate"]),
                ("concentration", &["max_fraction"]),
                ("price_band", &["band"]),
            ])?;
        }
    }
    if let Some(reporters) = object.get("reporters").and_then(Value::as_array) {
        for reporter in reporters {
            strict_check_tagged("reporters", reporter, &[
                ("equity", &["path"] as &[&str]),
                ("detailed", &["path"]),
                ("tradelog", &["path"]),
            ])?;
        }
    }
    if let Some(notifications) = object.get("notifications").and_then(Value::as_object) {
        check_keys(
            "notifications",
            notifications,
            &["enabled", "min_level", "dedupe_ttl_seconds", "channels"],
        )?;
        if let Some(channels) = notifications.get("channels").and_then(Value::as_array) {
            for channel in channels {
                if let Some(channel) = channel.as_object() {
                    check_keys(
                        "notifications.channels",
                        channel,
                        &["type", "name", "credentials_reference", "destination", "min_severity"],
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn check_keys(
    section: &str,
    object: &serde_json::Map<String, Value>,
    allowed: &[&str],
) -> Result<(), ConfigError> {
    for key in object.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(ConfigError::UnknownKey {
                section: section.to_string(),
                key: key.clone(),
            });
        }
    }
    Ok(())
}

fn strict_check_tagged(
    section: &str,
    value: &Value,
    variants: &[(&str, &[&str])],
) -> Result<(), ConfigError> {
    let Some(object) = value.as_object() else {
        return Err(ConfigError::Section {
            section: "document",
            reason: format!("{section} entries must be objects"),
        });
    };
    let Some(tag) = object.get("type").and_then(Value::as_str) else {
        // Let serde report the missing/invalid tag with full context.
        return Ok(());
    };
    let Some((_, allowed)) = variants.iter().find(|(name, _)| *name == tag) else {
        // Unknown tags are also serde's to report (plugins go through the
        // `plugin` variant, never a bare custom tag).
        return Ok(());
    };
    let mut with_tag: Vec<&str> = allowed.to_vec();
    with_tag.push("type");
    for key in object.keys() {
        if !with_tag.contains(&key.as_str()) {
            return Err(ConfigError::UnknownKey {
                section: format!("{section}.{tag}"),
                key: key.clone(),
            });
        }
    }
    Ok(())
}
