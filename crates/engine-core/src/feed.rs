//! Historical data feeds.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use model::Bar;

use crate::error::FeedError;
use crate::traits::{DataFeed, FeedItem};

/// Deterministic feed over preloaded bars, sorted by timestamp.
pub struct InMemoryFeed {
    bars: VecDeque<Bar>,
    total: usize,
}

impl InMemoryFeed {
    pub fn new(mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|bar| bar.timestamp);
        let total = bars.len();
        Self {
            bars: bars.into(),
            total,
        }
    }
}

impl DataFeed for InMemoryFeed {
    fn next(&mut self) -> Result<FeedItem, FeedError> {
        Ok(match self.bars.pop_front() {
            Some(bar) => FeedItem::Bar(bar),
            None => FeedItem::End,
        })
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.total)
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: Decimal,
    #[serde(default)]
    amount: Decimal,
}

/// Daily/intraday bars from a CSV file with a
/// `timestamp,open,high,low,close,volume[,amount]` header.
///
/// The file is loaded eagerly and sorted; an optional inclusive time window
/// filters rows. Timestamps accept RFC 3339 or plain `YYYY-MM-DD` dates.
pub struct CsvBarFeed {
    inner: InMemoryFeed,
}

impl CsvBarFeed {
    pub fn load(
        path: impl AsRef<Path>,
        symbol: impl Into<String>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, FeedError> {
        let symbol = symbol.into();
        let mut reader = csv::Reader::from_path(path.as_ref()).map_err(csv_error)?;
        let mut bars = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            let row = row.map_err(csv_error)?;
            let timestamp = parse_timestamp(&row.timestamp)?;
            if start.is_some_and(|s| timestamp < s) || end.is_some_and(|e| timestamp > e) {
                continue;
            }
            bars.push(Bar {
                symbol: symbol.clone(),
                timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                amount: row.amount,
            });
        }
        Ok(Self {
            inner: InMemoryFeed::new(bars),
        })
    }
}

fn csv_error(err: csv::Error) -> FeedError {
    FeedError::Parse(err.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, FeedError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = raw.parse::<NaiveDate>() {
        return Ok(DateTime::from_naive_utc_and_offset(
            date.and_time(NaiveTime::MIN),
            Utc,
        ));
    }
    Err(FeedError::Parse(format!("unparseable timestamp: {raw}")))
}

impl DataFeed for CsvBarFeed {
    fn next(&mut self) -> Result<FeedItem, FeedError> {
        self.inner.next()
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn in_memory_feed_sorts_and_exhausts() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let bar = |timestamp| Bar {
            symbol: "SPY".into(),
            timestamp,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(0),
            amount: dec!(0),
        };
        let mut feed = InMemoryFeed::new(vec![bar(t1), bar(t0)]);
        assert_eq!(feed.len_hint(), Some(2));

        let FeedItem::Bar(first) = feed.next().unwrap() else {
            panic!("expected bar");
        };
        assert_eq!(first.timestamp, t0);
        let FeedItem::Bar(second) = feed.next().unwrap() else {
            panic!("expected bar");
        };
        assert_eq!(second.timestamp, t1);
        assert!(matches!(feed.next().unwrap(), FeedItem::End));
    }

    #[test]
    fn csv_feed_parses_dates_and_filters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-01-02,100,101,99,100.5,1000").unwrap();
        writeln!(file, "2024-01-03,100.5,102,100,101.5,1200").unwrap();
        writeln!(file, "2024-01-04,101.5,103,101,102.5,900").unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let mut feed = CsvBarFeed::load(file.path(), "SPY", Some(start), None).unwrap();
        assert_eq!(feed.len_hint(), Some(2));
        let FeedItem::Bar(first) = feed.next().unwrap() else {
            panic!("expected bar");
        };
        assert_eq!(first.close, dec!(101.5));
        assert_eq!(first.symbol, "SPY");
    }

    #[test]
    fn malformed_rows_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,open,high,low,close,volume").unwrap();
        writeln!(file, "not-a-date,1,1,1,1,1").unwrap();
        assert!(CsvBarFeed::load(file.path(), "SPY", None, None).is_err());
    }
}
