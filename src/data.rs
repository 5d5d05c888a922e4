//! Data loading
//!
//! Loads OHLCV bars from CSV files. Accepts `datetime,open,high,low,close,volume`
//! files with RFC3339 or `%Y-%m-%d %H:%M:%S` timestamps, and Binance kline
//! exports whose first column is an epoch timestamp in milliseconds.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::{Candle, Symbol};

/// Epoch values above this are milliseconds
const EPOCH_MS_CUTOFF: i64 = 100_000_000_000;

/// Load OHLCV data from a CSV file.
///
/// Rows that cannot be parsed are skipped with a warning. Parsed rows with
/// NaN or non-positive values are kept so the engine can count them as data
/// gaps. The result is sorted and de-duplicated by timestamp.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

    let mut candles = Vec::new();
    let mut skipped = 0usize;

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        match parse_record(&record) {
            Ok(candle) => candles.push(candle),
            // header row
            Err(_) if row_idx == 0 => {}
            Err(e) => {
                skipped += 1;
                warn!("{}: skipping row {}: {:#}", path.display(), row_idx + 1, e);
            }
        }
    }

    candles.sort_by_key(|c| c.datetime);
    let before = candles.len();
    candles.dedup_by_key(|c| c.datetime);
    if candles.len() < before {
        debug!(
            "{}: dropped {} duplicate timestamps",
            path.display(),
            before - candles.len()
        );
    }
    if skipped > 0 {
        warn!("{}: {} unparseable rows skipped", path.display(), skipped);
    }

    Ok(candles)
}

fn parse_record(record: &csv::StringRecord) -> Result<Candle> {
    let dt_str = record.get(0).context("Missing datetime column")?;
    let datetime = parse_datetime(dt_str)?;

    let field = |idx: usize, name: &str| -> Result<f64> {
        record
            .get(idx)
            .with_context(|| format!("Missing {} column", name))?
            .parse::<f64>()
            .with_context(|| format!("Failed to parse {}", name))
    };

    Ok(Candle::new_unchecked(
        datetime,
        field(1, "open")?,
        field(2, "high")?,
        field(3, "low")?,
        field(4, "close")?,
        field(5, "volume")?,
    ))
}

/// Parse RFC3339, `%Y-%m-%d %H:%M:%S` (UTC), or an epoch in seconds or ms
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(epoch) = s.parse::<i64>() {
        let dt = if epoch > EPOCH_MS_CUTOFF {
            DateTime::from_timestamp_millis(epoch)
        } else {
            DateTime::from_timestamp(epoch, 0)
        };
        return dt.with_context(|| format!("Epoch out of range: {}", s));
    }

    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

/// Keep bars between `start` and `end` (inclusive, `YYYY-MM-DD`)
pub fn filter_by_date(
    candles: Vec<Candle>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<Candle>> {
    let start = start
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("Invalid start date, expected YYYY-MM-DD")?;
    let end = end
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("Invalid end date, expected YYYY-MM-DD")?;

    Ok(candles
        .into_iter()
        .filter(|c| {
            let d = c.datetime.date_naive();
            start.map_or(true, |s| d >= s) && end.map_or(true, |e| d <= e)
        })
        .collect())
}

/// Load `{symbol}_{timeframe}.csv` for each symbol. Missing files are
/// skipped with a warning; at least one symbol must load.
pub fn load_multi_symbol(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    timeframe: &str,
) -> Result<BTreeMap<Symbol, Vec<Candle>>> {
    let mut data = BTreeMap::new();

    for symbol in symbols {
        let filename = format!("{}_{}.csv", symbol.as_str(), timeframe);
        let path = data_dir.as_ref().join(&filename);

        if !path.exists() {
            warn!("Data file not found: {}", path.display());
            continue;
        }

        let candles =
            load_csv(&path).with_context(|| format!("Failed to load data for {}", symbol))?;

        info!("Loaded {} candles for {}", candles.len(), symbol);
        data.insert(symbol.clone(), candles);
    }

    if data.is_empty() {
        anyhow::bail!("No data loaded for any symbol");
    }

    Ok(data)
}

/// Write bars in the canonical CSV layout
pub fn save_csv(path: impl AsRef<Path>, candles: &[Candle]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
    writer.write_record(["datetime", "open", "high", "low", "close", "volume"])?;
    for c in candles {
        writer.write_record(&[
            c.datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "martingale_sniper_{}_{}.csv",
            name,
            std::process::id()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_csv_sorts_dedups_and_skips_bad_rows() {
        let path = temp_file(
            "basic",
            "datetime,open,high,low,close,volume\n\
             2024-01-01 00:10:00,3,3,3,3,1\n\
             2024-01-01 00:00:00,1,1,1,1,1\n\
             garbage,row\n\
             2024-01-01 00:05:00,2,2,2,2,1\n\
             2024-01-01 00:05:00,2,2,2,2,1\n\
             2024-01-01 00:15:00,NaN,4,4,4,1\n",
        );
        let candles = load_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(candles.len(), 4);
        assert_eq!(candles[0].close, 1.0);
        assert_eq!(candles[2].close, 3.0);
        // parseable gap bar is kept for the engine to skip
        assert!(!candles[3].is_valid());
    }

    #[test]
    fn test_load_binance_export() {
        let path = temp_file(
            "binance",
            "1704067200000,42283.58,42554.57,42261.02,42475.23,1271.68,1704067499999,0,0,0,0,0\n\
             1704067500000,42475.23,42519.32,42431.65,42436.40,772.87,1704067799999,0,0,0,0,0\n",
        );
        let candles = load_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(candles.len(), 2);
        assert_eq!(
            candles[0].datetime,
            "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(candles[1].close, 42436.40);
    }

    #[test]
    fn test_filter_by_date() {
        let candles: Vec<Candle> = ["2024-01-01T12:00:00Z", "2024-01-02T12:00:00Z", "2024-01-03T12:00:00Z"]
            .iter()
            .map(|s| Candle::new_unchecked(s.parse().unwrap(), 1.0, 1.0, 1.0, 1.0, 1.0))
            .collect();

        let filtered = filter_by_date(candles.clone(), Some("2024-01-02"), None).unwrap();
        assert_eq!(filtered.len(), 2);
        let filtered = filter_by_date(candles.clone(), None, Some("2024-01-02")).unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filter_by_date(candles, Some("01/02/2024"), None).is_err());
    }

    #[test]
    fn test_parse_datetime_formats() {
        let expected = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(parse_datetime("2024-01-01 00:00:00").unwrap(), expected);
        assert_eq!(parse_datetime("2024-01-01T00:00:00+00:00").unwrap(), expected);
        assert_eq!(parse_datetime("1704067200").unwrap(), expected);
        assert_eq!(parse_datetime("1704067200000").unwrap(), expected);
        assert!(parse_datetime("yesterday").is_err());
    }
}
