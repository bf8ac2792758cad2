//! Timeframe definitions and remote-key calendar helpers.
//!
//! A timeframe ties a bar granularity to its remote prefix and target
//! table. The upstream provider publishes one compressed CSV per trading
//! day under `<root>/<year>/<month>/<YYYY-MM-DD>.csv.gz`.

use chrono::{Datelike, Months, NaiveDate};

/// Suffix of every published flat file.
pub const FLAT_FILE_SUFFIX: &str = ".csv.gz";

/// A non-essential secondary index that is dropped during cold-start bulk
/// loads and recreated afterwards.
#[derive(Debug, Clone, Copy)]
pub struct SecondaryIndex {
    pub name: &'static str,
    /// Column list as it appears in `CREATE INDEX`.
    pub columns: &'static str,
}

/// A bar granularity with its own remote prefix and target table.
#[derive(Debug, Clone)]
pub struct Timeframe {
    pub name: &'static str,
    /// Remote prefix under which per-day files live.
    pub remote_root: &'static str,
    /// Target hypertable for upserted bars.
    pub table: &'static str,
    /// Number of files loaded per worker batch.
    pub batch_size: usize,
    /// Unique constraint columns for `ON CONFLICT`.
    pub conflict_target: &'static str,
    /// One known-mismatched source column, rewritten in the header line
    /// to the name the staging schema expects.
    pub header_rename: Option<(&'static str, &'static str)>,
    pub secondary_indexes: &'static [SecondaryIndex],
}

/// The fixed set of ingested timeframes.
pub fn default_timeframes() -> Vec<Timeframe> {
    vec![
        Timeframe {
            name: "1m",
            remote_root: "us_stocks_sip/minute_aggs_v1",
            table: "candles_1m",
            batch_size: 5,
            conflict_target: "(ticker, ts)",
            header_rename: Some(("window_start", "ts_ns")),
            secondary_indexes: &[SecondaryIndex {
                name: "candles_1m_ticker_ts_idx",
                columns: "(ticker, ts DESC)",
            }],
        },
        Timeframe {
            name: "1d",
            remote_root: "us_stocks_sip/day_aggs_v1",
            table: "candles_1d",
            batch_size: 30,
            conflict_target: "(ticker, ts)",
            header_rename: Some(("window_start", "ts_ns")),
            secondary_indexes: &[SecondaryIndex {
                name: "candles_1d_ticker_ts_idx",
                columns: "(ticker, ts DESC)",
            }],
        },
    ]
}

impl Timeframe {
    /// Monthly listing prefixes covering `[from, to]`, oldest first.
    ///
    /// Each prefix narrows the remote listing to one month of files:
    /// `<root>/<year>/<month>/`.
    pub fn month_prefixes(&self, from: NaiveDate, to: NaiveDate) -> Vec<String> {
        let mut prefixes = Vec::new();
        let mut cursor = from.with_day(1).expect("day 1 is always valid");
        while cursor <= to {
            prefixes.push(format!(
                "{}/{:04}/{:02}/",
                self.remote_root,
                cursor.year(),
                cursor.month()
            ));
            cursor = cursor + Months::new(1);
        }
        prefixes
    }
}

/// Parse the trading day out of a remote file key.
///
/// Keys look like `us_stocks_sip/minute_aggs_v1/2024/05/2024-05-06.csv.gz`;
/// the day is the file stem. Returns `None` for keys that do not follow
/// the published naming scheme.
pub fn parse_day_from_key(key: &str) -> Option<NaiveDate> {
    let filename = key.rsplit('/').next()?;
    let stem = filename.strip_suffix(FLAT_FILE_SUFFIX)?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn minute_tf() -> Timeframe {
        default_timeframes()
            .into_iter()
            .find(|tf| tf.name == "1m")
            .unwrap()
    }

    #[test]
    fn test_parse_day_from_key() {
        let day = parse_day_from_key("us_stocks_sip/minute_aggs_v1/2024/05/2024-05-06.csv.gz");
        assert_eq!(day, Some(date(2024, 5, 6)));
    }

    #[test]
    fn test_parse_day_rejects_other_suffixes() {
        assert_eq!(parse_day_from_key("x/2024/05/2024-05-06.csv"), None);
        assert_eq!(parse_day_from_key("x/2024/05/manifest.json"), None);
        assert_eq!(parse_day_from_key("x/2024/05/notadate.csv.gz"), None);
    }

    #[test]
    fn test_month_prefixes_single_month() {
        let tf = minute_tf();
        let prefixes = tf.month_prefixes(date(2024, 5, 15), date(2024, 5, 20));
        assert_eq!(prefixes, vec!["us_stocks_sip/minute_aggs_v1/2024/05/"]);
    }

    #[test]
    fn test_month_prefixes_cross_year() {
        let tf = minute_tf();
        let prefixes = tf.month_prefixes(date(2023, 11, 20), date(2024, 2, 3));
        assert_eq!(
            prefixes,
            vec![
                "us_stocks_sip/minute_aggs_v1/2023/11/",
                "us_stocks_sip/minute_aggs_v1/2023/12/",
                "us_stocks_sip/minute_aggs_v1/2024/01/",
                "us_stocks_sip/minute_aggs_v1/2024/02/",
            ]
        );
    }

    #[test]
    fn test_month_prefixes_empty_when_from_after_to() {
        let tf = minute_tf();
        let prefixes = tf.month_prefixes(date(2024, 6, 1), date(2024, 5, 1));
        assert!(prefixes.is_empty());
    }

    #[test]
    fn test_month_prefixes_from_end_of_month() {
        // from = Jan 31: cursor snaps to Jan 1 so January is included.
        let tf = minute_tf();
        let prefixes = tf.month_prefixes(date(2024, 1, 31), date(2024, 2, 1));
        assert_eq!(prefixes.len(), 2);
    }
}
