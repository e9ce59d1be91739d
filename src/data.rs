//! Transaction events, time units, and CSV event loading using Polars

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;
use tracing::{debug, info};

use crate::error::{ClvError, Result};

/// A single purchase as recorded in the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub customer_id: String,
    /// Revenue of the purchase, strictly positive.
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

impl TransactionEvent {
    /// Build a validated event.
    pub fn new(
        customer_id: impl Into<String>,
        amount: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let event = Self {
            customer_id: customer_id.into(),
            amount,
            timestamp,
        };
        event.validate()?;
        Ok(event)
    }

    /// Check the event is usable for aggregation.
    pub fn validate(&self) -> Result<()> {
        if self.customer_id.trim().is_empty() {
            return Err(ClvError::invalid(format!(
                "event at {} has no customer identifier",
                self.timestamp
            )));
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ClvError::invalid(format!(
                "customer {} has non-positive amount {} at {}",
                self.customer_id, self.amount, self.timestamp
            )));
        }
        Ok(())
    }
}

/// Unit in which elapsed times (`t_x`, `T_cal`, horizons) are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TimeUnit {
    Hours,
    Days,
    #[default]
    Weeks,
}

impl TimeUnit {
    fn millis(self) -> f64 {
        match self {
            TimeUnit::Hours => 3_600_000.0,
            TimeUnit::Days => 86_400_000.0,
            TimeUnit::Weeks => 604_800_000.0,
        }
    }

    /// Elapsed time from `from` to `to` in this unit.
    pub fn between(self, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        (to - from).num_milliseconds() as f64 / self.millis()
    }
}

/// Column names of an event CSV.
#[derive(Debug, Clone)]
pub struct EventColumns {
    pub customer_id: String,
    pub amount: String,
    pub timestamp: String,
}

impl Default for EventColumns {
    fn default() -> Self {
        Self {
            customer_id: "customer_id".to_string(),
            amount: "amount".to_string(),
            timestamp: "timestamp".to_string(),
        }
    }
}

/// Load a transaction log from CSV.
///
/// Rows with a missing customer id, a missing timestamp, or a non-positive or
/// unparseable amount are dropped here, before aggregation ever sees them.
///
/// # Arguments
/// * `file_path` - Path to the CSV file
/// * `columns` - Names of the id, amount, and timestamp columns
pub fn load_events(
    file_path: &str,
    columns: &EventColumns,
) -> anyhow::Result<Vec<TransactionEvent>> {
    // Read everything as strings and convert explicitly
    let raw = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(PathBuf::from(file_path)))?
        .finish()
        .with_context(|| format!("failed to read transaction log {file_path}"))?;
    let total_rows = raw.height();

    let df = raw
        .lazy()
        .select([
            col(columns.customer_id.as_str()).alias("customer_id"),
            col(columns.amount.as_str())
                .cast(DataType::Float64)
                .alias("amount"),
            col(columns.timestamp.as_str()).alias("timestamp"),
        ])
        .filter(
            col("amount")
                .gt(lit(0.0))
                .and(col("customer_id").is_not_null())
                .and(col("timestamp").is_not_null()),
        )
        .collect()?;

    debug!(total_rows, kept = df.height(), "filtered transaction log");

    let ids = df.column("customer_id")?.as_materialized_series().str()?;
    let amounts = df.column("amount")?.as_materialized_series().f64()?;
    let timestamps = df.column("timestamp")?.as_materialized_series().str()?;

    let mut events = Vec::with_capacity(df.height());
    for (row, ((id, amount), ts)) in ids
        .into_iter()
        .zip(amounts.into_iter())
        .zip(timestamps.into_iter())
        .enumerate()
    {
        let (Some(id), Some(amount), Some(ts)) = (id, amount, ts) else {
            continue;
        };
        let id = id.trim();
        if id.is_empty() {
            continue;
        }
        let timestamp = parse_timestamp(ts)
            .with_context(|| format!("row {row}: unparseable timestamp {ts:?}"))?;
        events.push(TransactionEvent {
            customer_id: id.to_string(),
            amount,
            timestamp,
        });
    }

    info!(
        events = events.len(),
        dropped = total_rows - events.len(),
        "loaded transaction log"
    );
    Ok(events)
}

/// Parse an RFC 3339 timestamp, a naive `YYYY-MM-DD[ T]HH:MM:SS` (taken as UTC),
/// or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .context("invalid calendar date")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "customer_id,amount,timestamp").unwrap();
        writeln!(file, "17850,15.30,2010-12-01T08:26:00Z").unwrap();
        writeln!(file, "17850,20.34,2010-12-08 08:26:00").unwrap();
        writeln!(file, "13047,22.00,2010-12-01").unwrap();
        writeln!(file, "13047,-5.00,2010-12-02").unwrap();
        writeln!(file, ",11.10,2010-12-03").unwrap();
        writeln!(file, "12583,0,2010-12-04").unwrap();
        file
    }

    #[test]
    fn test_load_events_filters_invalid_rows() {
        let file = create_test_csv();
        let events = load_events(file.path().to_str().unwrap(), &EventColumns::default()).unwrap();

        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.amount > 0.0));
        assert_eq!(events[0].customer_id, "17850");
        assert_eq!(
            events[1].timestamp,
            Utc.with_ymd_and_hms(2010, 12, 8, 8, 26, 0).unwrap()
        );
    }

    #[test]
    fn test_load_events_custom_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "CustomerID,Revenue,InvoiceDate,Country").unwrap();
        writeln!(file, "1,3.5,2011-01-01,UK").unwrap();
        let columns = EventColumns {
            customer_id: "CustomerID".into(),
            amount: "Revenue".into(),
            timestamp: "InvoiceDate".into(),
        };
        let events = load_events(file.path().to_str().unwrap(), &columns).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount, 3.5);
    }

    #[test]
    fn test_event_validation() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert!(TransactionEvent::new("a", 1.0, ts).is_ok());
        assert!(matches!(
            TransactionEvent::new("a", 0.0, ts),
            Err(ClvError::InvalidInput(_))
        ));
        assert!(matches!(
            TransactionEvent::new("  ", 5.0, ts),
            Err(ClvError::InvalidInput(_))
        ));
        assert!(TransactionEvent::new("a", f64::NAN, ts).is_err());
    }

    #[test]
    fn test_time_unit_conversion() {
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2020, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(TimeUnit::Weeks.between(t0, t1), 2.0);
        assert_eq!(TimeUnit::Days.between(t0, t1), 14.0);
        assert_eq!(TimeUnit::Hours.between(t0, t1), 336.0);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2011, 12, 9, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2011-12-09T00:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2011-12-09 00:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2011-12-09").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
