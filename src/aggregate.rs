//! Transaction aggregation into customer-by-sufficient-statistics (CBS) rows

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::data::{TimeUnit, TransactionEvent};
use crate::error::{ClvError, Result};

/// A purchase after same-timestamp events have been merged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Purchase {
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
}

/// All purchases of one customer, sorted by time, one per distinct timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerHistory {
    pub customer_id: String,
    pub purchases: Vec<Purchase>,
}

/// Holdout-window statistics, present only when a cutoff was requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldoutStatistics {
    /// Length of the holdout window (cutoff to end of observation).
    pub t_star: f64,
    /// Purchases after the cutoff.
    pub x_star: usize,
    /// Revenue after the cutoff.
    pub sales_star: f64,
}

/// One customer's calibration-window summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerSufficientStatistics {
    pub customer_id: String,
    /// Repeat purchases in the calibration window (first purchase excluded).
    pub x: usize,
    /// Time from first to last calibration purchase.
    pub t_x: f64,
    /// Sum of log inter-purchase gaps.
    pub litt: f64,
    /// Total calibration revenue.
    pub sales: f64,
    /// Calibration revenue excluding the first purchase.
    pub sales_x: f64,
    pub first_transaction_time: DateTime<Utc>,
    /// Time from first purchase to the end of the calibration window.
    pub t_cal: f64,
    pub holdout: Option<HoldoutStatistics>,
}

impl CustomerSufficientStatistics {
    /// Build a bare row from the three statistics the purchase-timing models
    /// need. Revenue fields are zero and there is no holdout.
    pub fn new(
        customer_id: impl Into<String>,
        x: usize,
        t_x: f64,
        t_cal: f64,
        first_transaction_time: DateTime<Utc>,
    ) -> Result<Self> {
        let row = Self {
            customer_id: customer_id.into(),
            x,
            t_x,
            litt: 0.0,
            sales: 0.0,
            sales_x: 0.0,
            first_transaction_time,
            t_cal,
            holdout: None,
        };
        row.validate()?;
        Ok(row)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.t_cal.is_finite() || self.t_cal < 0.0 {
            return Err(ClvError::invalid(format!(
                "customer {}: T_cal must be non-negative, got {}",
                self.customer_id, self.t_cal
            )));
        }
        if !self.t_x.is_finite() || self.t_x < 0.0 || self.t_x > self.t_cal {
            return Err(ClvError::invalid(format!(
                "customer {}: t_x must lie in [0, T_cal], got t_x={} T_cal={}",
                self.customer_id, self.t_x, self.t_cal
            )));
        }
        if self.x == 0 && self.t_x != 0.0 {
            return Err(ClvError::invalid(format!(
                "customer {}: t_x must be zero without repeat purchases",
                self.customer_id
            )));
        }
        Ok(())
    }
}

/// Events grouped per customer, sorted and merged.
#[derive(Debug, Clone, Default)]
pub struct CustomerLedger {
    customers: Vec<CustomerHistory>,
    merged_events: usize,
    observation_end: Option<DateTime<Utc>>,
}

impl CustomerLedger {
    /// Group a raw log by customer.
    ///
    /// Events sharing a customer and timestamp collapse into one purchase whose
    /// amount is their sum. Input order does not matter.
    pub fn from_events(events: &[TransactionEvent]) -> Result<Self> {
        let mut grouped: BTreeMap<&str, Vec<Purchase>> = BTreeMap::new();
        for event in events {
            event.validate()?;
            grouped
                .entry(event.customer_id.as_str())
                .or_default()
                .push(Purchase {
                    timestamp: event.timestamp,
                    amount: event.amount,
                });
        }

        let mut merged_events = 0;
        let mut observation_end: Option<DateTime<Utc>> = None;
        let customers: Vec<CustomerHistory> = grouped
            .into_iter()
            .map(|(customer_id, mut raw)| {
                raw.sort_by(|a, b| {
                    a.timestamp
                        .cmp(&b.timestamp)
                        .then(a.amount.total_cmp(&b.amount))
                });
                let mut purchases: Vec<Purchase> = Vec::with_capacity(raw.len());
                for purchase in raw {
                    match purchases.last_mut() {
                        Some(last) if last.timestamp == purchase.timestamp => {
                            last.amount += purchase.amount;
                            merged_events += 1;
                        }
                        _ => purchases.push(purchase),
                    }
                }
                if let Some(last) = purchases.last() {
                    observation_end = Some(match observation_end {
                        Some(end) => end.max(last.timestamp),
                        None => last.timestamp,
                    });
                }
                CustomerHistory {
                    customer_id: customer_id.to_string(),
                    purchases,
                }
            })
            .collect();

        debug!(
            events = events.len(),
            customers = customers.len(),
            merged_events,
            "grouped transaction log"
        );

        Ok(Self {
            customers,
            merged_events,
            observation_end,
        })
    }

    pub fn customers(&self) -> &[CustomerHistory] {
        &self.customers
    }

    /// Raw events absorbed into an earlier event with the same timestamp.
    pub fn merged_events(&self) -> usize {
        self.merged_events
    }

    /// Latest purchase timestamp across the whole log.
    pub fn observation_end(&self) -> Option<DateTime<Utc>> {
        self.observation_end
    }

    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }

    /// Full-data statistics: every purchase is calibration data and the
    /// window ends at the last observed purchase.
    pub fn statistics(&self, unit: TimeUnit) -> Vec<CustomerSufficientStatistics> {
        let Some(end) = self.observation_end else {
            return Vec::new();
        };
        self.customers
            .iter()
            .filter_map(|history| calibration_statistics(history, end, unit))
            .collect()
    }
}

/// Summarise one customer's purchases up to and including `end`.
///
/// Returns `None` when the customer has no purchase at or before `end`.
pub(crate) fn calibration_statistics(
    history: &CustomerHistory,
    end: DateTime<Utc>,
    unit: TimeUnit,
) -> Option<CustomerSufficientStatistics> {
    let window: Vec<&Purchase> = history
        .purchases
        .iter()
        .take_while(|p| p.timestamp <= end)
        .collect();
    let first = *window.first()?;
    let last = *window.last()?;

    let sales: f64 = window.iter().map(|p| p.amount).sum();
    let litt = window
        .windows(2)
        .map(|pair| unit.between(pair[0].timestamp, pair[1].timestamp))
        .filter(|gap| *gap > 0.0)
        .map(f64::ln)
        .sum();
    let t_x = if window.len() > 1 {
        unit.between(first.timestamp, last.timestamp)
    } else {
        0.0
    };

    Some(CustomerSufficientStatistics {
        customer_id: history.customer_id.clone(),
        x: window.len() - 1,
        t_x,
        litt,
        sales,
        sales_x: sales - first.amount,
        first_transaction_time: first.timestamp,
        t_cal: unit.between(first.timestamp, end),
        holdout: None,
    })
}

/// Collapse a raw transaction log into one full-data CBS row per customer,
/// ordered by customer id.
///
/// An empty log yields an empty set of rows; the estimators reject it later
/// as insufficient data.
pub fn aggregate(
    events: &[TransactionEvent],
    unit: TimeUnit,
) -> Result<Vec<CustomerSufficientStatistics>> {
    let ledger = CustomerLedger::from_events(events)?;
    Ok(ledger.statistics(unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 6, 12, 0, 0).unwrap()
    }

    fn event(id: &str, amount: f64, at: DateTime<Utc>) -> TransactionEvent {
        TransactionEvent {
            customer_id: id.to_string(),
            amount,
            timestamp: at,
        }
    }

    #[test]
    fn test_same_timestamp_events_merge() {
        let log = vec![
            event("A", 10.0, t0()),
            event("A", 10.0, t0()),
            event("A", 20.0, t0() + Duration::weeks(1)),
        ];
        let ledger = CustomerLedger::from_events(&log).unwrap();
        assert_eq!(ledger.merged_events(), 1);
        assert_eq!(ledger.customers()[0].purchases[0].amount, 20.0);

        let rows = ledger.statistics(TimeUnit::Weeks);
        assert_eq!(rows.len(), 1);
        let a = &rows[0];
        assert_eq!(a.customer_id, "A");
        assert_eq!(a.x, 1);
        assert_eq!(a.t_x, 1.0);
        assert_eq!(a.t_cal, 1.0);
        assert_eq!(a.sales, 40.0);
        assert_eq!(a.sales_x, 20.0);
        assert_eq!(a.first_transaction_time, t0());
        assert_eq!(a.litt, 0.0); // ln(1 week)
    }

    #[test]
    fn test_single_purchase_customer() {
        let log = vec![
            event("solo", 5.0, t0()),
            event("busy", 1.0, t0() - Duration::days(14)),
            event("busy", 1.0, t0() + Duration::days(14)),
        ];
        let rows = aggregate(&log, TimeUnit::Weeks).unwrap();
        let solo = rows.iter().find(|r| r.customer_id == "solo").unwrap();
        assert_eq!(solo.x, 0);
        assert_eq!(solo.t_x, 0.0);
        assert_eq!(solo.litt, 0.0);
        assert_eq!(solo.sales_x, 0.0);
        // window ends at the last purchase anywhere in the log
        assert_eq!(solo.t_cal, 2.0);
    }

    #[test]
    fn test_log_gaps() {
        let log = vec![
            event("c", 1.0, t0()),
            event("c", 1.0, t0() + Duration::weeks(2)),
            event("c", 1.0, t0() + Duration::weeks(5)),
        ];
        let rows = aggregate(&log, TimeUnit::Weeks).unwrap();
        let expected = 2.0f64.ln() + 3.0f64.ln();
        assert!((rows[0].litt - expected).abs() < 1e-12);
        assert_eq!(rows[0].x, 2);
        assert_eq!(rows[0].t_x, 5.0);
    }

    #[test]
    fn test_empty_log_yields_no_rows() {
        let rows = aggregate(&[], TimeUnit::Days).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_rejects_invalid_events() {
        let bad_amount = vec![event("a", 1.0, t0()), event("a", -2.0, t0())];
        assert!(matches!(
            aggregate(&bad_amount, TimeUnit::Weeks),
            Err(ClvError::InvalidInput(_))
        ));

        let missing_id = vec![event("", 1.0, t0())];
        assert!(matches!(
            aggregate(&missing_id, TimeUnit::Weeks),
            Err(ClvError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_row_validation() {
        assert!(CustomerSufficientStatistics::new("a", 2, 3.0, 5.0, t0()).is_ok());
        assert!(CustomerSufficientStatistics::new("a", 2, 6.0, 5.0, t0()).is_err());
        assert!(CustomerSufficientStatistics::new("a", 0, 1.0, 5.0, t0()).is_err());
        assert!(CustomerSufficientStatistics::new("a", 0, 0.0, -1.0, t0()).is_err());
    }

    fn arb_log() -> impl Strategy<Value = Vec<TransactionEvent>> {
        prop::collection::vec((0u8..6, 1u32..50_000, 0i64..200), 0..80).prop_map(|rows| {
            rows.into_iter()
                .map(|(cust, cents, hours)| {
                    event(
                        &format!("cust-{cust}"),
                        f64::from(cents) / 100.0,
                        t0() + Duration::hours(hours),
                    )
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_repeat_count_identity(log in arb_log()) {
            let ledger = CustomerLedger::from_events(&log).unwrap();
            let rows = ledger.statistics(TimeUnit::Days);
            let repeats: usize = rows.iter().map(|r| r.x).sum();
            prop_assert_eq!(repeats + rows.len() + ledger.merged_events(), log.len());
        }

        #[test]
        fn prop_rows_are_consistent(log in arb_log()) {
            for row in aggregate(&log, TimeUnit::Days).unwrap() {
                prop_assert!(row.validate().is_ok());
                prop_assert!(row.t_x <= row.t_cal);
                prop_assert!(row.sales_x <= row.sales);
                if row.x == 0 {
                    prop_assert_eq!(row.litt, 0.0);
                }
            }
        }

        #[test]
        fn prop_order_independent(log in arb_log()) {
            let mut reversed = log.clone();
            reversed.reverse();
            prop_assert_eq!(
                aggregate(&log, TimeUnit::Weeks).unwrap(),
                aggregate(&reversed, TimeUnit::Weeks).unwrap()
            );
        }
    }
}
