//! Calibration/holdout splitting of customer histories

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::aggregate::{
    calibration_statistics, CustomerLedger, CustomerSufficientStatistics, HoldoutStatistics,
};
use crate::data::{TimeUnit, TransactionEvent};
use crate::error::{ClvError, Result};

/// Statistics for the calibration window, plus holdout fields when a cutoff
/// was given.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSplit {
    pub cutoff: Option<DateTime<Utc>>,
    /// One row per customer with at least one purchase at or before the cutoff.
    pub calibration: Vec<CustomerSufficientStatistics>,
    /// Customers first seen after the cutoff. They cannot be fit and are left
    /// out of `calibration`.
    pub holdout_only: Vec<String>,
}

impl CalibrationSplit {
    pub fn has_holdout(&self) -> bool {
        self.cutoff.is_some()
    }
}

/// Split a grouped log at `cutoff`.
///
/// Without a cutoff every purchase is calibration data and no holdout fields
/// are filled. With one, purchases at or before the cutoff feed the
/// calibration fields and later purchases up to the end of observation feed
/// `T_star`, `x_star` and `sales_star`.
pub fn split(
    ledger: &CustomerLedger,
    cutoff: Option<DateTime<Utc>>,
    unit: TimeUnit,
) -> Result<CalibrationSplit> {
    let Some(cutoff) = cutoff else {
        return Ok(CalibrationSplit {
            cutoff: None,
            calibration: ledger.statistics(unit),
            holdout_only: Vec::new(),
        });
    };
    let Some(observation_end) = ledger.observation_end() else {
        return Ok(CalibrationSplit {
            cutoff: Some(cutoff),
            calibration: Vec::new(),
            holdout_only: Vec::new(),
        });
    };
    if cutoff > observation_end {
        return Err(ClvError::invalid(format!(
            "calibration cutoff {cutoff} is after the last observed event {observation_end}"
        )));
    }

    let t_star = unit.between(cutoff, observation_end);
    let mut calibration = Vec::with_capacity(ledger.customers().len());
    let mut holdout_only = Vec::new();

    for history in ledger.customers() {
        let Some(mut row) = calibration_statistics(history, cutoff, unit) else {
            holdout_only.push(history.customer_id.clone());
            continue;
        };
        let (x_star, sales_star) = history
            .purchases
            .iter()
            .filter(|p| p.timestamp > cutoff)
            .fold((0usize, 0.0f64), |(n, sales), p| (n + 1, sales + p.amount));
        row.holdout = Some(HoldoutStatistics {
            t_star,
            x_star,
            sales_star,
        });
        calibration.push(row);
    }

    if !holdout_only.is_empty() {
        debug!(
            excluded = holdout_only.len(),
            "customers with no calibration activity left out of fitting"
        );
    }
    info!(
        %cutoff,
        calibration = calibration.len(),
        holdout_only = holdout_only.len(),
        t_star,
        "split transaction log"
    );

    Ok(CalibrationSplit {
        cutoff: Some(cutoff),
        calibration,
        holdout_only,
    })
}

/// Group `events` and split them at `cutoff` in one step.
pub fn split_events(
    events: &[TransactionEvent],
    cutoff: Option<DateTime<Utc>>,
    unit: TimeUnit,
) -> Result<CalibrationSplit> {
    let ledger = CustomerLedger::from_events(events)?;
    split(&ledger, cutoff, unit)
}
