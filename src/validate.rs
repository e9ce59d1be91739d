//! Holdout validation of purchase-timing fits

use tracing::info;

use crate::aggregate::CustomerSufficientStatistics;
use crate::error::{ClvError, Result};
use crate::timing::PurchaseTimingParams;

/// Predicted versus observed holdout purchases for one customer.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldoutComparison {
    pub customer_id: String,
    pub predicted: f64,
    pub actual: usize,
}

/// How well a calibration fit forecast the holdout window.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldoutReport {
    pub customers: Vec<HoldoutComparison>,
    pub predicted_total: f64,
    pub actual_total: usize,
    pub mean_absolute_error: f64,
}

/// Compare each customer's expected purchases over their holdout window with
/// the purchases actually made there.
///
/// Rows without holdout fields are skipped.
pub fn validate_holdout(
    params: &PurchaseTimingParams,
    rows: &[CustomerSufficientStatistics],
) -> Result<HoldoutReport> {
    let customers: Vec<HoldoutComparison> = rows
        .iter()
        .filter_map(|row| {
            let holdout = row.holdout?;
            Some(HoldoutComparison {
                customer_id: row.customer_id.clone(),
                predicted: params.conditional_expected_transactions(row, holdout.t_star),
                actual: holdout.x_star,
            })
        })
        .collect();

    if customers.is_empty() {
        return Err(ClvError::InsufficientData {
            what: "holdout validation",
            needed: 1,
            got: 0,
        });
    }

    if let Some(bad) = customers.iter().find(|c| !c.predicted.is_finite()) {
        return Err(ClvError::invalid(format!(
            "holdout prediction for customer {} is not finite",
            bad.customer_id
        )));
    }

    let predicted_total: f64 = customers.iter().map(|c| c.predicted).sum();
    let actual_total: usize = customers.iter().map(|c| c.actual).sum();
    let mean_absolute_error = customers
        .iter()
        .map(|c| (c.predicted - c.actual as f64).abs())
        .sum::<f64>()
        / customers.len() as f64;

    info!(
        customers = customers.len(),
        predicted_total,
        actual_total,
        mean_absolute_error,
        "holdout validation"
    );

    Ok(HoldoutReport {
        customers,
        predicted_total,
        actual_total,
        mean_absolute_error,
    })
}
