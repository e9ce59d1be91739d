//! Gamma-gamma model of average spend per transaction
//!
//! Individual transaction values are Gamma(p, nu) around a customer-specific
//! rate nu, and nu is itself Gamma(q, gamma) across customers. A customer's
//! expected spend is therefore a weighted mix of their own observed average and
//! the population mean, with more weight on their own data the more purchases
//! they have.

use tracing::{debug, info};

use crate::aggregate::CustomerSufficientStatistics;
use crate::error::{ClvError, Result};
use crate::optimize::{maximize, FitReport, OptimizerConfig};
use crate::special::ln_gamma;

/// Fewest customers with at least one transaction the spend model accepts.
pub const MIN_SPEND_CUSTOMERS: usize = 2;

/// Which purchases feed a customer's average spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SpendBasis {
    /// Every calibration purchase, first one included.
    #[default]
    AllTransactions,
    /// Repeat purchases only; single-purchase customers have no observation.
    RepeatOnly,
}

/// One customer's average spend and the number of purchases behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpendObservation {
    pub customer_id: String,
    pub average_spend: f64,
    pub transaction_count: usize,
}

impl SpendObservation {
    pub fn new(
        customer_id: impl Into<String>,
        average_spend: f64,
        transaction_count: usize,
    ) -> Result<Self> {
        let obs = Self {
            customer_id: customer_id.into(),
            average_spend,
            transaction_count,
        };
        obs.validate()?;
        Ok(obs)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.average_spend.is_finite() || self.average_spend <= 0.0 {
            return Err(ClvError::invalid(format!(
                "customer {}: average spend must be positive, got {}",
                self.customer_id, self.average_spend
            )));
        }
        Ok(())
    }
}

/// Derive spend observations from CBS rows.
pub fn spend_observations(
    rows: &[CustomerSufficientStatistics],
    basis: SpendBasis,
) -> Vec<SpendObservation> {
    rows.iter()
        .filter_map(|row| {
            let (total, count) = match basis {
                SpendBasis::AllTransactions => (row.sales, row.x + 1),
                SpendBasis::RepeatOnly => (row.sales_x, row.x),
            };
            (count > 0).then(|| SpendObservation {
                customer_id: row.customer_id.clone(),
                average_spend: total / count as f64,
                transaction_count: count,
            })
        })
        .collect()
}

/// Gamma-gamma parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendModelParams {
    /// Shape of individual transaction values.
    pub p: f64,
    /// Shape of the customer-level rate distribution.
    pub q: f64,
    /// Rate of the customer-level rate distribution.
    pub gamma: f64,
}

impl SpendModelParams {
    pub const DEFAULT_START: [f64; 3] = [1.0, 1.0, 1.0];

    pub fn as_array(&self) -> [f64; 3] {
        [self.p, self.q, self.gamma]
    }

    /// Log-density of observing `average_spend` over `count` purchases.
    pub fn log_likelihood(&self, average_spend: f64, count: usize) -> f64 {
        let Self { p, q, gamma } = *self;
        let x = count as f64;
        let m = average_spend;
        ln_gamma(p * x + q) - ln_gamma(p * x) - ln_gamma(q)
            + q * gamma.ln()
            + (p * x - 1.0) * m.ln()
            + p * x * x.ln()
            - (p * x + q) * (gamma + m * x).ln()
    }

    pub fn total_log_likelihood(&self, observations: &[SpendObservation]) -> f64 {
        observations
            .iter()
            .filter(|o| o.transaction_count > 0)
            .map(|o| self.log_likelihood(o.average_spend, o.transaction_count))
            .sum()
    }

    /// Mean spend per transaction across the population, if it exists (`q > 1`).
    pub fn population_mean(&self) -> Option<f64> {
        (self.q > 1.0).then(|| self.p * self.gamma / (self.q - 1.0))
    }

    /// Posterior mean spend per transaction for a customer with the given
    /// history. With no purchases this is the population mean.
    pub fn conditional_expected_average_spend(
        &self,
        average_spend: f64,
        count: usize,
    ) -> Option<f64> {
        let x = count as f64;
        let denominator = self.p * x + self.q - 1.0;
        if denominator <= 0.0 {
            return None;
        }
        let value = (self.gamma + average_spend * x) * self.p / denominator;
        value.is_finite().then_some(value)
    }
}

/// Fit the gamma-gamma model by maximum likelihood.
///
/// Observations with no transactions carry no information and are dropped
/// before fitting.
pub fn fit_spend(
    observations: &[SpendObservation],
    initial: Option<[f64; 3]>,
    config: &OptimizerConfig,
) -> Result<FitReport<SpendModelParams>> {
    let usable: Vec<&SpendObservation> =
        observations.iter().filter(|o| o.transaction_count > 0).collect();
    if usable.len() < observations.len() {
        debug!(
            dropped = observations.len() - usable.len(),
            "spend observations without transactions excluded"
        );
    }
    if usable.len() < MIN_SPEND_CUSTOMERS {
        return Err(ClvError::InsufficientData {
            what: "spend model",
            needed: MIN_SPEND_CUSTOMERS,
            got: usable.len(),
        });
    }
    for obs in &usable {
        obs.validate()?;
    }

    let log_likelihood = |v: &[f64]| -> f64 {
        let params = SpendModelParams {
            p: v[0],
            q: v[1],
            gamma: v[2],
        };
        usable
            .iter()
            .map(|o| params.log_likelihood(o.average_spend, o.transaction_count))
            .sum()
    };

    let start = initial.unwrap_or(SpendModelParams::DEFAULT_START);
    let optimum = maximize(log_likelihood, &start, config)?;
    let params = SpendModelParams {
        p: optimum.params[0],
        q: optimum.params[1],
        gamma: optimum.params[2],
    };

    info!(
        customers = usable.len(),
        iterations = optimum.iterations,
        log_likelihood = optimum.log_likelihood,
        p = params.p,
        q = params.q,
        gamma = params.gamma,
        "fitted spend model"
    );

    Ok(FitReport {
        params,
        log_likelihood: optimum.log_likelihood,
        customers: usable.len(),
        iterations: optimum.iterations,
        restarts: optimum.restarts,
        trace: optimum.trace,
        at_bound: optimum.at_bound,
    })
}
