//! Customer value scoring and tiering

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use polars::prelude::*;
use tracing::{info, warn};

use crate::aggregate::CustomerSufficientStatistics;
use crate::error::{ClvError, Result};
use crate::spend::{SpendModelParams, SpendObservation};
use crate::timing::PurchaseTimingParams;

/// Value tier of a customer relative to the rest of the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    High,
    Medium,
    Low,
    /// No value estimate could be formed.
    Undefined,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
            Tier::Undefined => "undefined",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward-looking value of one customer.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerValueEstimate {
    pub customer_id: String,
    /// Expected purchases over the scoring horizon.
    pub expected_transactions: Option<f64>,
    /// Expected spend per purchase.
    pub expected_average_spend: Option<f64>,
    /// Probability the customer is still active.
    pub p_alive: Option<f64>,
    /// `expected_transactions * expected_average_spend`.
    pub clv: Option<f64>,
    pub tier: Tier,
}

/// Settings for [`score`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Forward horizon, in the aggregation time unit.
    pub horizon: f64,
    /// Quantile of `clv` at or above which a customer is `high`.
    pub high_quantile: f64,
    /// Quantile of `clv` at or above which a customer is `medium`.
    pub medium_quantile: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            horizon: 52.0,
            high_quantile: 0.9,
            medium_quantile: 0.5,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.horizon.is_finite() || self.horizon < 0.0 {
            return Err(ClvError::invalid(format!(
                "horizon must be non-negative, got {}",
                self.horizon
            )));
        }
        let in_unit = |q: f64| (0.0..=1.0).contains(&q);
        if !in_unit(self.high_quantile)
            || !in_unit(self.medium_quantile)
            || self.medium_quantile > self.high_quantile
        {
            return Err(ClvError::invalid(format!(
                "tier quantiles must satisfy 0 <= medium ({}) <= high ({}) <= 1",
                self.medium_quantile, self.high_quantile
            )));
        }
        Ok(())
    }
}

/// Scored customers plus the thresholds used to tier them.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueTable {
    /// One entry per customer, ordered by customer id.
    pub estimates: Vec<CustomerValueEstimate>,
    pub high_threshold: Option<f64>,
    pub medium_threshold: Option<f64>,
}

impl ValueTable {
    pub fn tier_count(&self, tier: Tier) -> usize {
        self.estimates.iter().filter(|e| e.tier == tier).count()
    }

    pub fn get(&self, customer_id: &str) -> Option<&CustomerValueEstimate> {
        self.estimates
            .binary_search_by(|e| e.customer_id.as_str().cmp(customer_id))
            .ok()
            .map(|i| &self.estimates[i])
    }

    /// Flat column-oriented view of the estimates.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let ids: Vec<&str> = self.estimates.iter().map(|e| e.customer_id.as_str()).collect();
        let transactions: Vec<Option<f64>> =
            self.estimates.iter().map(|e| e.expected_transactions).collect();
        let spend: Vec<Option<f64>> =
            self.estimates.iter().map(|e| e.expected_average_spend).collect();
        let p_alive: Vec<Option<f64>> = self.estimates.iter().map(|e| e.p_alive).collect();
        let clv: Vec<Option<f64>> = self.estimates.iter().map(|e| e.clv).collect();
        let tiers: Vec<&str> = self.estimates.iter().map(|e| e.tier.as_str()).collect();

        df!(
            "customer_id" => ids,
            "expected_transactions" => transactions,
            "expected_average_spend" => spend,
            "p_alive" => p_alive,
            "clv" => clv,
            "tier" => tiers
        )
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut df = self.to_dataframe()?;
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
        Ok(())
    }
}

/// Linear-interpolation quantile of an ascending slice.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

type Sources<'a> = (Option<&'a CustomerSufficientStatistics>, Option<&'a SpendObservation>);

/// Score every customer seen in either the purchase statistics or the spend
/// observations.
///
/// A customer missing from one of the two sources gets an undefined `clv` and
/// tier [`Tier::Undefined`]; they are kept in the output but do not influence
/// the tier thresholds. Invalid rows or observations fail the call, and so do
/// parameters under which a customer's expectation is not finite.
pub fn score(
    timing: &PurchaseTimingParams,
    spend: &SpendModelParams,
    rows: &[CustomerSufficientStatistics],
    observations: &[SpendObservation],
    config: &ScoringConfig,
) -> Result<ValueTable> {
    config.validate()?;

    let mut customers: BTreeMap<&str, Sources<'_>> = BTreeMap::new();
    for row in rows {
        row.validate()?;
        let entry = customers.entry(row.customer_id.as_str()).or_default();
        if entry.0.replace(row).is_some() {
            return Err(ClvError::invalid(format!(
                "customer {} has more than one statistics row",
                row.customer_id
            )));
        }
    }
    for obs in observations {
        obs.validate()?;
        let entry = customers.entry(obs.customer_id.as_str()).or_default();
        if entry.1.replace(obs).is_some() {
            return Err(ClvError::invalid(format!(
                "customer {} has more than one spend observation",
                obs.customer_id
            )));
        }
    }

    let mut estimates = customers
        .into_iter()
        .map(|(customer_id, (row, obs))| {
            estimate(customer_id, row, obs, timing, spend, config.horizon)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut defined: Vec<f64> = estimates.iter().filter_map(|e| e.clv).collect();
    defined.sort_by(f64::total_cmp);
    let high_threshold = quantile(&defined, config.high_quantile);
    let medium_threshold = quantile(&defined, config.medium_quantile);

    if let (Some(high), Some(medium)) = (high_threshold, medium_threshold) {
        for estimate in &mut estimates {
            estimate.tier = match estimate.clv {
                Some(v) if v >= high => Tier::High,
                Some(v) if v >= medium => Tier::Medium,
                Some(_) => Tier::Low,
                None => Tier::Undefined,
            };
        }
    }

    let undefined = estimates.len() - defined.len();
    if undefined > 0 {
        warn!(undefined, "customers without a defined value estimate");
    }
    info!(
        customers = estimates.len(),
        horizon = config.horizon,
        ?high_threshold,
        ?medium_threshold,
        "scored customers"
    );

    Ok(ValueTable {
        estimates,
        high_threshold,
        medium_threshold,
    })
}

fn estimate(
    customer_id: &str,
    row: Option<&CustomerSufficientStatistics>,
    obs: Option<&SpendObservation>,
    timing: &PurchaseTimingParams,
    spend: &SpendModelParams,
    horizon: f64,
) -> Result<CustomerValueEstimate> {
    let undefined = |what: &str| {
        ClvError::invalid(format!(
            "{what} of customer {customer_id} is not finite under the given parameters"
        ))
    };

    let (expected_transactions, p_alive) = match row {
        Some(row) => {
            let expected = timing.conditional_expected_transactions(row, horizon);
            if !expected.is_finite() {
                return Err(undefined("expected transactions"));
            }
            let p_alive = timing.p_alive(row);
            if !p_alive.is_finite() {
                return Err(undefined("P(alive)"));
            }
            (Some(expected), Some(p_alive))
        }
        None => (None, None),
    };
    let expected_average_spend = match obs {
        Some(obs) => Some(
            spend
                .conditional_expected_average_spend(obs.average_spend, obs.transaction_count)
                .ok_or_else(|| undefined("expected average spend"))?,
        ),
        None => None,
    };
    let clv = expected_transactions
        .zip(expected_average_spend)
        .map(|(n, m)| n * m);

    Ok(CustomerValueEstimate {
        customer_id: customer_id.to_string(),
        expected_transactions,
        expected_average_spend,
        p_alive,
        clv,
        tier: Tier::Undefined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ParetoNbdParams;
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;

    fn timing() -> PurchaseTimingParams {
        PurchaseTimingParams::ParetoNbd(ParetoNbdParams {
            r: 0.55,
            alpha: 10.58,
            s: 0.61,
            beta: 11.67,
        })
    }

    fn spend() -> SpendModelParams {
        SpendModelParams {
            p: 6.25,
            q: 3.74,
            gamma: 15.44,
        }
    }

    fn row(id: &str, x: usize, t_x: f64, t_cal: f64) -> CustomerSufficientStatistics {
        let first = Utc.with_ymd_and_hms(1997, 1, 1, 0, 0, 0).unwrap();
        CustomerSufficientStatistics::new(id, x, t_x, t_cal, first).unwrap()
    }

    fn score_with(
        rows: &[CustomerSufficientStatistics],
        observations: &[SpendObservation],
        config: &ScoringConfig,
    ) -> Result<ValueTable> {
        score(&timing(), &spend(), rows, observations, config)
    }

    fn population() -> (Vec<CustomerSufficientStatistics>, Vec<SpendObservation>) {
        let mut rows = Vec::new();
        let mut observations = Vec::new();
        for i in 0..10 {
            let id = format!("c{i:02}");
            rows.push(row(&id, i, i as f64 * 3.0, 35.0));
            observations.push(SpendObservation::new(&id, 20.0 + 5.0 * i as f64, i + 1).unwrap());
        }
        (rows, observations)
    }

    #[test]
    fn test_quantile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&values, 0.5), Some(3.0));
        assert_eq!(quantile(&values, 0.9), Some(4.6));
        assert_eq!(quantile(&values, 0.0), Some(1.0));
        assert_eq!(quantile(&values, 1.0), Some(5.0));
        assert_eq!(quantile(&[7.0], 0.9), Some(7.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_scores_and_tiers() {
        let (rows, observations) = population();
        let table = score_with(&rows, &observations, &ScoringConfig::default()).unwrap();

        assert_eq!(table.estimates.len(), 10);
        for e in &table.estimates {
            let clv = e.clv.unwrap();
            assert_eq!(clv, e.expected_transactions.unwrap() * e.expected_average_spend.unwrap());
            assert!(e.p_alive.unwrap() > 0.0);
        }

        let high = table.high_threshold.unwrap();
        let medium = table.medium_threshold.unwrap();
        assert!(high >= medium);
        for e in &table.estimates {
            let clv = e.clv.unwrap();
            let expected = if clv >= high {
                Tier::High
            } else if clv >= medium {
                Tier::Medium
            } else {
                Tier::Low
            };
            assert_eq!(e.tier, expected);
        }
        assert_eq!(table.tier_count(Tier::High), 1);
        assert_eq!(table.tier_count(Tier::Medium), 4);
        assert_eq!(table.tier_count(Tier::Low), 5);
    }

    #[test]
    fn test_missing_sources_are_undefined() {
        let (mut rows, mut observations) = population();
        rows.push(row("only-purchases", 2, 10.0, 30.0));
        observations.push(SpendObservation::new("only-spend", 40.0, 2).unwrap());

        let table = score_with(&rows, &observations, &ScoringConfig::default()).unwrap();
        assert_eq!(table.estimates.len(), 12);

        let purchases_only = table.get("only-purchases").unwrap();
        assert!(purchases_only.expected_transactions.is_some());
        assert!(purchases_only.expected_average_spend.is_none());
        assert_eq!(purchases_only.clv, None);
        assert_eq!(purchases_only.tier, Tier::Undefined);

        let spend_only = table.get("only-spend").unwrap();
        assert!(spend_only.expected_transactions.is_none());
        assert_eq!(spend_only.tier, Tier::Undefined);

        // thresholds come from the ten defined customers only
        let (rows, observations) = population();
        let baseline = score_with(&rows, &observations, &ScoringConfig::default()).unwrap();
        assert_eq!(table.high_threshold, baseline.high_threshold);
        assert_eq!(table.medium_threshold, baseline.medium_threshold);
    }

    #[test]
    fn test_tiering_is_idempotent() {
        let (rows, observations) = population();
        let config = ScoringConfig::default();
        let first = score(&timing(), &spend(), &rows, &observations, &config).unwrap();
        let second = score(&timing(), &spend(), &rows, &observations, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_longer_horizon_never_lowers_expectations() {
        let (rows, observations) = population();
        let short_horizon = ScoringConfig {
            horizon: 13.0,
            ..Default::default()
        };
        let long_horizon = ScoringConfig {
            horizon: 104.0,
            ..Default::default()
        };
        let short = score_with(&rows, &observations, &short_horizon).unwrap();
        let long = score_with(&rows, &observations, &long_horizon).unwrap();
        for (s, l) in short.estimates.iter().zip(&long.estimates) {
            assert!(l.expected_transactions.unwrap() >= s.expected_transactions.unwrap());
        }
    }

    #[test]
    fn test_rejects_duplicates_and_bad_config() {
        let (mut rows, observations) = population();
        assert!(score(
            &timing(),
            &spend(),
            &rows,
            &observations,
            &ScoringConfig { horizon: -1.0, ..Default::default() }
        )
        .is_err());
        assert!(score(
            &timing(),
            &spend(),
            &rows,
            &observations,
            &ScoringConfig { high_quantile: 0.4, ..Default::default() }
        )
        .is_err());

        rows.push(rows[0].clone());
        assert!(matches!(
            score(&timing(), &spend(), &rows, &observations, &ScoringConfig::default()),
            Err(ClvError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_spend_observation() {
        let (rows, mut observations) = population();
        observations.push(SpendObservation {
            customer_id: "a".into(),
            average_spend: -40.0,
            transaction_count: 3,
        });
        let result = score_with(&rows, &observations, &ScoringConfig::default());
        match result {
            Err(ClvError::InvalidInput(message)) => assert!(message.contains("customer a")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_timing_expectation_is_an_error() {
        let (rows, observations) = population();
        let broken = PurchaseTimingParams::ParetoNbd(ParetoNbdParams {
            r: f64::NAN,
            alpha: 10.58,
            s: 0.61,
            beta: 11.67,
        });
        let config = ScoringConfig::default();
        let result = score(&broken, &spend(), &rows, &observations, &config);
        assert!(matches!(result, Err(ClvError::InvalidInput(_))));
    }

    #[test]
    fn test_undefined_spend_expectation_is_an_error() {
        let (rows, observations) = population();
        // p * x + q <= 1 for a single purchase
        let heavy_tail = SpendModelParams {
            p: 0.3,
            q: 0.5,
            gamma: 2.0,
        };
        let config = ScoringConfig::default();
        let result = score(&timing(), &heavy_tail, &rows, &observations, &config);
        match result {
            Err(ClvError::InvalidInput(message)) => {
                assert!(message.contains("expected average spend of customer c00"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty_input_scores_nothing() {
        let table = score(&timing(), &spend(), &[], &[], &ScoringConfig::default()).unwrap();
        assert!(table.estimates.is_empty());
        assert_eq!(table.high_threshold, None);
    }

    #[test]
    fn test_dataframe_export() {
        let (mut rows, observations) = population();
        rows.push(row("only-purchases", 2, 10.0, 30.0));
        let table = score_with(&rows, &observations, &ScoringConfig::default()).unwrap();

        let df = table.to_dataframe().unwrap();
        assert_eq!(df.height(), 11);
        let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(
            names,
            [
                "customer_id",
                "expected_transactions",
                "expected_average_spend",
                "p_alive",
                "clv",
                "tier"
            ]
        );
        assert_eq!(df.column("clv").unwrap().null_count(), 1);

        let file = NamedTempFile::new().unwrap();
        table.write_csv(file.path()).unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        assert!(written.starts_with("customer_id,expected_transactions"));
        assert_eq!(written.lines().count(), 12);
        assert!(written.contains("only-purchases"));
    }
}
