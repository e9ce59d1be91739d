//! End-to-end CLV estimation: aggregate, split, fit, score

use chrono::{DateTime, Utc};
use polars::prelude::*;
use tracing::info;

use crate::aggregate::CustomerLedger;
use crate::data::{TimeUnit, TransactionEvent};
use crate::error::{ClvError, Result};
use crate::optimize::{FitReport, OptimizerConfig};
use crate::score::{score, ScoringConfig, ValueTable};
use crate::source::{Connector, PagedLog};
use crate::spend::{fit_spend, spend_observations, SpendBasis, SpendModelParams};
use crate::split::split;
use crate::timing::{fit_purchase_timing, PurchaseTimingParams, TimingModel};
use crate::validate::{validate_holdout, HoldoutReport};

/// Every knob of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub unit: TimeUnit,
    /// Fit on purchases up to this instant and validate on the rest. Scoring
    /// always uses the full log.
    pub cutoff: Option<DateTime<Utc>>,
    pub timing_model: TimingModel,
    pub timing_start: Option<[f64; 4]>,
    pub spend_start: Option<[f64; 3]>,
    pub spend_basis: SpendBasis,
    pub optimizer: OptimizerConfig,
    pub scoring: ScoringConfig,
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ClvReport {
    pub timing: FitReport<PurchaseTimingParams>,
    pub spend: FitReport<SpendModelParams>,
    pub values: ValueTable,
    /// Present when a cutoff was configured.
    pub holdout: Option<HoldoutReport>,
    /// Customers left out of fitting because they first bought after the cutoff.
    pub excluded_from_fit: Vec<String>,
}

impl ClvReport {
    /// Fitted parameters as a `model, parameter, value` table.
    pub fn parameters_frame(&self) -> PolarsResult<DataFrame> {
        let timing_names: [&str; 4] = match self.timing.params {
            PurchaseTimingParams::ParetoNbd(_) => ["r", "alpha", "s", "beta"],
            PurchaseTimingParams::BgNbd(_) => ["r", "alpha", "a", "b"],
        };
        let timing_model = match self.timing.params.model() {
            TimingModel::ParetoNbd => "pareto_nbd",
            TimingModel::BgNbd => "bg_nbd",
        };

        let mut models = Vec::with_capacity(7);
        let mut names = Vec::with_capacity(7);
        let mut values = Vec::with_capacity(7);
        for (name, value) in timing_names.iter().zip(self.timing.params.as_array()) {
            models.push(timing_model);
            names.push(*name);
            values.push(value);
        }
        for (name, value) in ["p", "q", "gamma"].iter().zip(self.spend.params.as_array()) {
            models.push("gamma_gamma");
            names.push(*name);
            values.push(value);
        }

        df!(
            "model" => models,
            "parameter" => names,
            "value" => values
        )
    }
}

/// Run the whole estimation over an in-memory log.
///
/// The two models are fitted concurrently on the calibration window; scoring
/// waits for both and uses full-data statistics. Any stage failure aborts the
/// run.
pub fn run(events: &[TransactionEvent], config: &PipelineConfig) -> Result<ClvReport> {
    let ledger = CustomerLedger::from_events(events)?;
    if ledger.is_empty() {
        return Err(ClvError::InsufficientData {
            what: "transaction log",
            needed: 1,
            got: 0,
        });
    }
    let calibration = split(&ledger, config.cutoff, config.unit)?;
    let fit_spend_obs = spend_observations(&calibration.calibration, config.spend_basis);

    let (timing, spend) = rayon::join(
        || {
            fit_purchase_timing(
                &calibration.calibration,
                config.timing_model,
                config.timing_start,
                &config.optimizer,
            )
        },
        || fit_spend(&fit_spend_obs, config.spend_start, &config.optimizer),
    );
    let timing = timing?;
    let spend = spend?;

    let holdout = if calibration.has_holdout() {
        Some(validate_holdout(&timing.params, &calibration.calibration)?)
    } else {
        None
    };

    let full = ledger.statistics(config.unit);
    let full_spend_obs = spend_observations(&full, config.spend_basis);
    let values = score(
        &timing.params,
        &spend.params,
        &full,
        &full_spend_obs,
        &config.scoring,
    )?;

    info!(
        customers = values.estimates.len(),
        excluded_from_fit = calibration.holdout_only.len(),
        "pipeline complete"
    );

    Ok(ClvReport {
        timing,
        spend,
        values,
        holdout,
        excluded_from_fit: calibration.holdout_only,
    })
}

/// Drain a paginated log and run the pipeline over it.
pub fn run_paged<C: Connector>(
    log: &PagedLog<C>,
    config: &PipelineConfig,
) -> anyhow::Result<ClvReport> {
    let events = log.collect_events()?;
    Ok(run(&events, config)?)
}
