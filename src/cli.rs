//! Command-line interface definitions and argument parsing

use clap::Parser;

use crate::data::{parse_timestamp, EventColumns, TimeUnit};
use crate::optimize::OptimizerConfig;
use crate::pipeline::PipelineConfig;
use crate::score::ScoringConfig;
use crate::spend::SpendBasis;
use crate::timing::TimingModel;

/// Customer lifetime value estimation from a transaction log
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input CSV file of purchase events
    #[arg(short, long, default_value = "events.csv")]
    pub input: String,

    /// Output path for the per-customer estimate table
    #[arg(short, long, default_value = "clv.csv")]
    pub output: String,

    /// Fit on purchases up to this instant and validate on the rest
    /// Example: --cutoff 2023-06-30T23:59:59Z
    #[arg(short, long)]
    pub cutoff: Option<String>,

    /// Prediction horizon, in --unit
    #[arg(long, default_value = "52")]
    pub horizon: f64,

    /// Unit for elapsed times and the horizon
    #[arg(short, long, value_enum, default_value_t = TimeUnit::Weeks)]
    pub unit: TimeUnit,

    /// Purchase-timing model
    #[arg(short, long, value_enum, default_value_t = TimingModel::ParetoNbd)]
    pub model: TimingModel,

    /// Which purchases feed a customer's average spend
    #[arg(long, value_enum, default_value_t = SpendBasis::AllTransactions)]
    pub spend_basis: SpendBasis,

    /// Column holding the customer identifier
    #[arg(long, default_value = "customer_id")]
    pub id_column: String,

    /// Column holding the purchase amount
    #[arg(long, default_value = "amount")]
    pub amount_column: String,

    /// Column holding the purchase timestamp
    #[arg(long, default_value = "timestamp")]
    pub timestamp_column: String,

    /// Maximum optimizer iterations per model fit
    #[arg(long, default_value = "5000")]
    pub max_iters: usize,

    /// Relative log-likelihood tolerance for optimizer convergence
    #[arg(long, default_value = "1e-6")]
    pub tolerance: f64,

    /// Keep fits whose parameters end at the optimizer's cap instead of failing
    #[arg(long)]
    pub accept_boundary: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn columns(&self) -> EventColumns {
        EventColumns {
            customer_id: self.id_column.clone(),
            amount: self.amount_column.clone(),
            timestamp: self.timestamp_column.clone(),
        }
    }

    /// Map the flags onto a pipeline configuration.
    pub fn to_config(&self) -> anyhow::Result<PipelineConfig> {
        let cutoff = match self.cutoff.as_deref() {
            Some(raw) => Some(
                parse_timestamp(raw)
                    .map_err(|_| anyhow::anyhow!("Invalid cutoff timestamp: {}", raw))?,
            ),
            None => None,
        };
        if !(self.horizon >= 0.0 && self.horizon.is_finite()) {
            anyhow::bail!("Horizon must be a non-negative number, got {}", self.horizon);
        }

        let optimizer = OptimizerConfig {
            max_iterations: self.max_iters,
            tolerance: self.tolerance,
            accept_boundary: self.accept_boundary,
            ..OptimizerConfig::default()
        };
        optimizer.validate()?;

        Ok(PipelineConfig {
            unit: self.unit,
            cutoff,
            timing_model: self.model,
            spend_basis: self.spend_basis,
            optimizer,
            scoring: ScoringConfig {
                horizon: self.horizon,
                ..ScoringConfig::default()
            },
            ..PipelineConfig::default()
        })
    }
}
