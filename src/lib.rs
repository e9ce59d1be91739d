//! ClvForge: customer lifetime value estimation from transaction logs
//!
//! Raw purchase events are folded into per-customer sufficient statistics, a
//! purchase-timing model (Pareto/NBD or BG/NBD) and a gamma-gamma spend model
//! are fitted by maximum likelihood, and every customer is scored and tiered
//! by predicted value over a horizon.

pub mod aggregate;
pub mod cli;
pub mod data;
pub mod error;
pub mod optimize;
pub mod pipeline;
pub mod score;
pub mod source;
pub mod special;
pub mod spend;
pub mod split;
pub mod timing;
pub mod validate;

// Re-export public items for easier access
pub use aggregate::{aggregate, CustomerLedger, CustomerSufficientStatistics, HoldoutStatistics};
pub use cli::Args;
pub use data::{load_events, EventColumns, TimeUnit, TransactionEvent};
pub use error::{ClvError, Result};
pub use optimize::{FitReport, OptimizerConfig};
pub use pipeline::{run, run_paged, ClvReport, PipelineConfig};
pub use score::{score, CustomerValueEstimate, ScoringConfig, Tier, ValueTable};
pub use source::{Connector, PageConnection, PagedLog};
pub use spend::{fit_spend, spend_observations, SpendBasis, SpendModelParams, SpendObservation};
pub use split::{split, CalibrationSplit};
pub use timing::{fit_purchase_timing, PurchaseTimingParams, TimingModel};
pub use validate::{validate_holdout, HoldoutReport};
