//! Purchase-timing models: Pareto/NBD and BG/NBD
//!
//! Both describe an active customer buying as a Poisson process whose rate is
//! gamma distributed across customers, and differ in how customers drop out:
//! Pareto/NBD uses an exponential lifetime with gamma-distributed dropout
//! rates, BG/NBD a coin flip after every purchase with beta-distributed
//! dropout probabilities.

use std::collections::BTreeMap;

use tracing::info;

use crate::aggregate::CustomerSufficientStatistics;
use crate::error::{ClvError, Result};
use crate::optimize::{maximize, FitReport, OptimizerConfig};
use crate::special::{hyp2f1, hyp2f1_a_plus_one, ln_gamma, log_sum_exp};

/// Which purchase-timing model to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TimingModel {
    #[default]
    #[value(name = "pnbd")]
    ParetoNbd,
    #[value(name = "bgnbd")]
    BgNbd,
}

impl TimingModel {
    /// Starting point used when the caller gives none.
    pub const DEFAULT_START: [f64; 4] = [1.0, 1.0, 1.0, 1.0];

    fn params_from(self, p: &[f64]) -> PurchaseTimingParams {
        match self {
            TimingModel::ParetoNbd => PurchaseTimingParams::ParetoNbd(ParetoNbdParams {
                r: p[0],
                alpha: p[1],
                s: p[2],
                beta: p[3],
            }),
            TimingModel::BgNbd => PurchaseTimingParams::BgNbd(BgNbdParams {
                r: p[0],
                alpha: p[1],
                a: p[2],
                b: p[3],
            }),
        }
    }
}

/// Pareto/NBD parameters: purchase rate ~ Gamma(r, alpha), dropout rate ~ Gamma(s, beta).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParetoNbdParams {
    pub r: f64,
    pub alpha: f64,
    pub s: f64,
    pub beta: f64,
}

/// BG/NBD parameters: purchase rate ~ Gamma(r, alpha), dropout probability ~ Beta(a, b).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BgNbdParams {
    pub r: f64,
    pub alpha: f64,
    pub a: f64,
    pub b: f64,
}

/// Fitted purchase-timing model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PurchaseTimingParams {
    ParetoNbd(ParetoNbdParams),
    BgNbd(BgNbdParams),
}

impl ParetoNbdParams {
    /// Shared pieces of the likelihood and P(alive): the log of
    /// `(max(alpha, beta) + t_x)^-(r+s+x) * [F(t_x) - F(T) ((max + t_x) / (max + T))^(r+s+x)]`.
    fn log_a0(&self, x: f64, t_x: f64, t_cal: f64) -> f64 {
        let Self { r, alpha, s, beta } = *self;
        let max_ab = alpha.max(beta);
        let abs_ab = (alpha - beta).abs();
        let param2 = if alpha < beta { r + x } else { s + 1.0 };
        let rsx = r + s + x;

        let f1 = hyp2f1_a_plus_one(rsx, param2, abs_ab / (max_ab + t_x));
        let f2 = hyp2f1_a_plus_one(rsx, param2, abs_ab / (max_ab + t_cal))
            * ((max_ab + t_x) / (max_ab + t_cal)).powf(rsx);
        let diff = f1 - f2;
        if diff.is_nan() {
            return f64::NAN;
        }
        if diff <= 0.0 {
            return f64::NEG_INFINITY;
        }
        -rsx * (max_ab + t_x).ln() + diff.ln()
    }

    pub fn log_likelihood(&self, x: f64, t_x: f64, t_cal: f64) -> f64 {
        let Self { r, alpha, s, beta } = *self;
        let head = r * alpha.ln() + s * beta.ln() - ln_gamma(r) + ln_gamma(r + x);
        let alive = -(r + x) * (alpha + t_cal).ln() - s * (beta + t_cal).ln();
        let dropped = s.ln() - (r + s + x).ln() + self.log_a0(x, t_x, t_cal);
        head + log_sum_exp(alive, dropped)
    }

    pub fn p_alive(&self, x: f64, t_x: f64, t_cal: f64) -> f64 {
        let Self { r, alpha, s, beta } = *self;
        let log_f0 = (r + x) * (alpha + t_cal).ln() + s * (beta + t_cal).ln();
        let log_term = (s / (r + s + x)).ln() + log_f0 + self.log_a0(x, t_x, t_cal);
        1.0 / (1.0 + log_term.exp())
    }

    /// Expected purchases in `(T_cal, T_cal + horizon]` given the history.
    pub fn conditional_expected_transactions(
        &self,
        x: f64,
        t_x: f64,
        t_cal: f64,
        horizon: f64,
    ) -> f64 {
        let Self { r, alpha, s, beta } = *self;
        let rate = (r + x) * (beta + t_cal) / (alpha + t_cal);
        rate * dropout_integral(s, beta + t_cal, horizon) * self.p_alive(x, t_x, t_cal)
    }

    /// Expected purchases in `(0, t]` for a customer just acquired.
    pub fn expected_transactions(&self, t: f64) -> f64 {
        let Self { r, alpha, s, beta } = *self;
        r * beta / alpha * dropout_integral(s, beta, t)
    }
}

/// `(1 - (scale / (scale + t))^(s - 1)) / (s - 1)`, with its limit at `s = 1`.
fn dropout_integral(s: f64, scale: f64, t: f64) -> f64 {
    if (s - 1.0).abs() < 1e-10 {
        ((scale + t) / scale).ln()
    } else {
        (1.0 - (scale / (scale + t)).powf(s - 1.0)) / (s - 1.0)
    }
}

impl BgNbdParams {
    pub fn log_likelihood(&self, x: f64, t_x: f64, t_cal: f64) -> f64 {
        let Self { r, alpha, a, b } = *self;
        let a1 = ln_gamma(r + x) - ln_gamma(r) + r * alpha.ln();
        let a2 = ln_gamma(a + b) + ln_gamma(b + x) - ln_gamma(b) - ln_gamma(a + b + x);
        let a3 = -(r + x) * (alpha + t_cal).ln();
        let a4 = if x > 0.0 {
            a.ln() - (b + x - 1.0).ln() - (r + x) * (alpha + t_x).ln()
        } else {
            f64::NEG_INFINITY
        };
        a1 + a2 + log_sum_exp(a3, a4)
    }

    pub fn p_alive(&self, x: f64, t_x: f64, t_cal: f64) -> f64 {
        1.0 / (1.0 + self.dropped_odds(x, t_x, t_cal))
    }

    fn dropped_odds(&self, x: f64, t_x: f64, t_cal: f64) -> f64 {
        let Self { r, alpha, a, b } = *self;
        if x > 0.0 {
            a / (b + x - 1.0) * ((alpha + t_cal) / (alpha + t_x)).powf(r + x)
        } else {
            0.0
        }
    }

    /// `a = 1` is a removable singularity of both expectations; evaluate just
    /// beside it.
    fn a_off_one(&self) -> f64 {
        if (self.a - 1.0).abs() < 1e-7 {
            1.0 + 1e-7
        } else {
            self.a
        }
    }

    /// Expected purchases in `(T_cal, T_cal + horizon]` given the history.
    pub fn conditional_expected_transactions(
        &self,
        x: f64,
        t_x: f64,
        t_cal: f64,
        horizon: f64,
    ) -> f64 {
        let Self { r, alpha, b, .. } = *self;
        let a = self.a_off_one();
        let z = horizon / (alpha + t_cal + horizon);
        let tail = ((alpha + t_cal) / (alpha + t_cal + horizon)).powf(r + x)
            * hyp2f1(r + x, b + x, a + b + x - 1.0, z);
        (a + b + x - 1.0) / (a - 1.0) * (1.0 - tail) / (1.0 + self.dropped_odds(x, t_x, t_cal))
    }

    /// Expected purchases in `(0, t]` for a customer just acquired.
    pub fn expected_transactions(&self, t: f64) -> f64 {
        let Self { r, alpha, b, .. } = *self;
        let a = self.a_off_one();
        let tail = (alpha / (alpha + t)).powf(r) * hyp2f1(r, b, a + b - 1.0, t / (alpha + t));
        (a + b - 1.0) / (a - 1.0) * (1.0 - tail)
    }
}

impl PurchaseTimingParams {
    pub fn model(&self) -> TimingModel {
        match self {
            PurchaseTimingParams::ParetoNbd(_) => TimingModel::ParetoNbd,
            PurchaseTimingParams::BgNbd(_) => TimingModel::BgNbd,
        }
    }

    /// Parameters in `[r, alpha, s, beta]` / `[r, alpha, a, b]` order.
    pub fn as_array(&self) -> [f64; 4] {
        match *self {
            PurchaseTimingParams::ParetoNbd(p) => [p.r, p.alpha, p.s, p.beta],
            PurchaseTimingParams::BgNbd(p) => [p.r, p.alpha, p.a, p.b],
        }
    }

    fn log_likelihood_at(&self, x: f64, t_x: f64, t_cal: f64) -> f64 {
        match self {
            PurchaseTimingParams::ParetoNbd(p) => p.log_likelihood(x, t_x, t_cal),
            PurchaseTimingParams::BgNbd(p) => p.log_likelihood(x, t_x, t_cal),
        }
    }

    /// Log-likelihood of one customer's calibration history.
    pub fn log_likelihood(&self, row: &CustomerSufficientStatistics) -> f64 {
        self.log_likelihood_at(row.x as f64, row.t_x, row.t_cal)
    }

    pub fn total_log_likelihood(&self, rows: &[CustomerSufficientStatistics]) -> f64 {
        compress(rows)
            .iter()
            .map(|g| g.weight * self.log_likelihood_at(g.x, g.t_x, g.t_cal))
            .sum()
    }

    /// Probability the customer is still active at the end of calibration.
    pub fn p_alive(&self, row: &CustomerSufficientStatistics) -> f64 {
        let (x, t_x, t_cal) = (row.x as f64, row.t_x, row.t_cal);
        match self {
            PurchaseTimingParams::ParetoNbd(p) => p.p_alive(x, t_x, t_cal),
            PurchaseTimingParams::BgNbd(p) => p.p_alive(x, t_x, t_cal),
        }
    }

    /// Expected purchases over the next `horizon` time units.
    pub fn conditional_expected_transactions(
        &self,
        row: &CustomerSufficientStatistics,
        horizon: f64,
    ) -> f64 {
        let (x, t_x, t_cal) = (row.x as f64, row.t_x, row.t_cal);
        match self {
            PurchaseTimingParams::ParetoNbd(p) => {
                p.conditional_expected_transactions(x, t_x, t_cal, horizon)
            }
            PurchaseTimingParams::BgNbd(p) => {
                p.conditional_expected_transactions(x, t_x, t_cal, horizon)
            }
        }
    }

    /// Expected purchases in the first `t` time units of a new customer.
    pub fn expected_transactions(&self, t: f64) -> f64 {
        match self {
            PurchaseTimingParams::ParetoNbd(p) => p.expected_transactions(t),
            PurchaseTimingParams::BgNbd(p) => p.expected_transactions(t),
        }
    }
}

/// Customers sharing `(x, t_x, T_cal)` contribute identical likelihood terms.
struct Group {
    x: f64,
    t_x: f64,
    t_cal: f64,
    weight: f64,
}

fn compress(rows: &[CustomerSufficientStatistics]) -> Vec<Group> {
    let mut groups: BTreeMap<(usize, u64, u64), usize> = BTreeMap::new();
    for row in rows {
        *groups
            .entry((row.x, row.t_x.to_bits(), row.t_cal.to_bits()))
            .or_default() += 1;
    }
    groups
        .into_iter()
        .map(|((x, t_x, t_cal), count)| Group {
            x: x as f64,
            t_x: f64::from_bits(t_x),
            t_cal: f64::from_bits(t_cal),
            weight: count as f64,
        })
        .collect()
}

/// Fit a purchase-timing model by maximum likelihood.
///
/// # Arguments
/// * `rows` - Calibration-window statistics, one per customer
/// * `model` - Pareto/NBD or BG/NBD
/// * `initial` - Starting parameters; [`TimingModel::DEFAULT_START`] when `None`
/// * `config` - Optimizer stopping rules
pub fn fit_purchase_timing(
    rows: &[CustomerSufficientStatistics],
    model: TimingModel,
    initial: Option<[f64; 4]>,
    config: &OptimizerConfig,
) -> Result<FitReport<PurchaseTimingParams>> {
    if rows.is_empty() {
        return Err(ClvError::InsufficientData {
            what: "purchase-timing model",
            needed: 1,
            got: 0,
        });
    }
    for row in rows {
        row.validate()?;
    }

    let groups = compress(rows);
    let log_likelihood = |p: &[f64]| -> f64 {
        let params = model.params_from(p);
        groups
            .iter()
            .map(|g| g.weight * params.log_likelihood_at(g.x, g.t_x, g.t_cal))
            .sum()
    };

    let start = initial.unwrap_or(TimingModel::DEFAULT_START);
    let optimum = maximize(log_likelihood, &start, config)?;
    let params = model.params_from(&optimum.params);

    info!(
        ?model,
        customers = rows.len(),
        iterations = optimum.iterations,
        log_likelihood = optimum.log_likelihood,
        params = ?params.as_array(),
        "fitted purchase-timing model"
    );

    Ok(FitReport {
        params,
        log_likelihood: optimum.log_likelihood,
        customers: rows.len(),
        iterations: optimum.iterations,
        restarts: optimum.restarts,
        trace: optimum.trace,
        at_bound: optimum.at_bound,
    })
}
