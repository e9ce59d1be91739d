//! Bounded Nelder-Mead maximisation of log-likelihoods over positive parameters
//!
//! Parameters are searched in log space, so positivity holds everywhere, and
//! are capped at [`OptimizerConfig::max_param_value`] on the way back. Points
//! where the likelihood is not finite are treated as infinitely bad.

use std::time::{Duration, Instant};

use ndarray::Array1;
use tracing::{debug, warn};

use crate::error::{ClvError, Result};

/// Stopping rules and search settings for [`maximize`].
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Iteration budget summed over all restarts.
    ///
    /// A restart that runs out of budget after an earlier round converged
    /// ends the search with that earlier optimum.
    pub max_iterations: usize,
    /// Converged once the simplex's log-likelihood spread, relative to the best
    /// value, drops to this.
    pub tolerance: f64,
    /// Edge length of the starting simplex, in log-parameter units.
    pub initial_step: f64,
    /// Fresh simplexes built around the optimum after the first convergence.
    pub max_restarts: usize,
    /// Upper cap applied to every parameter.
    pub max_param_value: f64,
    /// Return optima with parameters pinned at `max_param_value` instead of
    /// failing. The pinned indices are listed in [`Optimum::at_bound`].
    pub accept_boundary: bool,
    /// Optional wall-clock limit.
    pub time_budget: Option<Duration>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5_000,
            tolerance: 1e-6,
            initial_step: 0.5,
            max_restarts: 3,
            max_param_value: 10_000.0,
            accept_boundary: false,
            time_budget: None,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ClvError::invalid("optimizer needs at least one iteration"));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(ClvError::invalid(format!(
                "optimizer tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if !(self.initial_step > 0.0 && self.initial_step.is_finite()) {
            return Err(ClvError::invalid("optimizer step must be positive"));
        }
        if !(self.max_param_value > 0.0) {
            return Err(ClvError::invalid("parameter cap must be positive"));
        }
        Ok(())
    }
}

/// Relative distance below the cap at which a parameter counts as pinned.
const BOUNDARY_MARGIN: f64 = 1e-3;

/// Result of a converged maximisation.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimum {
    pub params: Vec<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub restarts: usize,
    /// Best log-likelihood after each iteration. Never decreases.
    pub trace: Vec<f64>,
    /// Indices of parameters sitting at the cap.
    pub at_bound: Vec<usize>,
}

/// Fitted parameters of a model together with how the fit went.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport<P> {
    pub params: P,
    pub log_likelihood: f64,
    /// Customers that contributed to the likelihood.
    pub customers: usize,
    pub iterations: usize,
    pub restarts: usize,
    pub trace: Vec<f64>,
    /// Parameters that ended at the cap. Empty unless the fit was run with
    /// [`OptimizerConfig::accept_boundary`].
    pub at_bound: Vec<usize>,
}

/// Maximise `log_likelihood` over strictly positive parameters starting from
/// `initial`.
///
/// Fails with [`ClvError::Convergence`] when the iteration or time budget runs
/// out before the first simplex settles, or when the optimum lies at the
/// parameter cap and the config does not accept boundary optima.
pub fn maximize<F>(
    log_likelihood: F,
    initial: &[f64],
    config: &OptimizerConfig,
) -> Result<Optimum>
where
    F: Fn(&[f64]) -> f64,
{
    config.validate()?;
    if initial.is_empty() {
        return Err(ClvError::invalid("no parameters to optimise"));
    }
    if let Some(bad) = initial.iter().find(|p| !(**p > 0.0 && p.is_finite())) {
        return Err(ClvError::invalid(format!(
            "initial parameters must be positive, got {bad}"
        )));
    }

    let to_params = |theta: &Array1<f64>| -> Vec<f64> {
        theta
            .iter()
            .map(|t| t.exp().min(config.max_param_value))
            .collect()
    };
    let objective = |theta: &Array1<f64>| -> f64 {
        let ll = log_likelihood(&to_params(theta));
        if ll.is_finite() {
            -ll
        } else {
            f64::INFINITY
        }
    };

    let mut best: Array1<f64> = initial.iter().map(|p| p.ln()).collect();
    let mut best_value = objective(&best);
    if !best_value.is_finite() {
        return Err(ClvError::invalid(
            "log-likelihood is not finite at the initial parameters",
        ));
    }

    let started = Instant::now();
    let mut search = Search {
        config,
        started,
        iterations: 0,
        trace: Vec::new(),
    };
    let mut restarts = 0;

    for round in 0..=config.max_restarts {
        let kept_trace = search.trace.len();
        let (vertex, value) = match search.run(&objective, &best) {
            Ok(found) => found,
            Err(err) if round > 0 => {
                warn!(round, %err, "restart stopped, keeping the previous optimum");
                search.trace.truncate(kept_trace);
                break;
            }
            Err(err) => return Err(err),
        };
        let improved = value < best_value - config.tolerance * (best_value.abs() + 1e-12);
        debug!(
            round,
            iterations = search.iterations,
            log_likelihood = -value,
            improved,
            "simplex converged"
        );
        best = vertex;
        best_value = value;
        if round > 0 {
            restarts += 1;
            if !improved {
                break;
            }
        }
    }

    let params = to_params(&best);
    let at_bound: Vec<usize> = params
        .iter()
        .enumerate()
        .filter(|(_, p)| **p >= config.max_param_value * (1.0 - BOUNDARY_MARGIN))
        .map(|(i, _)| i)
        .collect();
    if !at_bound.is_empty() {
        warn!(?at_bound, cap = config.max_param_value, "optimum pinned at the parameter cap");
        if !config.accept_boundary {
            return Err(ClvError::Convergence {
                iterations: search.iterations,
                reason: format!(
                    "parameters {at_bound:?} pinned at the cap of {}",
                    config.max_param_value
                ),
            });
        }
    }

    Ok(Optimum {
        params,
        log_likelihood: -best_value,
        iterations: search.iterations,
        restarts,
        trace: search.trace,
        at_bound,
    })
}

struct Search<'a> {
    config: &'a OptimizerConfig,
    started: Instant,
    iterations: usize,
    trace: Vec<f64>,
}

impl Search<'_> {
    /// One Nelder-Mead run from a fresh simplex around `start`.
    fn run<F>(&mut self, objective: &F, start: &Array1<f64>) -> Result<(Array1<f64>, f64)>
    where
        F: Fn(&Array1<f64>) -> f64,
    {
        let n = start.len();
        let mut simplex: Vec<(Array1<f64>, f64)> = Vec::with_capacity(n + 1);
        simplex.push((start.clone(), objective(start)));
        for i in 0..n {
            let mut vertex = start.clone();
            vertex[i] += self.config.initial_step;
            let value = objective(&vertex);
            simplex.push((vertex, value));
        }

        loop {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
            let best = simplex[0].1;
            let worst = simplex[n].1;
            self.trace.push(-best);

            if (worst - best).abs() <= self.config.tolerance * (best.abs() + 1e-12) {
                let (vertex, value) = simplex.swap_remove(0);
                return Ok((vertex, value));
            }

            self.iterations += 1;
            if self.iterations > self.config.max_iterations {
                return Err(ClvError::Convergence {
                    iterations: self.config.max_iterations,
                    reason: format!(
                        "iteration budget exhausted with log-likelihood spread {}",
                        worst - best
                    ),
                });
            }
            if let Some(budget) = self.config.time_budget {
                if self.started.elapsed() > budget {
                    return Err(ClvError::Convergence {
                        iterations: self.iterations,
                        reason: format!("time budget of {budget:?} exhausted"),
                    });
                }
            }

            let centroid = simplex[..n]
                .iter()
                .fold(Array1::<f64>::zeros(n), |acc, (v, _)| acc + v)
                / n as f64;
            let worst_vertex = simplex[n].0.clone();

            let reflected = &centroid + &(&centroid - &worst_vertex);
            let reflected_value = objective(&reflected);

            if reflected_value < best {
                let expanded = &centroid + &((&centroid - &worst_vertex) * 2.0);
                let expanded_value = objective(&expanded);
                simplex[n] = if expanded_value < reflected_value {
                    (expanded, expanded_value)
                } else {
                    (reflected, reflected_value)
                };
                continue;
            }
            if reflected_value < simplex[n - 1].1 {
                simplex[n] = (reflected, reflected_value);
                continue;
            }

            let (contracted, accept) = if reflected_value < worst {
                let outside = &centroid + &((&reflected - &centroid) * 0.5);
                let value = objective(&outside);
                ((outside, value), value <= reflected_value)
            } else {
                let inside = &centroid + &((&worst_vertex - &centroid) * 0.5);
                let value = objective(&inside);
                ((inside, value), value < worst)
            };
            if accept {
                simplex[n] = contracted;
                continue;
            }

            // Shrink towards the best vertex.
            let anchor = simplex[0].0.clone();
            for entry in simplex.iter_mut().skip(1) {
                let shrunk = &anchor + &((&entry.0 - &anchor) * 0.5);
                let value = objective(&shrunk);
                *entry = (shrunk, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_maximum_of_concave_function() {
        // Peak of -1 at (2, 0.5)
        let ll = |p: &[f64]| -1.0 - ((p[0] - 2.0).powi(2) + 3.0 * (p[1] - 0.5).powi(2));
        let config = OptimizerConfig {
            tolerance: 1e-10,
            ..OptimizerConfig::default()
        };
        let optimum = maximize(ll, &[1.0, 1.0], &config).unwrap();
        assert!((optimum.params[0] - 2.0).abs() < 1e-3);
        assert!((optimum.params[1] - 0.5).abs() < 1e-3);
        assert!(optimum.log_likelihood <= -1.0);
    }

    #[test]
    fn test_trace_never_decreases() {
        let ll = |p: &[f64]| {
            -(p[0] - 3.0).powi(2) - (p[1] * p[2] - 1.0).powi(2) - (p[2] - 0.2).powi(2) - 1.0
        };
        let optimum = maximize(ll, &[1.0, 1.0, 1.0], &OptimizerConfig::default()).unwrap();
        assert!(!optimum.trace.is_empty());
        assert!(optimum.trace.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*optimum.trace.last().unwrap(), optimum.log_likelihood);
    }

    #[test]
    fn test_parameters_capped() {
        // Increasing without bound in the first parameter
        let ll = |p: &[f64]| p[0].ln() - (p[1] - 1.0).powi(2);
        let config = OptimizerConfig {
            max_param_value: 50.0,
            accept_boundary: true,
            ..OptimizerConfig::default()
        };
        let optimum = maximize(ll, &[1.0, 2.0], &config).unwrap();
        assert_eq!(optimum.params[0], 50.0);
        assert!((optimum.params[1] - 1.0).abs() < 1e-2);
        assert_eq!(optimum.at_bound, vec![0]);
    }

    #[test]
    fn test_boundary_optimum_rejected_by_default() {
        let ll = |p: &[f64]| p[0].ln() - (p[1] - 1.0).powi(2);
        let config = OptimizerConfig {
            max_param_value: 50.0,
            ..OptimizerConfig::default()
        };
        let err = maximize(ll, &[1.0, 2.0], &config).unwrap_err();
        match err {
            ClvError::Convergence { reason, .. } => assert!(reason.contains("[0]")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_interior_optimum_has_no_bound() {
        let ll = |p: &[f64]| -1.0 - ((p[0] - 2.0).powi(2) + 3.0 * (p[1] - 0.5).powi(2));
        let optimum = maximize(ll, &[1.0, 1.0], &OptimizerConfig::default()).unwrap();
        assert!(optimum.at_bound.is_empty());
    }

    #[test]
    fn test_restart_out_of_budget_keeps_converged_optimum() {
        let ll = |p: &[f64]| -1.0 - ((p[0] - 2.0).powi(2) + 3.0 * (p[1] - 0.5).powi(2));
        let single = OptimizerConfig {
            tolerance: 1e-10,
            max_restarts: 0,
            ..OptimizerConfig::default()
        };
        let first_round = maximize(ll, &[1.0, 1.0], &single).unwrap();

        // Enough budget for the first simplex, not for a restart
        let config = OptimizerConfig {
            max_iterations: first_round.iterations + 1,
            max_restarts: 3,
            ..single
        };
        let optimum = maximize(ll, &[1.0, 1.0], &config).unwrap();
        assert_eq!(optimum.params, first_round.params);
        assert_eq!(optimum.log_likelihood, first_round.log_likelihood);
        assert_eq!(optimum.restarts, 0);
        assert_eq!(optimum.trace, first_round.trace);
    }

    #[test]
    fn test_iteration_budget_exhaustion() {
        let ll = |p: &[f64]| -((p[0] - 7.0).powi(2) + (p[1] - 0.01).powi(2));
        let config = OptimizerConfig {
            max_iterations: 3,
            tolerance: 1e-14,
            ..OptimizerConfig::default()
        };
        let err = maximize(ll, &[1.0, 1.0], &config).unwrap_err();
        assert!(matches!(err, ClvError::Convergence { iterations: 3, .. }));
    }

    #[test]
    fn test_time_budget_exhaustion() {
        let ll = |p: &[f64]| {
            std::thread::sleep(Duration::from_millis(2));
            -((p[0] - 7.0).powi(2) + (p[1] - 0.01).powi(2))
        };
        let config = OptimizerConfig {
            tolerance: 1e-14,
            time_budget: Some(Duration::from_millis(1)),
            ..OptimizerConfig::default()
        };
        let err = maximize(ll, &[1.0, 1.0], &config).unwrap_err();
        assert!(matches!(err, ClvError::Convergence { .. }));
    }

    #[test]
    fn test_rejects_bad_start() {
        let ll = |p: &[f64]| -p[0];
        let config = OptimizerConfig::default();
        assert!(matches!(
            maximize(ll, &[0.0], &config),
            Err(ClvError::InvalidInput(_))
        ));
        assert!(maximize(ll, &[], &config).is_err());
        assert!(maximize(|_| f64::NAN, &[1.0], &config).is_err());
    }
}
