//! Damped Gauss-Newton (Levenberg-Marquardt) minimizer.
//!
//! Each iteration solves `(H + lambda * diag(H)) delta = -g` and accepts the
//! step only if the cost drops; rejections raise the damping, acceptances
//! lower it. A numeric failure anywhere inside a trial step (tie evaluation,
//! residuals or the gradient at the trial point) rejects that step rather
//! than aborting the fit, and the best parameters seen are restored into the
//! tree on every exit path, hard errors included.

use std::fmt;

use ndarray::{Array1, Array2};
use serde_json::json;

use crate::cost::LeastSquaresCost;
use crate::covariance::{self, DEFAULT_EPSREL};
use crate::diagnostics::{Diagnostics, WarningKind};
use crate::error::{FitError, Result};
use crate::model::ParamRecord;
use crate::utils::finite_difference::DiffMethod;
use crate::utils::linalg::solve_damped;

/// Tuning knobs for the minimizer.
#[derive(Debug, Clone)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Relative cost decrease below which the fit is converged.
    pub ftol: f64,
    /// Relative step size below which the fit is converged.
    pub xtol: f64,
    /// Gradient infinity norm below which the fit is converged.
    pub gtol: f64,
    pub initial_lambda: f64,
    pub lambda_up_factor: f64,
    pub lambda_down_factor: f64,
    pub min_lambda: f64,
    pub max_lambda: f64,
    /// Rejected trial steps allowed per iteration before giving up.
    pub max_step_retries: usize,
    pub diff_method: DiffMethod,
    /// Relative singular value cutoff for the covariance pseudo-inverse.
    pub epsrel: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-8,
            initial_lambda: 1e-3,
            lambda_up_factor: 10.0,
            lambda_down_factor: 0.1,
            min_lambda: 1e-10,
            max_lambda: 1e10,
            max_step_retries: 20,
            diff_method: DiffMethod::default(),
            epsrel: DEFAULT_EPSREL,
        }
    }
}

/// Terminal state of a minimization. Not reaching the minimum is a result,
/// not an error: the caller still gets the best parameters found.
#[derive(Debug, Clone, PartialEq)]
pub enum MinimizerStatus {
    Converged,
    Failed(String),
    MaxIterationsExceeded,
}

impl fmt::Display for MinimizerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "success"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::MaxIterationsExceeded => write!(f, "maximum iterations exceeded"),
        }
    }
}

/// Everything a fit produces besides the updated tree itself.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub status: MinimizerStatus,
    pub chi2: f64,
    pub dof: usize,
    pub reduced_chi2: f64,
    pub iterations: usize,
    pub func_evals: usize,
    /// Flattened parameter table at the best point, errors included.
    pub params: Vec<ParamRecord>,
    /// Full-parameter covariance, `None` unless the fit converged.
    pub covariance: Option<Array2<f64>>,
    pub diagnostics: Diagnostics,
}

impl FitReport {
    pub fn success(&self) -> bool {
        self.status == MinimizerStatus::Converged
    }

    /// JSON rendering for persistence or downstream tooling.
    pub fn to_json(&self) -> Result<String> {
        let covariance = self
            .covariance
            .as_ref()
            .map(|c| c.rows().into_iter().map(|r| r.to_vec()).collect::<Vec<_>>());
        let value = json!({
            "status": self.status.to_string(),
            "chi2": self.chi2,
            "dof": self.dof,
            "reduced_chi2": self.reduced_chi2,
            "iterations": self.iterations,
            "func_evals": self.func_evals,
            "params": serde_json::to_value(&self.params)
                .map_err(|e| FitError::Other(e.to_string()))?,
            "covariance": covariance,
            "warnings": self
                .diagnostics
                .warnings()
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&value).map_err(|e| FitError::Other(e.to_string()))
    }
}

impl fmt::Display for FitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fit result: {}", self.status)?;
        writeln!(
            f,
            "  chi2 = {:.6e}, dof = {}, reduced chi2 = {:.6e}",
            self.chi2, self.dof, self.reduced_chi2
        )?;
        writeln!(
            f,
            "  {} iterations, {} function evaluations",
            self.iterations, self.func_evals
        )?;
        for p in &self.params {
            let flag = if p.tied {
                " (tied)"
            } else if !p.active {
                " (fixed)"
            } else {
                ""
            };
            writeln!(
                f,
                "  {} = {:.6} +/- {:.6}{}",
                p.name, p.value, p.stderr, flag
            )?;
        }
        for w in self.diagnostics.warnings() {
            writeln!(f, "  warning: {}", w)?;
        }
        Ok(())
    }
}

/// The minimizer itself. Owns only its configuration; every `minimize` call
/// works on the cost function it is handed.
#[derive(Debug, Clone, Default)]
pub struct Levenberg {
    config: LmConfig,
}

impl Levenberg {
    pub fn new(config: LmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    /// Run the fit. Errors only on unusable setups (no active parameters,
    /// non-finite starting cost, structural misuse); everything else is
    /// reported through `MinimizerStatus`. The tree holds the best
    /// parameters seen even when an error escapes mid-fit.
    pub fn minimize(&self, cost: &mut LeastSquaresCost) -> Result<FitReport> {
        let mut best = None;
        let result = self.run(cost, &mut best);
        if result.is_err() {
            if let Some(best_p) = best {
                let _ = cost.set_active_params(&best_p);
            }
        }
        result
    }

    /// Raise the damping; false once it exceeds its ceiling.
    fn raise_lambda(&self, lambda: &mut f64) -> bool {
        *lambda *= self.config.lambda_up_factor;
        *lambda <= self.config.max_lambda
    }

    fn run(
        &self,
        cost: &mut LeastSquaresCost,
        best: &mut Option<Array1<f64>>,
    ) -> Result<FitReport> {
        let cfg = &self.config;
        let mut diagnostics = Diagnostics::new();

        let n_active = cost.n_params()?;
        if n_active == 0 {
            return Err(FitError::NothingToFit);
        }
        cost.set_diff_method(cfg.diff_method);
        cost.enforce_constraints()?;

        let mut p = cost.active_params()?;
        *best = Some(p.clone());

        let mut current_cost = cost.cost()?;
        if !current_cost.is_finite() {
            return Err(FitError::NumericFailure(
                "initial cost is not finite".to_string(),
            ));
        }
        let mut best_cost = current_cost;
        let mut func_evals = 1;
        let mut iterations = 0;
        let mut lambda = cfg.initial_lambda;
        let mut status = MinimizerStatus::MaxIterationsExceeded;

        // A perturbed Jacobian point can leave the model's domain even when
        // the starting cost is fine; that is a failed fit at the starting
        // point, not a hard error.
        let mut gradient = Array1::zeros(n_active);
        let mut hessian = Array2::zeros((n_active, n_active));
        let mut gradient_ok = false;
        match cost.cost_grad_hess() {
            Ok((c, g, h)) => {
                current_cost = c;
                gradient = g;
                hessian = h;
                func_evals += n_active;
                gradient_ok = true;
            }
            Err(FitError::NumericFailure(reason)) => {
                status = MinimizerStatus::Failed(format!(
                    "gradient unusable at the starting point: {}",
                    reason
                ));
            }
            Err(e) => return Err(e),
        }

        if gradient_ok {
            'outer: for _ in 0..cfg.max_iterations {
                iterations += 1;

                let g_norm = gradient.iter().fold(0.0f64, |m, &v| m.max(v.abs()));
                if g_norm <= cfg.gtol {
                    status = MinimizerStatus::Converged;
                    break;
                }

                let mut accepted = false;
                for _ in 0..=cfg.max_step_retries {
                    let Some(delta) = solve_damped(hessian.view(), gradient.view(), lambda)?
                    else {
                        if !self.raise_lambda(&mut lambda) {
                            status = MinimizerStatus::Failed(
                                "damping exceeded its maximum on a singular system".to_string(),
                            );
                            break 'outer;
                        }
                        continue;
                    };

                    // A tie can fail on a trial vector (division by zero);
                    // that rejects the step like any other numeric failure.
                    let trial_p = &p + &delta;
                    if let Err(e) = cost.set_active_params(&trial_p) {
                        match e {
                            FitError::NumericFailure(_) => {
                                cost.set_active_params(&p)?;
                                if !self.raise_lambda(&mut lambda) {
                                    status = MinimizerStatus::Failed(
                                        "no usable step found before damping ran out".to_string(),
                                    );
                                    break 'outer;
                                }
                                continue;
                            }
                            e => return Err(e),
                        }
                    }
                    func_evals += 1;
                    let trial_cost = match cost.cost() {
                        Ok(c) if c.is_finite() => c,
                        Ok(_) | Err(FitError::NumericFailure(_)) => {
                            cost.set_active_params(&p)?;
                            if !self.raise_lambda(&mut lambda) {
                                status = MinimizerStatus::Failed(
                                    "no finite step found before damping ran out".to_string(),
                                );
                                break 'outer;
                            }
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    if trial_cost >= current_cost {
                        cost.set_active_params(&p)?;
                        if !self.raise_lambda(&mut lambda) {
                            status = MinimizerStatus::Failed(
                                "no downhill step found before damping ran out".to_string(),
                            );
                            break 'outer;
                        }
                        continue;
                    }

                    // Downhill step. Commit only once the gradient at the
                    // trial point is usable; otherwise roll the acceptance
                    // back and retry with more damping.
                    match cost.cost_grad_hess() {
                        Ok((c, g, h)) => {
                            let decrease = current_cost - trial_cost;
                            let small_decrease =
                                decrease <= cfg.ftol * current_cost.max(f64::EPSILON);
                            let small_step = delta
                                .iter()
                                .zip(p.iter())
                                .all(|(d, pv)| d.abs() <= cfg.xtol * (pv.abs() + cfg.xtol));

                            p = trial_p;
                            current_cost = c;
                            gradient = g;
                            hessian = h;
                            func_evals += n_active;
                            if current_cost < best_cost {
                                best_cost = current_cost;
                                *best = Some(p.clone());
                            }
                            lambda = (lambda * cfg.lambda_down_factor).max(cfg.min_lambda);
                            accepted = true;

                            if small_decrease || small_step {
                                status = MinimizerStatus::Converged;
                                break 'outer;
                            }
                            break;
                        }
                        Err(FitError::NumericFailure(_)) => {
                            cost.set_active_params(&p)?;
                            if !self.raise_lambda(&mut lambda) {
                                status = MinimizerStatus::Failed(
                                    "gradient unusable near every accepted step".to_string(),
                                );
                                break 'outer;
                            }
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }

                if !accepted {
                    status = MinimizerStatus::Failed(format!(
                        "no acceptable step within {} retries",
                        cfg.max_step_retries
                    ));
                    break;
                }
            }
        }

        // Whatever happened, leave the tree at the best point seen.
        let best_p = best.clone().unwrap_or_else(|| p.clone());
        cost.set_active_params(&best_p)?;
        let chi2 = cost.chi_squared()?;
        let dof = cost.n_residuals().saturating_sub(n_active).max(1);
        let reduced_chi2 = chi2 / dof as f64;

        let mut full_cov = None;
        if status == MinimizerStatus::Converged {
            match cost.jacobian() {
                Ok(jac) => {
                    let mut active_cov =
                        covariance::covariance(jac.view(), cfg.epsrel, &mut diagnostics)?;
                    // Scale by the reduced chi2 so unit-weight fits still get
                    // meaningful errors.
                    active_cov.mapv_inplace(|v| v * reduced_chi2);
                    let errors = covariance::standard_errors(&active_cov);

                    let map = cost.active_ordinals()?.to_vec();
                    let tree = cost.tree_mut()?;
                    for ordinal in 0..tree.n_params() {
                        tree.set_stderr(ordinal, 0.0)?;
                    }
                    for (pos, &ordinal) in map.iter().enumerate() {
                        tree.set_stderr(ordinal, errors[pos])?;
                    }
                    full_cov = Some(covariance::to_full_covariance(cost, &active_cov)?);
                }
                Err(FitError::NumericFailure(reason)) => {
                    diagnostics.warn(
                        WarningKind::DegenerateCovariance,
                        format!("covariance not computed: {}", reason),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let params = cost.tree()?.parameter_table()?;
        Ok(FitReport {
            status,
            chi2,
            dof,
            reduced_chi2,
            iterations,
            func_evals,
            params,
            covariance: full_cov,
            diagnostics,
        })
    }
}
