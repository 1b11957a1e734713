//! Riemannian trust-region (RTR) method with truncated-CG inner solves.
//!
//! The solver is generic over [`RiemannianObjective`], which bundles everything RTR
//! needs from a smooth function on a Riemannian manifold: values, gradients, Hessian
//! actions, a preconditioner and a retraction. Evaluating the objective produces a
//! per-iterate cache (for SE-Sync, the Euclidean gradient `2YQ`) that is reused by all
//! the other operations at that iterate and dropped when the iterate changes.

use crate::{
    algorithms::tcg::{TcgParams, truncated_cg},
    error::Result,
    matrix::frobenius_inner,
    options::{SeSyncOptions, TrustRegionParams, UserFunction},
};
use faer::{Mat, MatRef};
use log::{Level, log};
use std::{fmt, time::Instant};

/// A smooth objective on a Riemannian manifold embedded in a space of matrices.
pub trait RiemannianObjective {
    /// Data computed with the objective value and reused by the other operations at
    /// the same iterate.
    type Cache;

    fn evaluate(&self, y: MatRef<'_, f64>) -> (f64, Self::Cache);

    /// Riemannian gradient at `y`.
    fn gradient(&self, y: MatRef<'_, f64>, cache: &Self::Cache) -> Mat<f64>;

    /// Riemannian Hessian at `y` applied to the tangent vector `v`.
    fn hessian_vector_product(
        &self,
        y: MatRef<'_, f64>,
        cache: &Self::Cache,
        v: MatRef<'_, f64>,
    ) -> Mat<f64>;

    /// A symmetric positive-definite approximation of the inverse Hessian applied to
    /// the tangent vector `v`.
    fn precondition(&self, y: MatRef<'_, f64>, cache: &Self::Cache, v: MatRef<'_, f64>)
    -> Mat<f64>;

    fn retract(&self, y: MatRef<'_, f64>, v: MatRef<'_, f64>) -> Result<Mat<f64>>;
}

/// Why the trust-region solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TrustRegionStatus {
    GradientNorm,
    PreconditionedGradientNorm,
    RelativeDecrease,
    Stepsize,
    TrustRegionRadius,
    IterationLimit,
    ElapsedTime,
}

impl fmt::Display for TrustRegionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TrustRegionStatus::GradientNorm => "gradient norm below tolerance",
            TrustRegionStatus::PreconditionedGradientNorm => {
                "preconditioned gradient norm below tolerance"
            }
            TrustRegionStatus::RelativeDecrease => "relative decrease below tolerance",
            TrustRegionStatus::Stepsize => "step size below tolerance",
            TrustRegionStatus::TrustRegionRadius => "trust-region radius collapsed",
            TrustRegionStatus::IterationLimit => "iteration limit reached",
            TrustRegionStatus::ElapsedTime => "time budget exhausted",
        };
        f.write_str(text)
    }
}

/// Stopping criteria and parameters of one RTR run.
#[derive(Clone)]
pub struct TrustRegionOptions {
    pub max_iterations: usize,
    pub max_tcg_iterations: usize,
    pub grad_norm_tol: f64,
    pub preconditioned_grad_norm_tol: f64,
    pub rel_func_decrease_tol: f64,
    pub stepsize_tol: f64,
    /// Time budget of this run, in seconds.
    pub max_computation_time: f64,
    pub stpcg_kappa: f64,
    pub stpcg_theta: f64,
    pub params: TrustRegionParams,
    pub log_iterates: bool,
    pub verbose: bool,
    pub user_function: Option<UserFunction>,
}

impl TrustRegionOptions {
    /// Extracts the trust-region settings of an SE-Sync run, with the given time budget.
    pub fn from_sesync(options: &SeSyncOptions, time_budget: f64) -> Self {
        Self {
            max_iterations: options.max_iterations,
            max_tcg_iterations: options.max_tcg_iterations,
            grad_norm_tol: options.grad_norm_tol,
            preconditioned_grad_norm_tol: options.preconditioned_grad_norm_tol,
            rel_func_decrease_tol: options.rel_func_decrease_tol,
            stepsize_tol: options.stepsize_tol,
            max_computation_time: time_budget,
            stpcg_kappa: options.stpcg_kappa,
            stpcg_theta: options.stpcg_theta,
            params: options.trust_region,
            log_iterates: options.log_iterates,
            verbose: options.verbose,
            user_function: options.user_function.clone(),
        }
    }
}

impl Default for TrustRegionOptions {
    fn default() -> Self {
        Self::from_sesync(&SeSyncOptions::default(), f64::INFINITY)
    }
}

/// Read-only view of the solver state handed to the user function.
#[derive(Debug, Clone, Copy)]
pub struct TrustRegionSnapshot<'a> {
    pub iteration: usize,
    pub elapsed: f64,
    pub iterate: MatRef<'a, f64>,
    pub gradient: MatRef<'a, f64>,
    pub objective: f64,
    pub gradient_norm: f64,
    pub preconditioned_gradient_norm: f64,
    pub radius: f64,
    pub hessian_vector_products: usize,
}

/// Output of [`riemannian_trust_region`].
///
/// The time series have one entry for the initial iterate plus one per accepted step.
#[derive(Debug, Clone)]
pub struct TrustRegionResult {
    pub x: Mat<f64>,
    pub f: f64,
    pub grad_norm: f64,
    pub preconditioned_grad_norm: f64,
    pub objective_values: Vec<f64>,
    pub gradient_norms: Vec<f64>,
    pub preconditioned_gradient_norms: Vec<f64>,
    /// Cumulative number of Hessian-vector products.
    pub hessian_vector_products: Vec<usize>,
    /// Seconds since the start of the run.
    pub elapsed_times: Vec<f64>,
    /// Accepted iterates, recorded only when iterate logging is enabled.
    pub iterates: Vec<Mat<f64>>,
    pub iterations: usize,
    pub status: TrustRegionStatus,
    pub elapsed: f64,
}

struct Iterate<C> {
    x: Mat<f64>,
    f: f64,
    cache: C,
    gradient: Mat<f64>,
    gradient_norm: f64,
    preconditioned_gradient_norm: f64,
}

impl<C> Iterate<C> {
    fn new<O: RiemannianObjective<Cache = C>>(objective: &O, x: Mat<f64>, f: f64, cache: C) -> Self {
        let gradient = objective.gradient(x.as_ref(), &cache);
        let gradient_norm = gradient.norm_l2();
        let preconditioned_gradient_norm = objective
            .precondition(x.as_ref(), &cache, gradient.as_ref())
            .norm_l2();
        Self {
            x,
            f,
            cache,
            gradient,
            gradient_norm,
            preconditioned_gradient_norm,
        }
    }
}

/// Minimizes `objective` starting from `x0` with the Riemannian trust-region method.
///
/// A proposed step is accepted only if the ratio of actual to predicted decrease
/// exceeds `eta1` *and* the objective strictly decreased, so the recorded objective
/// values are non-increasing.
pub fn riemannian_trust_region<O: RiemannianObjective>(
    objective: &O,
    x0: MatRef<'_, f64>,
    options: &TrustRegionOptions,
) -> Result<TrustRegionResult> {
    let start = Instant::now();
    let level = if options.verbose {
        Level::Debug
    } else {
        Level::Trace
    };
    let params = &options.params;

    let (f0, cache0) = objective.evaluate(x0);
    let mut current = Iterate::new(objective, x0.to_owned(), f0, cache0);

    let mut result = TrustRegionResult {
        x: Mat::zeros(0, 0),
        f: current.f,
        grad_norm: current.gradient_norm,
        preconditioned_grad_norm: current.preconditioned_gradient_norm,
        objective_values: vec![current.f],
        gradient_norms: vec![current.gradient_norm],
        preconditioned_gradient_norms: vec![current.preconditioned_gradient_norm],
        hessian_vector_products: vec![0],
        elapsed_times: vec![start.elapsed().as_secs_f64()],
        iterates: if options.log_iterates {
            vec![current.x.clone()]
        } else {
            Vec::new()
        },
        iterations: 0,
        status: TrustRegionStatus::IterationLimit,
        elapsed: 0.0,
    };

    let mut radius = params.initial_radius;
    let mut total_hessian_products = 0;

    let status = loop {
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed >= options.max_computation_time {
            break TrustRegionStatus::ElapsedTime;
        }
        if current.gradient_norm < options.grad_norm_tol {
            break TrustRegionStatus::GradientNorm;
        }
        if current.preconditioned_gradient_norm < options.preconditioned_grad_norm_tol {
            break TrustRegionStatus::PreconditionedGradientNorm;
        }
        if result.iterations >= options.max_iterations {
            break TrustRegionStatus::IterationLimit;
        }
        result.iterations += 1;

        if let Some(user_function) = &options.user_function {
            user_function(&TrustRegionSnapshot {
                iteration: result.iterations,
                elapsed,
                iterate: current.x.as_ref(),
                gradient: current.gradient.as_ref(),
                objective: current.f,
                gradient_norm: current.gradient_norm,
                preconditioned_gradient_norm: current.preconditioned_gradient_norm,
                radius,
                hessian_vector_products: total_hessian_products,
            });
        }

        let tcg = truncated_cg(
            objective,
            current.x.as_ref(),
            &current.cache,
            current.gradient.as_ref(),
            &TcgParams {
                radius,
                kappa: options.stpcg_kappa,
                theta: options.stpcg_theta,
                max_iterations: options.max_tcg_iterations,
            },
        );
        total_hessian_products += tcg.hessian_vector_products;

        let model_decrease = -(frobenius_inner(current.gradient.as_ref(), tcg.step.as_ref())
            + 0.5 * frobenius_inner(tcg.step.as_ref(), tcg.hessian_step.as_ref()));
        let proposal = objective.retract(current.x.as_ref(), tcg.step.as_ref())?;
        let (f_proposal, cache_proposal) = objective.evaluate(proposal.as_ref());
        let actual_decrease = current.f - f_proposal;
        let rho = if model_decrease > 0.0 {
            actual_decrease / model_decrease
        } else {
            f64::NEG_INFINITY
        };

        if rho < params.eta1 {
            radius *= params.alpha1;
        } else if rho > params.eta2 && tcg.stop_reason.reached_boundary() {
            radius *= params.alpha2;
        }

        let accepted = rho > params.eta1 && f_proposal < current.f;
        let step_norm = tcg.step.norm_l2();
        log!(
            level,
            "RTR iteration {}: f = {:.8e}, ||grad|| = {:.4e}, rho = {rho:.3e}, radius = {radius:.3e}, tCG: {} ({} iterations), {}",
            result.iterations,
            current.f,
            current.gradient_norm,
            tcg.stop_reason,
            tcg.iterations,
            if accepted { "accepted" } else { "rejected" },
        );

        if accepted {
            let relative_decrease = actual_decrease / current.f.abs().max(f64::MIN_POSITIVE);
            current = Iterate::new(objective, proposal, f_proposal, cache_proposal);
            result.objective_values.push(current.f);
            result.gradient_norms.push(current.gradient_norm);
            result
                .preconditioned_gradient_norms
                .push(current.preconditioned_gradient_norm);
            result.hessian_vector_products.push(total_hessian_products);
            result.elapsed_times.push(start.elapsed().as_secs_f64());
            if options.log_iterates {
                result.iterates.push(current.x.clone());
            }

            if relative_decrease < options.rel_func_decrease_tol {
                break TrustRegionStatus::RelativeDecrease;
            }
            if step_norm < options.stepsize_tol {
                break TrustRegionStatus::Stepsize;
            }
        }

        if radius < params.min_radius {
            break TrustRegionStatus::TrustRegionRadius;
        }
    };

    result.elapsed = start.elapsed().as_secs_f64();
    result.status = status;
    result.f = current.f;
    result.grad_norm = current.gradient_norm;
    result.preconditioned_grad_norm = current.preconditioned_gradient_norm;
    result.x = current.x;
    log!(
        level,
        "RTR finished after {} iterations ({status}): f = {:.8e}, ||grad|| = {:.4e}, {:.3} s",
        result.iterations,
        result.f,
        result.grad_norm,
        result.elapsed,
    );
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use faer::mat;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// `f(x) = ½ xᵀAx - bᵀx` on a flat space of column vectors.
    pub(crate) struct Quadratic {
        a: Mat<f64>,
        b: Mat<f64>,
        jacobi: bool,
    }

    impl Quadratic {
        pub(crate) fn new(a: Mat<f64>, b: Mat<f64>) -> Self {
            Self {
                a,
                b,
                jacobi: false,
            }
        }

        pub(crate) fn with_jacobi_preconditioner(mut self) -> Self {
            self.jacobi = true;
            self
        }
    }

    impl RiemannianObjective for Quadratic {
        type Cache = Mat<f64>;

        fn evaluate(&self, y: MatRef<'_, f64>) -> (f64, Self::Cache) {
            let ay = self.a.as_ref() * y;
            let value = 0.5 * frobenius_inner(y, ay.as_ref()) - frobenius_inner(self.b.as_ref(), y);
            (value, ay)
        }

        fn gradient(&self, _: MatRef<'_, f64>, cache: &Self::Cache) -> Mat<f64> {
            cache - &self.b
        }

        fn hessian_vector_product(
            &self,
            _: MatRef<'_, f64>,
            _: &Self::Cache,
            v: MatRef<'_, f64>,
        ) -> Mat<f64> {
            self.a.as_ref() * v
        }

        fn precondition(
            &self,
            _: MatRef<'_, f64>,
            _: &Self::Cache,
            v: MatRef<'_, f64>,
        ) -> Mat<f64> {
            if self.jacobi {
                Mat::from_fn(v.nrows(), v.ncols(), |i, j| v[(i, j)] / self.a[(i, i)])
            } else {
                v.to_owned()
            }
        }

        fn retract(&self, y: MatRef<'_, f64>, v: MatRef<'_, f64>) -> Result<Mat<f64>> {
            Ok(y + v)
        }
    }

    /// `D^½ (I + 0.1 T) D^½` with `D = diag(10^(k/3))` and `T` the path adjacency:
    /// badly scaled, but close to the identity after diagonal scaling.
    fn badly_scaled() -> Quadratic {
        let n = 12;
        let d = |k: usize| 10f64.powf(k as f64 / 3.0);
        let a = Mat::from_fn(n, n, |i, j| {
            if i == j {
                d(i)
            } else if i.abs_diff(j) == 1 {
                0.1 * (d(i) * d(j)).sqrt()
            } else {
                0.0
            }
        });
        let b = Mat::from_fn(n, 1, |k, _| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            0.1 * sign * (1.0 + k as f64 / n as f64)
        });
        Quadratic::new(a, b)
    }

    // The minimum is near -0.013, so a 1e-8 gradient tolerance stays well above the
    // rounding floor of the ratio test.
    fn tight_options() -> TrustRegionOptions {
        TrustRegionOptions {
            grad_norm_tol: 1e-8,
            preconditioned_grad_norm_tol: 1e-12,
            rel_func_decrease_tol: 1e-16,
            stepsize_tol: 1e-14,
            ..TrustRegionOptions::default()
        }
    }

    #[test]
    fn test_converges_to_minimizer_with_monotone_objective() {
        let quadratic = badly_scaled();
        let x0 = Mat::<f64>::zeros(12, 1);
        let result = riemannian_trust_region(&quadratic, x0.as_ref(), &tight_options()).unwrap();

        assert_eq!(result.status, TrustRegionStatus::GradientNorm);
        let residual = quadratic.a.as_ref() * result.x.as_ref() - &quadratic.b;
        assert!(residual.norm_l2() < 1e-8);

        let n = result.objective_values.len();
        assert_eq!(result.gradient_norms.len(), n);
        assert_eq!(result.preconditioned_gradient_norms.len(), n);
        assert_eq!(result.hessian_vector_products.len(), n);
        assert_eq!(result.elapsed_times.len(), n);
        assert!(
            result
                .objective_values
                .windows(2)
                .all(|pair| pair[1] <= pair[0])
        );
        assert!(
            result
                .hessian_vector_products
                .windows(2)
                .all(|pair| pair[1] >= pair[0])
        );
        assert!(result.iterates.is_empty());
    }

    #[test]
    fn test_preconditioning_reduces_inner_work() {
        let x0 = Mat::<f64>::zeros(12, 1);
        let plain = riemannian_trust_region(&badly_scaled(), x0.as_ref(), &tight_options()).unwrap();
        let preconditioned = riemannian_trust_region(
            &badly_scaled().with_jacobi_preconditioner(),
            x0.as_ref(),
            &tight_options(),
        )
        .unwrap();
        assert_eq!(preconditioned.status, TrustRegionStatus::GradientNorm);
        assert_eq!(plain.status, TrustRegionStatus::GradientNorm);
        let total = |r: &TrustRegionResult| r.hessian_vector_products.last().copied().unwrap_or(0);
        assert!(total(&preconditioned) < total(&plain));
    }

    #[test]
    fn test_zero_time_budget_records_initial_point() {
        let quadratic = badly_scaled();
        let x0 = Mat::<f64>::zeros(12, 1);
        let options = TrustRegionOptions {
            max_computation_time: 0.0,
            log_iterates: true,
            ..tight_options()
        };
        let result = riemannian_trust_region(&quadratic, x0.as_ref(), &options).unwrap();
        assert_eq!(result.status, TrustRegionStatus::ElapsedTime);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.objective_values, vec![0.0]);
        assert_eq!(result.iterates.len(), 1);
        assert_eq!(result.x, x0);
    }

    #[test]
    fn test_user_function_is_called_once_per_iteration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let options = TrustRegionOptions {
            user_function: Some(Arc::new(move |snapshot: &TrustRegionSnapshot<'_>| {
                assert_eq!(snapshot.iteration, seen.fetch_add(1, Ordering::SeqCst) + 1);
                assert!(snapshot.radius > 0.0);
            })),
            ..tight_options()
        };
        let result =
            riemannian_trust_region(&badly_scaled(), Mat::<f64>::zeros(12, 1).as_ref(), &options)
                .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), result.iterations);
    }

    #[test]
    fn test_iteration_limit() {
        let options = TrustRegionOptions {
            max_iterations: 1,
            params: TrustRegionParams {
                initial_radius: 1e-3,
                ..TrustRegionParams::default()
            },
            ..tight_options()
        };
        let result =
            riemannian_trust_region(&badly_scaled(), Mat::<f64>::zeros(12, 1).as_ref(), &options)
                .unwrap();
        assert_eq!(result.status, TrustRegionStatus::IterationLimit);
        assert_eq!(result.iterations, 1);
        assert!(result.x.norm_l2() <= 1e-3 + 1e-12);
    }
}
