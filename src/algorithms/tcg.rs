//! Steihaug-Toint truncated preconditioned conjugate gradient.
//!
//! Approximately minimizes the trust-region model
//! `m(s) = f + <g, s> + ½ <s, H s>` subject to `||s||_M <= Δ`, where `M = P⁻¹` is the
//! metric induced by the preconditioner. Only Hessian actions are needed. The
//! M-norms `||s||_M²`, `<s, p>_M` and `||p||_M²` are updated with the Conn-Gould-Toint
//! recurrences, so no products with `M` itself are ever formed.
//!
//! The iteration stops on the first of:
//! - the residual reaching `||r||_P <= ||r_0||_P · max(κ, ||r_0||_P^θ)`;
//! - non-positive curvature along the search direction (step to the boundary);
//! - the next iterate leaving the trust region (truncate to the boundary);
//! - the iteration cap.

use crate::{
    algorithms::trust_region::RiemannianObjective,
    matrix::{axpy, frobenius_inner, linear_combination, scaled},
};
use faer::{Mat, MatRef};
use log::trace;
use std::fmt;

/// Why truncated CG stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcgStopReason {
    /// A direction of non-positive curvature was found.
    NegativeCurvature,
    /// The step was truncated at the trust-region boundary.
    ExceededTrustRegion,
    /// The residual fell below `κ ||r_0||`.
    LinearConvergence,
    /// The residual fell below `||r_0||^{1+θ}`.
    SuperlinearConvergence,
    MaxIterations,
}

impl TcgStopReason {
    /// `true` when the returned step lies on the trust-region boundary.
    pub fn reached_boundary(&self) -> bool {
        matches!(
            self,
            TcgStopReason::NegativeCurvature | TcgStopReason::ExceededTrustRegion
        )
    }
}

impl fmt::Display for TcgStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TcgStopReason::NegativeCurvature => "negative curvature",
            TcgStopReason::ExceededTrustRegion => "exceeded trust region",
            TcgStopReason::LinearConvergence => "reached target residual (linear)",
            TcgStopReason::SuperlinearConvergence => "reached target residual (superlinear)",
            TcgStopReason::MaxIterations => "maximum iterations",
        };
        f.write_str(text)
    }
}

/// Parameters of one truncated CG solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TcgParams {
    pub radius: f64,
    pub kappa: f64,
    pub theta: f64,
    pub max_iterations: usize,
}

/// Output of [`truncated_cg`].
#[derive(Debug, Clone)]
pub struct TcgResult {
    pub step: Mat<f64>,
    /// `H · step`, accumulated alongside the step.
    pub hessian_step: Mat<f64>,
    /// `||step||_M`.
    pub step_norm_m: f64,
    pub iterations: usize,
    pub hessian_vector_products: usize,
    pub stop_reason: TcgStopReason,
}

/// Positive root `σ` of `||s + σ p||_M² = Δ²`.
fn boundary_step(s_m: f64, sp_m: f64, p_m: f64, radius: f64) -> f64 {
    let discriminant = sp_m * sp_m + p_m * (radius * radius - s_m);
    (-sp_m + discriminant.max(0.0).sqrt()) / p_m
}

/// Solves the trust-region subproblem at `y` for the gradient `gradient`.
pub fn truncated_cg<O: RiemannianObjective>(
    objective: &O,
    y: MatRef<'_, f64>,
    cache: &O::Cache,
    gradient: MatRef<'_, f64>,
    params: &TcgParams,
) -> TcgResult {
    let (rows, cols) = (gradient.nrows(), gradient.ncols());
    let mut step = Mat::<f64>::zeros(rows, cols);
    let mut hessian_step = Mat::<f64>::zeros(rows, cols);

    let mut residual = gradient.to_owned();
    let mut z = objective.precondition(y, cache, residual.as_ref());
    let mut z_r = frobenius_inner(z.as_ref(), residual.as_ref());
    let r0_norm = z_r.max(0.0).sqrt();
    let target = r0_norm * params.kappa.max(r0_norm.powf(params.theta));
    let linear_regime = params.kappa >= r0_norm.powf(params.theta);

    // Search direction p = -z, with the M-norm recurrences
    //   s_m = ||s||_M², sp_m = <s, p>_M, p_m = ||p||_M².
    let mut direction = scaled(-1.0, z.as_ref());
    let mut s_m = 0.0;
    let mut sp_m = 0.0;
    let mut p_m = z_r;

    let mut hessian_vector_products = 0;
    let mut iterations = 0;
    let mut stop_reason = TcgStopReason::MaxIterations;

    if r0_norm == 0.0 {
        return TcgResult {
            step,
            hessian_step,
            step_norm_m: 0.0,
            iterations,
            hessian_vector_products,
            stop_reason: TcgStopReason::LinearConvergence,
        };
    }

    while iterations < params.max_iterations {
        iterations += 1;
        let hp = objective.hessian_vector_product(y, cache, direction.as_ref());
        hessian_vector_products += 1;
        let curvature = frobenius_inner(direction.as_ref(), hp.as_ref());
        let alpha = z_r / curvature;
        let s_m_next = s_m + 2.0 * alpha * sp_m + alpha * alpha * p_m;

        if curvature <= 0.0 || s_m_next >= params.radius * params.radius {
            let sigma = boundary_step(s_m, sp_m, p_m, params.radius);
            axpy(sigma, direction.as_ref(), step.as_mut());
            axpy(sigma, hp.as_ref(), hessian_step.as_mut());
            s_m = params.radius * params.radius;
            stop_reason = if curvature <= 0.0 {
                TcgStopReason::NegativeCurvature
            } else {
                TcgStopReason::ExceededTrustRegion
            };
            break;
        }

        s_m = s_m_next;
        axpy(alpha, direction.as_ref(), step.as_mut());
        axpy(alpha, hp.as_ref(), hessian_step.as_mut());
        axpy(alpha, hp.as_ref(), residual.as_mut());

        z = objective.precondition(y, cache, residual.as_ref());
        let z_r_next = frobenius_inner(z.as_ref(), residual.as_ref());
        let r_norm = z_r_next.max(0.0).sqrt();
        trace!("tCG iteration {iterations}: ||r||_P = {r_norm:.6e}, ||s||_M² = {s_m:.6e}");
        if r_norm <= target {
            stop_reason = if linear_regime {
                TcgStopReason::LinearConvergence
            } else {
                TcgStopReason::SuperlinearConvergence
            };
            break;
        }

        let beta = z_r_next / z_r;
        z_r = z_r_next;
        direction = linear_combination(-1.0, z.as_ref(), beta, direction.as_ref());
        sp_m = beta * (sp_m + alpha * p_m);
        p_m = z_r + beta * beta * p_m;
    }

    TcgResult {
        step,
        hessian_step,
        step_norm_m: s_m.max(0.0).sqrt(),
        iterations,
        hessian_vector_products,
        stop_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::trust_region::tests::Quadratic;
    use faer::mat;

    fn params(radius: f64) -> TcgParams {
        TcgParams {
            radius,
            kappa: 1e-10,
            theta: 20.0,
            max_iterations: 100,
        }
    }

    #[test]
    fn test_interior_solution_is_newton_step() {
        let quadratic = Quadratic::new(
            mat![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 2.0]],
            mat![[0.1], [0.2], [0.3]],
        );
        let x = Mat::<f64>::zeros(3, 1);
        let (_, cache) = quadratic.evaluate(x.as_ref());
        let g = quadratic.gradient(x.as_ref(), &cache);
        let result = truncated_cg(&quadratic, x.as_ref(), &cache, g.as_ref(), &params(100.0));

        assert!(matches!(
            result.stop_reason,
            TcgStopReason::LinearConvergence | TcgStopReason::SuperlinearConvergence
        ));
        assert!(result.iterations <= 3);
        // H s = -g at the unconstrained minimizer.
        let hs = quadratic.hessian_vector_product(x.as_ref(), &cache, result.step.as_ref());
        assert!((&hs + &g).norm_l2() < 1e-9);
        assert!((&hs - &result.hessian_step).norm_l2() < 1e-9);
    }

    #[test]
    fn test_step_is_truncated_at_radius() {
        let quadratic = Quadratic::new(
            mat![[1.0, 0.0], [0.0, 0.1]],
            mat![[5.0], [5.0]],
        );
        let x = Mat::<f64>::zeros(2, 1);
        let (_, cache) = quadratic.evaluate(x.as_ref());
        let g = quadratic.gradient(x.as_ref(), &cache);
        let result = truncated_cg(&quadratic, x.as_ref(), &cache, g.as_ref(), &params(0.5));

        assert_eq!(result.stop_reason, TcgStopReason::ExceededTrustRegion);
        assert!(result.stop_reason.reached_boundary());
        assert!((result.step.norm_l2() - 0.5).abs() < 1e-12);
        assert!((result.step_norm_m - 0.5).abs() < 1e-12);
        // The model decreases.
        let decrease = frobenius_inner(g.as_ref(), result.step.as_ref())
            + 0.5 * frobenius_inner(result.step.as_ref(), result.hessian_step.as_ref());
        assert!(decrease < 0.0);
    }

    #[test]
    fn test_negative_curvature_goes_to_boundary() {
        let quadratic = Quadratic::new(mat![[-1.0, 0.0], [0.0, 2.0]], mat![[1.0], [0.0]]);
        let x = Mat::<f64>::zeros(2, 1);
        let (_, cache) = quadratic.evaluate(x.as_ref());
        let g = quadratic.gradient(x.as_ref(), &cache);
        let result = truncated_cg(&quadratic, x.as_ref(), &cache, g.as_ref(), &params(2.0));

        assert_eq!(result.stop_reason, TcgStopReason::NegativeCurvature);
        assert_eq!(result.hessian_vector_products, 1);
        assert!((result.step.norm_l2() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_preconditioned_step_respects_m_norm() {
        // With P = diag(1/a_ii) the M-norm is ||s||_M² = Σ a_ii s_i².
        let quadratic = Quadratic::new(mat![[10.0, 0.0], [0.0, 1.0]], mat![[3.0], [4.0]])
            .with_jacobi_preconditioner();
        let x = Mat::<f64>::zeros(2, 1);
        let (_, cache) = quadratic.evaluate(x.as_ref());
        let g = quadratic.gradient(x.as_ref(), &cache);
        let result = truncated_cg(&quadratic, x.as_ref(), &cache, g.as_ref(), &params(0.1));

        assert!(result.stop_reason.reached_boundary());
        let s = &result.step;
        let m_norm = (10.0 * s[(0, 0)] * s[(0, 0)] + s[(1, 0)] * s[(1, 0)]).sqrt();
        assert!((m_norm - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_zero_gradient_returns_zero_step() {
        let quadratic = Quadratic::new(mat![[1.0]], mat![[0.0]]);
        let x = Mat::<f64>::zeros(1, 1);
        let (_, cache) = quadratic.evaluate(x.as_ref());
        let g = quadratic.gradient(x.as_ref(), &cache);
        let result = truncated_cg(&quadratic, x.as_ref(), &cache, g.as_ref(), &params(1.0));
        assert_eq!(result.hessian_vector_products, 0);
        assert_eq!(result.step.norm_l2(), 0.0);
    }
}
