//! Verification of first-order critical points through the certificate matrix.
//!
//! A critical point `Y` of the rank-restricted problem is a global minimizer of the
//! semidefinite relaxation exactly when `S = Q - Λ(Y) ⪰ 0`. The certifier computes the
//! smallest eigenpair of `S` with LOBPCG, preconditioned by an incomplete LDLᵀ of the
//! sparse surrogate `S̃ + ηI`. A negative Ritz value is a proof of non-optimality and its
//! Ritz vector is a direction of negative curvature, so the search can stop as soon as
//! one appears.

use crate::{
    algorithms::lobpcg::{LobpcgOptions, lobpcg},
    error::Result,
    matrix::LinearOperator,
    options::SeSyncOptions,
    preconditioner::IncompleteLdlt,
    problem::SeSyncProblem,
};
use faer::{Mat, MatRef};
use log::{debug, warn};
use std::time::Instant;

/// Outcome of one certification.
#[derive(Debug, Clone)]
pub struct Certificate {
    /// Smallest Ritz value of `S` found.
    pub theta: f64,
    /// The corresponding unit Ritz vector (`dn x 1`).
    pub eigenvector: Mat<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// `true` when LOBPCG either met its residual tolerance or proved `θ < -tol`.
    pub converged: bool,
    /// `[Λ_1, ..., Λ_n]` at the certified iterate.
    pub lambda_blocks: Mat<f64>,
    pub lambda_trace: f64,
    /// Seconds spent in certification.
    pub elapsed: f64,
}

impl Certificate {
    /// `true` when `θ` is numerically nonnegative, i.e. the iterate is certified.
    pub fn is_optimal(&self, tolerance: f64) -> bool {
        self.converged && self.theta >= -tolerance
    }
}

/// Computes the minimum eigenpair of the certificate matrix at `y`.
pub fn verify_solution(
    problem: &SeSyncProblem,
    y: MatRef<'_, f64>,
    options: &SeSyncOptions,
) -> Result<Certificate> {
    let start = Instant::now();
    let tolerance = options.min_eig_num_tol;
    let operator = problem.certificate_operator(y);
    let lambda_blocks = operator.lambda_blocks().to_owned();

    let surrogate = problem.certificate_surrogate(lambda_blocks.as_ref(), tolerance)?;
    let preconditioner = IncompleteLdlt::new(
        &surrogate,
        options.lobpcg_max_fill_factor,
        options.lobpcg_drop_tol,
    );
    let preconditioner = match &preconditioner {
        Ok(ildl) => Some(ildl as &dyn LinearOperator<f64>),
        Err(e) => {
            warn!("Certificate preconditioner unavailable ({e}); running LOBPCG unpreconditioned");
            None
        }
    };

    let lobpcg_options = LobpcgOptions {
        block_size: options.lobpcg_block_size,
        max_iterations: options.lobpcg_max_iterations,
        tolerance,
        seed: options.seed,
    };
    let result = lobpcg(&operator, preconditioner, &lobpcg_options, |theta, _| {
        theta[0] < -tolerance
    })?;

    let certificate = Certificate {
        theta: result.min_eigenvalue(),
        eigenvector: result.min_eigenvector().to_owned(),
        residual_norm: result.residual_norms[0],
        iterations: result.iterations,
        converged: result.converged || result.stopped_early,
        lambda_trace: operator.lambda_trace(),
        lambda_blocks,
        elapsed: start.elapsed().as_secs_f64(),
    };
    debug!(
        "Certification at rank {}: theta = {:.6e}, residual = {:.3e}, {} LOBPCG iterations, {}",
        y.nrows(),
        certificate.theta,
        certificate.residual_norm,
        certificate.iterations,
        if certificate.converged {
            "converged"
        } else {
            "not converged"
        },
    );
    Ok(certificate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::trust_region::{TrustRegionOptions, riemannian_trust_region},
        manifold::StiefelProduct,
        options::Formulation,
        problem::tests::planar_square,
    };

    #[test]
    fn test_certifies_optimum_of_noisy_square() {
        let options = SeSyncOptions::default().with_tolerances(1e-8, 1e-10);
        let problem = SeSyncProblem::new(&planar_square(), &options).unwrap();
        let y0 = problem.initial_iterate(&options).unwrap();
        let rtr = riemannian_trust_region(
            &problem,
            y0.as_ref(),
            &TrustRegionOptions::from_sesync(&options, f64::INFINITY),
        )
        .unwrap();

        let certificate = verify_solution(&problem, rtr.x.as_ref(), &options).unwrap();
        assert!(certificate.is_optimal(options.min_eig_num_tol));
        assert!(certificate.theta.abs() < 1e-3);
        assert!((certificate.eigenvector.norm_l2() - 1.0).abs() < 1e-10);
        assert!((certificate.lambda_trace - rtr.f).abs() < 1e-8 * rtr.f.abs().max(1.0));
    }

    #[test]
    fn test_detects_negative_curvature_at_twisted_ring() {
        // Five poses on a ring with identity measurements, rotations winding once
        // around the circle: a critical point at rank 2 that is not globally optimal.
        let options = SeSyncOptions::default().with_formulation(Formulation::SoSync);
        let measurements = crate::solvers::tests::twisted_ring(5);
        let mut problem = SeSyncProblem::new(&measurements, &options).unwrap();
        problem.set_relaxation_rank(2);
        let y = crate::solvers::tests::winding_rotations(5);
        assert!(StiefelProduct::new(2, 2, 5).constraint_violation(y.as_ref()) < 1e-12);

        let certificate = verify_solution(&problem, y.as_ref(), &options).unwrap();
        assert!(certificate.converged);
        assert!(certificate.theta < -options.min_eig_num_tol);
        assert!(!certificate.is_optimal(options.min_eig_num_tol));

        let v = certificate.eigenvector.as_ref();
        let sv = problem.certificate_operator(y.as_ref()).apply(v);
        let quotient = (v.transpose() * sv.as_ref())[(0, 0)];
        assert!((quotient - certificate.theta).abs() < 1e-8);
    }
}
