//! Output records of the Riemannian Staircase.

use crate::algorithms::trust_region::{TrustRegionResult, TrustRegionStatus};
use faer::Mat;
use serde::Serialize;
use std::fmt;

/// Terminal status of an SE-Sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeSyncStatus {
    /// The returned solution is certified globally optimal for the relaxation.
    GlobalOpt,
    /// A negative-curvature direction was found but no descent step could be made
    /// along it.
    SaddlePoint,
    /// The minimum-eigenvalue computation did not reach the requested accuracy.
    EigImprecision,
    /// The last admissible rank was reached without a certificate.
    MaxRank,
    /// The computation-time budget ran out.
    ElapsedTime,
}

impl fmt::Display for SeSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SeSyncStatus::GlobalOpt => "global optimum",
            SeSyncStatus::SaddlePoint => "saddle point",
            SeSyncStatus::EigImprecision => "eigenvalue imprecision",
            SeSyncStatus::MaxRank => "maximum rank reached",
            SeSyncStatus::ElapsedTime => "time budget exhausted",
        };
        f.write_str(text)
    }
}

/// Result of certifying the iterate of one level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub theta: f64,
    pub lobpcg_iterations: usize,
    pub converged: bool,
    /// Seconds.
    pub elapsed: f64,
}

/// Everything recorded while optimizing at one relaxation rank.
///
/// All time series have one entry for the initial iterate of the level plus one per
/// accepted trust-region step.
#[derive(Debug, Clone)]
pub struct LevelRecord {
    pub rank: usize,
    pub objective_values: Vec<f64>,
    pub gradient_norms: Vec<f64>,
    pub preconditioned_gradient_norms: Vec<f64>,
    pub hessian_vector_products: Vec<usize>,
    pub elapsed_times: Vec<f64>,
    /// Only filled when iterate logging was requested.
    pub iterates: Vec<Mat<f64>>,
    pub rtr_status: TrustRegionStatus,
    pub rtr_iterations: usize,
    /// Seconds spent in the trust-region solver.
    pub optimization_time: f64,
    pub verification: Option<Verification>,
    /// Curvature `θ` of the escape direction, when an escape was attempted from this
    /// level.
    pub escape_curvature: Option<f64>,
}

impl LevelRecord {
    pub(crate) fn from_trust_region(rank: usize, rtr: &TrustRegionResult) -> Self {
        Self {
            rank,
            objective_values: rtr.objective_values.clone(),
            gradient_norms: rtr.gradient_norms.clone(),
            preconditioned_gradient_norms: rtr.preconditioned_gradient_norms.clone(),
            hessian_vector_products: rtr.hessian_vector_products.clone(),
            elapsed_times: rtr.elapsed_times.clone(),
            iterates: rtr.iterates.clone(),
            rtr_status: rtr.status,
            rtr_iterations: rtr.iterations,
            optimization_time: rtr.elapsed,
            verification: None,
            escape_curvature: None,
        }
    }

    /// Objective value at the end of the level.
    pub fn final_objective(&self) -> f64 {
        self.objective_values.last().copied().unwrap_or(f64::NAN)
    }

    pub fn final_gradient_norm(&self) -> f64 {
        self.gradient_norms.last().copied().unwrap_or(f64::NAN)
    }

    /// Total Hessian-vector products spent at this level.
    pub fn total_hessian_vector_products(&self) -> usize {
        self.hessian_vector_products.last().copied().unwrap_or(0)
    }
}

/// Output of [`crate::solvers::se_sync`].
#[derive(Debug, Clone)]
pub struct SeSyncResult {
    /// The final relaxed iterate (`r x dn`).
    pub y_opt: Mat<f64>,
    /// `F(Y_opt)`.
    pub sdp_value: f64,
    /// Norm of the Riemannian gradient at `Y_opt`.
    pub gradient_norm: f64,
    /// `[Λ_1, ..., Λ_n]` at `Y_opt`.
    pub lambda_blocks: Mat<f64>,
    pub trace_lambda: f64,
    /// `F(Y_opt) - tr(Λ)`.
    pub duality_gap: f64,
    /// Rounded estimate `[t | R]` (`d x (n + dn)`): translations first, then rotations.
    pub xhat: Mat<f64>,
    /// Objective value of the rounded estimate.
    pub rounded_value: f64,
    /// `F(x̂) - tr(Λ)`; an upper bound on the suboptimality of `x̂` when the status is
    /// [`SeSyncStatus::GlobalOpt`].
    pub suboptimality_bound: f64,
    /// Seconds spent building the initial iterate.
    pub initialization_time: f64,
    /// Seconds for the whole run, post-processing included.
    pub total_time: f64,
    pub status: SeSyncStatus,
    pub levels: Vec<LevelRecord>,
}

impl SeSyncResult {
    /// Rank of the final iterate.
    pub fn final_rank(&self) -> usize {
        self.y_opt.nrows()
    }

    /// The `d x n` estimated translations.
    pub fn translations(&self) -> faer::MatRef<'_, f64> {
        let d = self.xhat.nrows();
        let n = self.xhat.ncols() / (d + 1);
        self.xhat.as_ref().subcols(0, n)
    }

    /// The `d x dn` estimated rotations.
    pub fn rotations(&self) -> faer::MatRef<'_, f64> {
        let d = self.xhat.nrows();
        let n = self.xhat.ncols() / (d + 1);
        self.xhat.as_ref().subcols(n, d * n)
    }
}
