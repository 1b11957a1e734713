//! Configuration of an SE-Sync run.
//!
//! [`SeSyncOptions`] is an immutable snapshot: build it with [`Default`] and the
//! `with_*` methods, hand it to [`crate::solvers::se_sync`], and it is never mutated
//! while the staircase runs.

use crate::{
    algorithms::trust_region::TrustRegionSnapshot,
    error::{Result, SeSyncError},
};
use faer::Par;
use std::{fmt, sync::Arc};

/// Read-only observer invoked once per outer trust-region iteration.
pub type UserFunction = Arc<dyn Fn(&TrustRegionSnapshot<'_>) + Send + Sync>;

/// Which form of the relaxed objective to optimize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Formulation {
    /// Translations are analytically eliminated: `Q = L(G^ρ) + Σ̃ - Ṽᵀ L(W^τ)⁻¹ Ṽ`.
    #[default]
    Simplified,
    /// Rotation-only synchronization: `Q = L(G^ρ)`.
    SoSync,
}

/// How the first iterate of the staircase is produced when none is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Initialization {
    #[default]
    Chordal,
    Random,
}

/// How products with `L(W^τ)⁻¹` are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionFactorization {
    /// Sparse Cholesky factorization of the reduced translational Laplacian.
    #[default]
    Cholesky,
    /// Dense QR factorization of the weighted reduced incidence matrix.
    Qr,
}

/// Preconditioner used inside the trust-region subproblem solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreconditionerKind {
    /// Inverse of the diagonal of `L(G^ρ)`.
    Jacobi,
    /// Exact sparse Cholesky factorization of `L(G^ρ) + λI`, with `λ` chosen so that the
    /// regularized matrix has condition number at most `max_condition_number`.
    RegularizedCholesky { max_condition_number: f64 },
    /// Incomplete LDLᵀ factorization of `L(G^ρ)`.
    IncompleteCholesky { max_fill_factor: f64, drop_tol: f64 },
}

impl Default for PreconditionerKind {
    fn default() -> Self {
        PreconditionerKind::RegularizedCholesky {
            max_condition_number: 1e6,
        }
    }
}

/// Trust-region update constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrustRegionParams {
    /// Steps with `ρ <= eta1` are rejected and shrink the radius.
    pub eta1: f64,
    /// Steps with `ρ > eta2` that hit the boundary grow the radius.
    pub eta2: f64,
    /// Shrink factor.
    pub alpha1: f64,
    /// Growth factor.
    pub alpha2: f64,
    pub initial_radius: f64,
    /// The solver stops once the radius falls below this value.
    pub min_radius: f64,
}

impl Default for TrustRegionParams {
    fn default() -> Self {
        Self {
            eta1: 0.05,
            eta2: 0.9,
            alpha1: 0.25,
            alpha2: 2.5,
            initial_radius: 1.0,
            min_radius: 1e-10,
        }
    }
}

/// All tunables of the Riemannian Staircase.
#[derive(Clone)]
pub struct SeSyncOptions {
    // Riemannian trust-region
    pub grad_norm_tol: f64,
    pub preconditioned_grad_norm_tol: f64,
    pub rel_func_decrease_tol: f64,
    pub stepsize_tol: f64,
    pub max_iterations: usize,
    pub max_tcg_iterations: usize,
    /// Wall-clock budget of the whole run, in seconds.
    pub max_computation_time: f64,
    /// Linear convergence target of truncated CG.
    pub stpcg_kappa: f64,
    /// Superlinear convergence exponent of truncated CG.
    pub stpcg_theta: f64,
    pub trust_region: TrustRegionParams,
    pub user_function: Option<UserFunction>,

    // Problem
    pub formulation: Formulation,
    pub projection_factorization: ProjectionFactorization,
    pub preconditioner: PreconditionerKind,

    // Staircase
    pub r0: usize,
    pub rmax: usize,
    pub initialization: Initialization,

    // Certification
    pub min_eig_num_tol: f64,
    pub lobpcg_block_size: usize,
    pub lobpcg_max_fill_factor: f64,
    pub lobpcg_drop_tol: f64,
    pub lobpcg_max_iterations: usize,

    // Execution
    pub verbose: bool,
    pub log_iterates: bool,
    pub num_threads: usize,
    pub seed: u64,
}

impl Default for SeSyncOptions {
    fn default() -> Self {
        Self {
            grad_norm_tol: 1e-2,
            preconditioned_grad_norm_tol: 1e-4,
            rel_func_decrease_tol: 1e-6,
            stepsize_tol: 1e-3,
            max_iterations: 1000,
            max_tcg_iterations: 10000,
            max_computation_time: 1800.0,
            stpcg_kappa: 0.1,
            stpcg_theta: 0.5,
            trust_region: TrustRegionParams::default(),
            user_function: None,
            formulation: Formulation::default(),
            projection_factorization: ProjectionFactorization::default(),
            preconditioner: PreconditionerKind::default(),
            r0: 5,
            rmax: 10,
            initialization: Initialization::default(),
            min_eig_num_tol: 1e-3,
            lobpcg_block_size: 4,
            lobpcg_max_fill_factor: 3.0,
            lobpcg_drop_tol: 1e-3,
            lobpcg_max_iterations: 100,
            verbose: false,
            log_iterates: false,
            num_threads: 1,
            seed: 0,
        }
    }
}

impl fmt::Debug for SeSyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeSyncOptions")
            .field("grad_norm_tol", &self.grad_norm_tol)
            .field(
                "preconditioned_grad_norm_tol",
                &self.preconditioned_grad_norm_tol,
            )
            .field("rel_func_decrease_tol", &self.rel_func_decrease_tol)
            .field("stepsize_tol", &self.stepsize_tol)
            .field("max_iterations", &self.max_iterations)
            .field("max_tcg_iterations", &self.max_tcg_iterations)
            .field("max_computation_time", &self.max_computation_time)
            .field("stpcg_kappa", &self.stpcg_kappa)
            .field("stpcg_theta", &self.stpcg_theta)
            .field("trust_region", &self.trust_region)
            .field("user_function", &self.user_function.as_ref().map(|_| "<fn>"))
            .field("formulation", &self.formulation)
            .field("projection_factorization", &self.projection_factorization)
            .field("preconditioner", &self.preconditioner)
            .field("r0", &self.r0)
            .field("rmax", &self.rmax)
            .field("initialization", &self.initialization)
            .field("min_eig_num_tol", &self.min_eig_num_tol)
            .field("lobpcg_block_size", &self.lobpcg_block_size)
            .field("lobpcg_max_fill_factor", &self.lobpcg_max_fill_factor)
            .field("lobpcg_drop_tol", &self.lobpcg_drop_tol)
            .field("lobpcg_max_iterations", &self.lobpcg_max_iterations)
            .field("verbose", &self.verbose)
            .field("log_iterates", &self.log_iterates)
            .field("num_threads", &self.num_threads)
            .field("seed", &self.seed)
            .finish()
    }
}

impl SeSyncOptions {
    pub fn with_tolerances(mut self, grad_norm_tol: f64, preconditioned_grad_norm_tol: f64) -> Self {
        self.grad_norm_tol = grad_norm_tol;
        self.preconditioned_grad_norm_tol = preconditioned_grad_norm_tol;
        self
    }

    pub fn with_rel_func_decrease_tol(mut self, tol: f64) -> Self {
        self.rel_func_decrease_tol = tol;
        self
    }

    pub fn with_stepsize_tol(mut self, tol: f64) -> Self {
        self.stepsize_tol = tol;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_tcg_iterations(mut self, max_tcg_iterations: usize) -> Self {
        self.max_tcg_iterations = max_tcg_iterations;
        self
    }

    pub fn with_max_computation_time(mut self, seconds: f64) -> Self {
        self.max_computation_time = seconds;
        self
    }

    pub fn with_stpcg(mut self, kappa: f64, theta: f64) -> Self {
        self.stpcg_kappa = kappa;
        self.stpcg_theta = theta;
        self
    }

    pub fn with_trust_region(mut self, params: TrustRegionParams) -> Self {
        self.trust_region = params;
        self
    }

    pub fn with_user_function(
        mut self,
        f: impl Fn(&TrustRegionSnapshot<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.user_function = Some(Arc::new(f));
        self
    }

    pub fn with_formulation(mut self, formulation: Formulation) -> Self {
        self.formulation = formulation;
        self
    }

    pub fn with_projection_factorization(mut self, factorization: ProjectionFactorization) -> Self {
        self.projection_factorization = factorization;
        self
    }

    pub fn with_preconditioner(mut self, preconditioner: PreconditionerKind) -> Self {
        self.preconditioner = preconditioner;
        self
    }

    pub fn with_ranks(mut self, r0: usize, rmax: usize) -> Self {
        self.r0 = r0;
        self.rmax = rmax;
        self
    }

    pub fn with_initialization(mut self, initialization: Initialization) -> Self {
        self.initialization = initialization;
        self
    }

    pub fn with_min_eig_num_tol(mut self, tol: f64) -> Self {
        self.min_eig_num_tol = tol;
        self
    }

    pub fn with_lobpcg(
        mut self,
        block_size: usize,
        max_iterations: usize,
        max_fill_factor: f64,
        drop_tol: f64,
    ) -> Self {
        self.lobpcg_block_size = block_size;
        self.lobpcg_max_iterations = max_iterations;
        self.lobpcg_max_fill_factor = max_fill_factor;
        self.lobpcg_drop_tol = drop_tol;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_log_iterates(mut self, log_iterates: bool) -> Self {
        self.log_iterates = log_iterates;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Parallelism used for sparse-dense and dense products.
    pub fn parallelism(&self) -> Par {
        if self.num_threads <= 1 {
            Par::Seq
        } else {
            Par::rayon(self.num_threads)
        }
    }

    /// Rejects option records that cannot describe a valid run on poses of dimension
    /// `d`. Called before any optimization work is done.
    pub fn validate(&self, d: usize) -> Result<()> {
        fn positive(name: &str, value: f64) -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(SeSyncError::invalid_options(format!(
                    "{name} must be positive and finite, got {value}"
                )))
            }
        }

        if self.r0 > self.rmax {
            return Err(SeSyncError::invalid_options(format!(
                "r0 ({}) must not exceed rmax ({})",
                self.r0, self.rmax
            )));
        }
        if self.r0 < d {
            return Err(SeSyncError::invalid_options(format!(
                "r0 ({}) must be at least the pose dimension ({d})",
                self.r0
            )));
        }
        positive("grad_norm_tol", self.grad_norm_tol)?;
        positive("preconditioned_grad_norm_tol", self.preconditioned_grad_norm_tol)?;
        positive("rel_func_decrease_tol", self.rel_func_decrease_tol)?;
        positive("stepsize_tol", self.stepsize_tol)?;
        positive("min_eig_num_tol", self.min_eig_num_tol)?;
        positive("stpcg_theta", self.stpcg_theta)?;
        if !(self.stpcg_kappa > 0.0 && self.stpcg_kappa < 1.0) {
            return Err(SeSyncError::invalid_options(format!(
                "stpcg_kappa must lie in (0, 1), got {}",
                self.stpcg_kappa
            )));
        }
        if !(self.max_computation_time >= 0.0) {
            return Err(SeSyncError::invalid_options(format!(
                "max_computation_time must be nonnegative, got {}",
                self.max_computation_time
            )));
        }
        if self.lobpcg_block_size == 0 {
            return Err(SeSyncError::invalid_options(
                "lobpcg_block_size must be at least 1",
            ));
        }
        positive("lobpcg_max_fill_factor", self.lobpcg_max_fill_factor)?;
        if !(self.lobpcg_drop_tol >= 0.0 && self.lobpcg_drop_tol < 1.0) {
            return Err(SeSyncError::invalid_options(format!(
                "lobpcg_drop_tol must lie in [0, 1), got {}",
                self.lobpcg_drop_tol
            )));
        }
        if self.num_threads == 0 {
            return Err(SeSyncError::invalid_options("num_threads must be at least 1"));
        }

        let tr = &self.trust_region;
        if !(0.0 < tr.eta1 && tr.eta1 < tr.eta2 && tr.eta2 < 1.0) {
            return Err(SeSyncError::invalid_options(format!(
                "trust-region thresholds must satisfy 0 < eta1 < eta2 < 1, got ({}, {})",
                tr.eta1, tr.eta2
            )));
        }
        if !(0.0 < tr.alpha1 && tr.alpha1 < 1.0 && tr.alpha2 > 1.0) {
            return Err(SeSyncError::invalid_options(format!(
                "trust-region factors must satisfy 0 < alpha1 < 1 < alpha2, got ({}, {})",
                tr.alpha1, tr.alpha2
            )));
        }
        positive("initial trust-region radius", tr.initial_radius)?;
        positive("minimum trust-region radius", tr.min_radius)?;

        match self.preconditioner {
            PreconditionerKind::Jacobi => {}
            PreconditionerKind::RegularizedCholesky {
                max_condition_number,
            } => {
                if !(max_condition_number.is_finite() && max_condition_number > 1.0) {
                    return Err(SeSyncError::invalid_options(format!(
                        "max_condition_number must exceed 1, got {max_condition_number}"
                    )));
                }
            }
            PreconditionerKind::IncompleteCholesky {
                max_fill_factor,
                drop_tol,
            } => {
                positive("max_fill_factor", max_fill_factor)?;
                if !(drop_tol >= 0.0 && drop_tol < 1.0) {
                    return Err(SeSyncError::invalid_options(format!(
                        "drop_tol must lie in [0, 1), got {drop_tol}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = SeSyncOptions::default();
        assert!(options.validate(3).is_ok());
        assert_eq!(options.r0, 5);
        assert_eq!(options.rmax, 10);
        assert_eq!(
            options.preconditioner,
            PreconditionerKind::RegularizedCholesky {
                max_condition_number: 1e6
            }
        );
        assert!(matches!(options.parallelism(), Par::Seq));
    }

    #[test]
    fn test_rank_bounds_are_checked() {
        let error = SeSyncOptions::default()
            .with_ranks(10, 5)
            .validate(3)
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Invalid options: r0 (10) must not exceed rmax (5)"
        );
        assert!(error.is_configuration_error());

        assert!(SeSyncOptions::default().with_ranks(2, 5).validate(3).is_err());
    }

    #[test]
    fn test_tolerances_are_checked() {
        assert!(
            SeSyncOptions::default()
                .with_tolerances(0.0, 1e-4)
                .validate(2)
                .is_err()
        );
        assert!(SeSyncOptions::default().with_stpcg(1.0, 0.5).validate(2).is_err());
        assert!(SeSyncOptions::default().with_stpcg(0.1, 0.0).validate(2).is_err());
        assert!(
            SeSyncOptions::default()
                .with_lobpcg(0, 100, 3.0, 1e-3)
                .validate(2)
                .is_err()
        );
    }

    #[test]
    fn test_debug_hides_user_function() {
        let options = SeSyncOptions::default().with_user_function(|_| {});
        let printed = format!("{options:?}");
        assert!(printed.contains("user_function: Some(\"<fn>\")"));
    }
}
