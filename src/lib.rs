//! Certifiably correct pose-graph optimization with the Riemannian Staircase.
//!
//! This crate solves the special-Euclidean synchronization problem: given noisy
//! relative-pose measurements `(R̃_ij, t̃_ij)` between the nodes of a connected graph,
//! estimate absolute poses `(R_i, t_i) ∈ SE(d)` minimizing
//!
//! ```text
//! Σ κ_ij ||R_j - R_i R̃_ij||²_F + τ_ij ||t_j - t_i - R_i t̃_ij||²₂.
//! ```
//!
//! The translations are eliminated analytically and the rotation problem is relaxed
//! to a semidefinite program, which is solved through a sequence of low-rank
//! Riemannian optimizations over `St(d, r)^n` (the Riemannian Staircase). At each
//! rank the critical point found by a trust-region method is checked with a dual
//! certificate: if the certificate matrix `S = Q - Λ` is positive semidefinite the
//! relaxation was solved exactly, and the rounded estimate comes with a provable
//! suboptimality bound. Otherwise, a direction of negative curvature of `S` is used to
//! escape the saddle point at the next rank.
//!
//! Built on the [`faer`] linear algebra framework; all large operators (the data
//! matrix `Q` and the certificate `S`) are applied matrix-free through
//! [`matrix::LinearOperator`].
//!
//! ## Modules
//!
//! **Staircase** ([`solvers`]): [`se_sync`] runs the whole pipeline and
//! [`escape_saddle`] performs the rank-increasing descent step.
//!
//! **Optimization** ([`algorithms`]): the Riemannian trust-region method with
//! truncated conjugate-gradient inner solves, LOBPCG and Lanczos.
//!
//! **Problem model** ([`problem`], [`manifold`], [`measurement`], [`preconditioner`]):
//! the rank-restricted objective, its derivatives, initialization, rounding and
//! translation recovery.
//!
//! **Verification** ([`certification`]): the minimum-eigenpair computation on the
//! certificate matrix.
//!
//! ## Example Usage
//!
//! ```rust
//! use faer::mat;
//! use sesync::{RelativePoseMeasurement, SeSyncOptions, SeSyncStatus, se_sync_from_measurements};
//!
//! fn rotation(theta: f64) -> faer::Mat<f64> {
//!     mat![[theta.cos(), -theta.sin()], [theta.sin(), theta.cos()]]
//! }
//!
//! // Three poses on a triangle, measured without noise.
//! let (c, s) = (0.3_f64.cos(), 0.3_f64.sin());
//! let measurements = vec![
//!     RelativePoseMeasurement::new(0, 1, rotation(0.3), mat![[1.0], [0.0]], 1.0, 1.0),
//!     RelativePoseMeasurement::new(1, 2, rotation(0.4), mat![[1.0], [0.5]], 1.0, 1.0),
//!     RelativePoseMeasurement::new(0, 2, rotation(0.7), mat![[1.0 + c - 0.5 * s], [s + 0.5 * c]], 1.0, 1.0),
//! ];
//!
//! let options = SeSyncOptions::default().with_ranks(3, 5);
//! let result = se_sync_from_measurements(&measurements, &options, None).unwrap();
//! assert_eq!(result.status, SeSyncStatus::GlobalOpt);
//! assert!(result.suboptimality_bound < 1e-4);
//! ```

// Declare the modules that form the crate's API structure.
pub mod algorithms;
pub mod certification;
pub mod error;
pub mod manifold;
pub mod matrix;
pub mod measurement;
pub mod options;
pub mod preconditioner;
pub mod problem;
pub mod result;
pub mod solvers;
pub mod utils;

// Re-export the main API for convenient access.
pub use error::{Result, SeSyncError, SeSyncErrorKind};
pub use measurement::RelativePoseMeasurement;
pub use options::{
    Formulation, Initialization, PreconditionerKind, ProjectionFactorization, SeSyncOptions,
    TrustRegionParams,
};
pub use problem::SeSyncProblem;
pub use result::{LevelRecord, SeSyncResult, SeSyncStatus, Verification};
pub use solvers::{escape_saddle, se_sync, se_sync_from_measurements};
