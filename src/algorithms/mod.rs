//! Numerical building blocks of the Riemannian Staircase.
//!
//! - [`lanczos`]: symmetric Lanczos process, used to bound the spectrum of the
//!   connection Laplacian.
//! - [`tcg`]: Steihaug-Toint truncated conjugate gradient for trust-region subproblems.
//! - [`trust_region`]: the Riemannian trust-region method and the objective trait it
//!   optimizes.
//! - [`lobpcg`]: block eigensolver for the smallest eigenpairs of the certificate.

pub mod lanczos;
pub mod lobpcg;
pub mod tcg;
pub mod trust_region;
