//! Symmetric Lanczos process for extreme-eigenvalue estimation.
//!
//! The regularized Cholesky preconditioner needs an estimate of `λ_max` of the
//! rotational connection Laplacian to choose its diagonal shift. This module runs `k`
//! steps of the Lanczos recurrence, storing the basis `V_k` (`O(nk)` memory), and reads
//! the estimate off the eigenvalues of the tridiagonal matrix `T_k`.
//!
//! The basis is fully reorthogonalized at every step. `k` is small (tens of vectors)
//! in this use, and without reorthogonalization spurious copies of converged Ritz
//! values appear after a few dozen steps.

use crate::{error::Result, matrix::LinearOperator};
use faer::{Accum, Mat, MatRef, Par, Side, linalg::matmul::matmul};

/// The scalar output of the Lanczos process: the diagonal `alphas` and off-diagonal
/// `betas` of `T_k`, plus the norm of the starting vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LanczosDecomposition {
    pub alphas: Vec<f64>,
    pub betas: Vec<f64>,
    pub steps_taken: usize,
    pub b_norm: f64,
    /// The residual coefficient `β_k` after the last step, used for error bounds.
    pub residual_beta: f64,
}

/// Output of [`lanczos_standard`]: the basis `V_k` and the tridiagonal coefficients.
#[derive(Debug, Clone)]
pub struct LanczosOutput {
    pub v_k: Mat<f64>,
    pub decomposition: LanczosDecomposition,
}

/// Relative threshold under which `β` is treated as an exact breakdown.
fn breakdown_tolerance() -> f64 {
    f64::EPSILON.sqrt()
}

/// Performs up to `k` steps of the symmetric Lanczos process with full
/// reorthogonalization, starting from `b`.
///
/// Terminates early on breakdown (the Krylov subspace is invariant). A zero `b` yields
/// zero steps.
pub fn lanczos_standard(
    operator: &impl LinearOperator<f64>,
    b: MatRef<'_, f64>,
    k: usize,
) -> LanczosOutput {
    assert_eq!(
        operator.ncols(),
        b.nrows(),
        "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
        operator.ncols(),
        b.nrows(),
    );
    let n = operator.nrows();
    let k = k.min(n);
    let b_norm = b.norm_l2();

    let mut v_k = Mat::<f64>::zeros(n, k);
    let mut alphas = Vec::with_capacity(k);
    let mut betas = Vec::with_capacity(k.saturating_sub(1));
    let mut residual_beta = 0.0;

    if b_norm == 0.0 || k == 0 {
        return LanczosOutput {
            v_k: Mat::zeros(n, 0),
            decomposition: LanczosDecomposition {
                alphas,
                betas,
                steps_taken: 0,
                b_norm,
                residual_beta,
            },
        };
    }

    for i in 0..n {
        v_k[(i, 0)] = b[(i, 0)] / b_norm;
    }

    let mut steps_taken = 0;
    for j in 0..k {
        let mut w = operator.apply(v_k.as_ref().subcols(j, 1));
        let alpha: f64 = (0..n).map(|i| w[(i, 0)] * v_k[(i, j)]).sum();
        alphas.push(alpha);
        steps_taken += 1;

        // w <- w - V_j (V_jᵀ w), twice: classical Gram-Schmidt needs the second pass.
        for _ in 0..2 {
            let basis = v_k.as_ref().subcols(0, j + 1);
            let coefficients = basis.transpose() * w.as_ref();
            matmul(
                w.as_mut(),
                Accum::Add,
                basis,
                coefficients.as_ref(),
                -1.0,
                Par::Seq,
            );
        }

        let beta = w.norm_l2();
        residual_beta = beta;
        if beta <= breakdown_tolerance() * alpha.abs().max(1.0) {
            break;
        }
        if j + 1 < k {
            betas.push(beta);
            for i in 0..n {
                v_k[(i, j + 1)] = w[(i, 0)] / beta;
            }
        }
    }

    let v_k = if steps_taken == k {
        v_k
    } else {
        v_k.as_ref().subcols(0, steps_taken).to_owned()
    };

    LanczosOutput {
        v_k,
        decomposition: LanczosDecomposition {
            alphas,
            betas,
            steps_taken,
            b_norm,
            residual_beta,
        },
    }
}

/// Assembles the dense tridiagonal matrix `T_k` from its coefficients.
pub fn tridiagonal(alphas: &[f64], betas: &[f64]) -> Mat<f64> {
    let k = alphas.len();
    let mut t_k = Mat::<f64>::zeros(k, k);
    for i in 0..k {
        t_k[(i, i)] = alphas[i];
        if i + 1 < k {
            t_k[(i, i + 1)] = betas[i];
            t_k[(i + 1, i)] = betas[i];
        }
    }
    t_k
}

/// Estimates the largest eigenvalue of a symmetric operator from `k` Lanczos steps
/// started at `b`.
///
/// Returns the largest Ritz value padded by its residual bound `β_k |s_k|`; an
/// eigenvalue of the operator lies within that distance of the Ritz value.
pub fn estimate_largest_eigenvalue(
    operator: &impl LinearOperator<f64>,
    b: MatRef<'_, f64>,
    k: usize,
) -> Result<f64> {
    let output = lanczos_standard(operator, b, k);
    let decomposition = &output.decomposition;
    if decomposition.steps_taken == 0 {
        return Ok(0.0);
    }

    let t_k = tridiagonal(&decomposition.alphas, &decomposition.betas);
    let eigen = t_k.self_adjoint_eigen(Side::Lower)?;
    let last = decomposition.steps_taken - 1;
    let theta = eigen.S().column_vector()[last];
    let bound = decomposition.residual_beta * eigen.U()[(last, last)].abs();
    Ok(theta + bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn laplacian_1d(n: usize) -> Mat<f64> {
        Mat::from_fn(n, n, |i, j| {
            if i == j {
                2.0
            } else if i.abs_diff(j) == 1 {
                -1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_basis_is_orthonormal_and_tridiagonalizes() {
        let a = laplacian_1d(30);
        let b = Mat::from_fn(30, 1, |i, _| 1.0 + i as f64 * 0.1);
        let output = lanczos_standard(&a, b.as_ref(), 10);
        assert_eq!(output.decomposition.steps_taken, 10);

        let v = output.v_k.as_ref();
        let gram = v.transpose() * v;
        let identity = Mat::<f64>::identity(10, 10);
        assert!((&gram - &identity).norm_l2() < 1e-12);

        let projected = v.transpose() * a.as_ref() * v;
        let t_k = tridiagonal(&output.decomposition.alphas, &output.decomposition.betas);
        assert!((&projected - &t_k).norm_l2() < 1e-10);
    }

    #[test]
    fn test_largest_eigenvalue_estimate() {
        let n = 40;
        let a = laplacian_1d(n);
        let b = Mat::from_fn(n, 1, |i, _| ((i * 7 % 11) as f64) - 5.0);
        let estimate = estimate_largest_eigenvalue(&a, b.as_ref(), n).unwrap();
        let exact = 2.0 - 2.0 * (std::f64::consts::PI * n as f64 / (n as f64 + 1.0)).cos();
        assert!((estimate - exact).abs() < 1e-8);

        let rough = estimate_largest_eigenvalue(&a, b.as_ref(), 8).unwrap();
        assert!(rough > 3.9 && rough < exact);
    }

    #[test]
    fn test_zero_start_vector_takes_no_steps() {
        let a = laplacian_1d(5);
        let b = Mat::<f64>::zeros(5, 1);
        let output = lanczos_standard(&a, b.as_ref(), 3);
        assert_eq!(output.decomposition.steps_taken, 0);
        assert_eq!(estimate_largest_eigenvalue(&a, b.as_ref(), 3).unwrap(), 0.0);
    }

    #[test]
    fn test_breakdown_on_invariant_subspace() {
        let a = Mat::<f64>::from_fn(6, 6, |i, j| if i == j { (i + 1) as f64 } else { 0.0 });
        let mut b = Mat::<f64>::zeros(6, 1);
        b[(0, 0)] = 1.0;
        b[(3, 0)] = 1.0;
        let output = lanczos_standard(&a, b.as_ref(), 6);
        assert_eq!(output.decomposition.steps_taken, 2);
        let estimate = estimate_largest_eigenvalue(&a, b.as_ref(), 6).unwrap();
        assert!((estimate - 4.0).abs() < 1e-10);
    }
}
