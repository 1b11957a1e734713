//! Locally optimal block preconditioned conjugate gradient (LOBPCG) for the smallest
//! eigenpairs of a symmetric operator.
//!
//! Each iteration performs a Rayleigh-Ritz projection onto the span of
//! `[X, W, P]`: the current block `X`, the preconditioned residuals `W = T(AX - XΘ)`
//! and the previous search directions `P`. The trial basis is orthonormalized through
//! an eigendecomposition of its Gram matrix, discarding directions whose Gram
//! eigenvalue is negligible ("soft" basis selection), which keeps the projected problem
//! well conditioned when the blocks become nearly dependent. The new `P` is the part
//! of the updated block orthogonal to the previous `X`.
//!
//! Only the action of the operator and of the (optional) preconditioner is required.

use crate::{
    error::Result,
    matrix::{LinearOperator, axpy},
};
use faer::{Mat, MatRef, Side};
use log::trace;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Gram eigenvalues below this fraction of the largest one are discarded.
const BASIS_DROP_TOLERANCE: f64 = 1e-12;

/// Parameters of one LOBPCG run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LobpcgOptions {
    /// Number of simultaneously iterated vectors; clamped to the operator dimension.
    pub block_size: usize,
    pub max_iterations: usize,
    /// Convergence threshold on the residual norm of the leading Ritz pair.
    pub tolerance: f64,
    /// Seed of the random start block.
    pub seed: u64,
}

/// Output of [`lobpcg`].
#[derive(Debug, Clone)]
pub struct LobpcgResult {
    /// Ritz values in nondecreasing order.
    pub eigenvalues: Vec<f64>,
    /// Orthonormal Ritz vectors, one per column.
    pub eigenvectors: Mat<f64>,
    /// `||A x_k - θ_k x_k||` for every Ritz pair.
    pub residual_norms: Vec<f64>,
    pub iterations: usize,
    /// `true` when the leading residual fell below the tolerance.
    pub converged: bool,
    /// `true` when the stopping callback ended the run.
    pub stopped_early: bool,
}

impl LobpcgResult {
    pub fn min_eigenvalue(&self) -> f64 {
        self.eigenvalues[0]
    }

    pub fn min_eigenvector(&self) -> MatRef<'_, f64> {
        self.eigenvectors.as_ref().subcols(0, 1)
    }
}

/// An orthonormal basis of the column span of `z`, dropping numerically dependent
/// directions.
fn orthonormal_basis(z: MatRef<'_, f64>) -> Result<Mat<f64>> {
    let gram = z.transpose() * z;
    let eigen = gram.self_adjoint_eigen(Side::Lower)?;
    let values = eigen.S().column_vector();
    let largest = (0..z.ncols()).map(|i| values[i]).fold(0.0_f64, f64::max);
    if largest <= 0.0 {
        return Ok(Mat::zeros(z.nrows(), 0));
    }
    let kept: Vec<usize> = (0..z.ncols())
        .filter(|&i| values[i] > BASIS_DROP_TOLERANCE * largest)
        .collect();
    let u = eigen.U();
    let coefficients = Mat::from_fn(z.ncols(), kept.len(), |row, k| {
        u[(row, kept[k])] / values[kept[k]].sqrt()
    });
    Ok(z * coefficients.as_ref())
}

/// Soft basis selection, applied twice so that the basis is orthonormal to working
/// precision.
fn stable_basis(z: MatRef<'_, f64>) -> Result<Mat<f64>> {
    let once = orthonormal_basis(z)?;
    orthonormal_basis(once.as_ref())
}

fn hstack(blocks: &[MatRef<'_, f64>]) -> Mat<f64> {
    let rows = blocks.first().map_or(0, |b| b.nrows());
    let cols = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = Mat::<f64>::zeros(rows, cols);
    let mut offset = 0;
    for block in blocks {
        out.as_mut()
            .submatrix_mut(0, offset, rows, block.ncols())
            .copy_from(*block);
        offset += block.ncols();
    }
    out
}

struct RitzBlock {
    x: Mat<f64>,
    ax: Mat<f64>,
    theta: Vec<f64>,
}

impl RitzBlock {
    fn into_result(
        self,
        residual_norms: Vec<f64>,
        iterations: usize,
        converged: bool,
        stopped_early: bool,
    ) -> LobpcgResult {
        LobpcgResult {
            eigenvalues: self.theta,
            eigenvectors: self.x,
            residual_norms,
            iterations,
            converged,
            stopped_early,
        }
    }
}

/// Rayleigh-Ritz on the orthonormal basis `v`, keeping the `k` smallest pairs.
fn rayleigh_ritz(
    operator: &dyn LinearOperator<f64>,
    v: MatRef<'_, f64>,
    k: usize,
) -> Result<RitzBlock> {
    let av = operator.apply(v);
    let projected = v.transpose() * av.as_ref();
    let symmetric = Mat::from_fn(projected.nrows(), projected.ncols(), |i, j| {
        0.5 * (projected[(i, j)] + projected[(j, i)])
    });
    let eigen = symmetric.self_adjoint_eigen(Side::Lower)?;
    let values = eigen.S().column_vector();
    let k = k.min(v.ncols());
    let coefficients = eigen.U().subcols(0, k);
    Ok(RitzBlock {
        x: v * coefficients,
        ax: av.as_ref() * coefficients,
        theta: (0..k).map(|i| values[i]).collect(),
    })
}

fn residual(block: &RitzBlock) -> Mat<f64> {
    Mat::from_fn(block.x.nrows(), block.x.ncols(), |i, j| {
        block.ax[(i, j)] - block.theta[j] * block.x[(i, j)]
    })
}

fn column_norms(m: MatRef<'_, f64>) -> Vec<f64> {
    (0..m.ncols()).map(|j| m.col(j).norm_l2()).collect()
}

/// Scales every column to unit norm and drops the zero ones, so that basis selection
/// judges directions rather than magnitudes.
fn unit_columns(m: MatRef<'_, f64>) -> Mat<f64> {
    let norms = column_norms(m);
    let kept: Vec<usize> = (0..m.ncols()).filter(|&j| norms[j] > 0.0).collect();
    Mat::from_fn(m.nrows(), kept.len(), |i, k| m[(i, kept[k])] / norms[kept[k]])
}

/// Computes the smallest eigenpairs of the symmetric `operator`.
///
/// `preconditioner`, when given, should approximate the inverse of the operator (or
/// of a positive-definite shift of it) and must be symmetric positive definite.
/// `stop` is called after every Rayleigh-Ritz step with the current Ritz values and
/// residual norms; returning `true` ends the run with `stopped_early` set.
pub fn lobpcg(
    operator: &dyn LinearOperator<f64>,
    preconditioner: Option<&dyn LinearOperator<f64>>,
    options: &LobpcgOptions,
    mut stop: impl FnMut(&[f64], &[f64]) -> bool,
) -> Result<LobpcgResult> {
    let n = operator.nrows();
    let k = options.block_size.clamp(1, n.max(1));

    let mut rng = StdRng::seed_from_u64(options.seed);
    let start = Mat::from_fn(n, k, |_, _| rng.random_range(-1.0..1.0));
    let mut block = rayleigh_ritz(operator, stable_basis(start.as_ref())?.as_ref(), k)?;
    let mut directions: Option<Mat<f64>> = None;

    let mut iterations = 0;
    loop {
        let mut r = residual(&block);
        let norms = column_norms(r.as_ref());
        trace!(
            "LOBPCG iteration {iterations}: theta = {:.6e}, ||r|| = {:.3e}",
            block.theta[0],
            norms[0]
        );

        if norms[0] <= options.tolerance {
            return Ok(block.into_result(norms, iterations, true, false));
        }
        if stop(&block.theta, &norms) {
            return Ok(block.into_result(norms, iterations, false, true));
        }
        if iterations >= options.max_iterations {
            return Ok(block.into_result(norms, iterations, false, false));
        }
        iterations += 1;

        if let Some(t) = preconditioner {
            r = t.apply(r.as_ref());
        }
        // Keep W away from the span of X.
        let overlap = block.x.transpose() * r.as_ref();
        axpy(-1.0, (block.x.as_ref() * overlap.as_ref()).as_ref(), r.as_mut());

        let w = unit_columns(r.as_ref());
        let trial = match &directions {
            Some(p) => hstack(&[block.x.as_ref(), w.as_ref(), unit_columns(p.as_ref()).as_ref()]),
            None => hstack(&[block.x.as_ref(), w.as_ref()]),
        };
        let basis = stable_basis(trial.as_ref())?;
        if basis.ncols() < k {
            return Ok(block.into_result(norms, iterations, false, false));
        }

        let next = rayleigh_ritz(operator, basis.as_ref(), k)?;
        let overlap = block.x.transpose() * next.x.as_ref();
        let mut p = next.x.clone();
        axpy(-1.0, (block.x.as_ref() * overlap.as_ref()).as_ref(), p.as_mut());
        directions = if p.norm_l2() > 0.0 { Some(p) } else { None };
        block = next;
    }
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

    fn options(block_size: usize) -> LobpcgOptions {
        LobpcgOptions {
            block_size,
            max_iterations: 500,
            tolerance: 1e-8,
            seed: 7,
        }
    }

    #[test]
    fn test_smallest_eigenpair_of_path_laplacian() {
        let n = 40;
        let a = laplacian_1d(n);
        let result = lobpcg(&a, None, &options(3), |_, _| false).unwrap();
        assert!(result.converged);

        let exact = 2.0 - 2.0 * (std::f64::consts::PI / (n as f64 + 1.0)).cos();
        assert!((result.min_eigenvalue() - exact).abs() < 1e-10);
        let x = result.min_eigenvector();
        assert!((x.norm_l2() - 1.0).abs() < 1e-12);
        let ax = a.as_ref() * x;
        let r = Mat::from_fn(n, 1, |i, _| ax[(i, 0)] - exact * x[(i, 0)]);
        assert!(r.norm_l2() < 1e-7);
    }

    #[test]
    fn test_preconditioner_is_used() {
        let n = 40;
        let a = Mat::from_fn(n, n, |i, j| {
            if i == j {
                1.0 + 10.0 * i as f64
            } else if i.abs_diff(j) == 1 {
                0.5
            } else {
                0.0
            }
        });
        let jacobi = Mat::from_fn(n, n, |i, j| if i == j { 1.0 / a[(i, i)] } else { 0.0 });
        let plain = lobpcg(&a, None, &options(2), |_, _| false).unwrap();
        let preconditioned =
            lobpcg(&a, Some(&jacobi as &dyn LinearOperator<f64>), &options(2), |_, _| false)
                .unwrap();
        assert!(plain.converged && preconditioned.converged);
        assert!((plain.min_eigenvalue() - preconditioned.min_eigenvalue()).abs() < 1e-10);
        assert!(preconditioned.iterations <= plain.iterations);
    }

    #[test]
    fn test_early_stop_on_negative_ritz_value() {
        let n = 30;
        let mut a = laplacian_1d(n);
        a[(n / 2, n / 2)] = -3.0;
        let result = lobpcg(&a, None, &options(2), |theta, _| theta[0] < -1e-3).unwrap();
        assert!(result.stopped_early);
        assert!(!result.converged);
        // The Rayleigh quotient bounds the smallest eigenvalue from above.
        let x = result.min_eigenvector();
        let quotient = (x.transpose() * a.as_ref() * x)[(0, 0)];
        assert!(quotient < -1e-3);
    }

    #[test]
    fn test_block_size_is_clamped_to_dimension() {
        let a = faer::mat![[2.0, 1.0], [1.0, 2.0]];
        let result = lobpcg(&a, None, &options(5), |_, _| false).unwrap();
        assert!(result.converged);
        assert_eq!(result.eigenvalues.len(), 2);
        assert!((result.eigenvalues[0] - 1.0).abs() < 1e-12);
        assert!((result.eigenvalues[1] - 3.0).abs() < 1e-12);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_iteration_cap_reports_imprecision() {
        let a = laplacian_1d(200);
        let capped = LobpcgOptions {
            max_iterations: 1,
            tolerance: 1e-14,
            ..options(1)
        };
        let result = lobpcg(&a, None, &capped, |_, _| false).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
    }
}
