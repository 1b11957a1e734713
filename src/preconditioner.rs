//! Preconditioners for symmetric sparse matrices.
//!
//! Every variant approximates `A⁻¹` for a symmetric `A` and implements
//! [`LinearOperator`], so callers apply them uniformly through
//! [`LinearOperator::apply`] whatever [`PreconditionerKind`] was requested.
//!
//! - [`JacobiPreconditioner`]: `diag(A)⁻¹`.
//! - [`RegularizedCholesky`]: exact sparse Cholesky of `A + λI`, where
//!   `λ = λ_max(A) / (κ_max - 1)` bounds the condition number of the regularized
//!   matrix by `κ_max`. `λ_max` is estimated with Lanczos.
//! - [`IncompleteLdlt`]: left-looking incomplete `LDLᵀ` with a per-column fill limit and
//!   a relative drop tolerance, applied as `(L |D| Lᵀ)⁻¹` so that the operator is
//!   positive definite even when `A` is indefinite.

use crate::{
    algorithms::lanczos::estimate_largest_eigenvalue,
    error::{Result, SeSyncError},
    matrix::{LinearOperator, sparse_triplets},
    options::PreconditionerKind,
};
use faer::{
    Mat, MatRef, Side,
    linalg::solvers::Solve,
    sparse::{
        SparseColMat, Triplet,
        linalg::solvers::{Llt, SymbolicLlt},
    },
};
use log::{debug, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::fmt;

/// Number of Lanczos steps used to estimate `λ_max` for the Cholesky shift.
const LANCZOS_STEPS: usize = 40;

/// Fixed seed of the Lanczos start vector, so that preconditioners are reproducible.
const LANCZOS_SEED: u64 = 0x5e5c;

/// A preconditioner of one of the supported kinds.
#[derive(Debug)]
pub enum Preconditioner {
    Jacobi(JacobiPreconditioner),
    RegularizedCholesky(RegularizedCholesky),
    IncompleteCholesky(IncompleteLdlt),
}

impl Preconditioner {
    /// Builds the preconditioner of the given kind for the symmetric matrix `a`.
    pub fn build(kind: &PreconditionerKind, a: &SparseColMat<usize, f64>) -> Result<Self> {
        Ok(match *kind {
            PreconditionerKind::Jacobi => Preconditioner::Jacobi(JacobiPreconditioner::new(a)),
            PreconditionerKind::RegularizedCholesky {
                max_condition_number,
            } => Preconditioner::RegularizedCholesky(RegularizedCholesky::new(
                a,
                max_condition_number,
            )?),
            PreconditionerKind::IncompleteCholesky {
                max_fill_factor,
                drop_tol,
            } => Preconditioner::IncompleteCholesky(IncompleteLdlt::new(
                a,
                max_fill_factor,
                drop_tol,
            )?),
        })
    }

    fn operator(&self) -> &dyn LinearOperator<f64> {
        match self {
            Preconditioner::Jacobi(p) => p,
            Preconditioner::RegularizedCholesky(p) => p,
            Preconditioner::IncompleteCholesky(p) => p,
        }
    }
}

impl LinearOperator<f64> for Preconditioner {
    fn nrows(&self) -> usize {
        self.operator().nrows()
    }

    fn ncols(&self) -> usize {
        self.operator().ncols()
    }

    fn apply(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        self.operator().apply(rhs)
    }
}

fn check_square(a: &SparseColMat<usize, f64>) -> Result<usize> {
    let a = a.as_ref();
    if a.nrows() != a.ncols() {
        return Err(SeSyncError::factorization(format!(
            "preconditioners require a square matrix, got {}x{}",
            a.nrows(),
            a.ncols()
        )));
    }
    Ok(a.nrows())
}

fn check_rhs(dim: usize, rhs: MatRef<'_, f64>) {
    assert_eq!(
        dim,
        rhs.nrows(),
        "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
        dim,
        rhs.nrows(),
    );
}

/// Diagonal (Jacobi) preconditioner.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner {
    inverse_diagonal: Vec<f64>,
}

impl JacobiPreconditioner {
    /// Inverts the diagonal of `a`. Non-positive diagonal entries are replaced by one.
    pub fn new(a: &SparseColMat<usize, f64>) -> Self {
        let dim = a.as_ref().nrows();
        let mut diagonal = vec![0.0; dim];
        for t in sparse_triplets(a) {
            if t.row == t.col {
                diagonal[t.row] += t.val;
            }
        }
        let inverse_diagonal = diagonal
            .into_iter()
            .map(|value| if value > 0.0 { 1.0 / value } else { 1.0 })
            .collect();
        Self { inverse_diagonal }
    }
}

impl LinearOperator<f64> for JacobiPreconditioner {
    fn nrows(&self) -> usize {
        self.inverse_diagonal.len()
    }

    fn ncols(&self) -> usize {
        self.inverse_diagonal.len()
    }

    fn apply(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        check_rhs(self.inverse_diagonal.len(), rhs);
        Mat::from_fn(rhs.nrows(), rhs.ncols(), |i, j| {
            self.inverse_diagonal[i] * rhs[(i, j)]
        })
    }
}

/// Sparse Cholesky factorization of a diagonally regularized matrix.
pub struct RegularizedCholesky {
    max_condition_number: f64,
    shift: f64,
    dim: usize,
    // Column pointers and row indices of the regularized matrix.
    pattern: (Vec<usize>, Vec<usize>),
    symbolic: SymbolicLlt<usize>,
    factor: Llt<usize, f64>,
}

impl fmt::Debug for RegularizedCholesky {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegularizedCholesky")
            .field("dim", &self.dim)
            .field("nnz", &self.pattern.1.len())
            .field("shift", &self.shift)
            .field("max_condition_number", &self.max_condition_number)
            .finish_non_exhaustive()
    }
}

impl RegularizedCholesky {
    pub fn new(a: &SparseColMat<usize, f64>, max_condition_number: f64) -> Result<Self> {
        check_square(a)?;
        let shift = regularization_shift(a, max_condition_number)?;
        let regularized = shifted(a, shift)?;
        let symbolic = SymbolicLlt::try_new(regularized.symbolic(), Side::Lower).map_err(|e| {
            SeSyncError::factorization(format!("symbolic Cholesky analysis failed: {e:?}"))
        })?;
        let factor = numeric_factorization(&symbolic, &regularized)?;
        debug!(
            "Regularized Cholesky preconditioner: dim = {}, shift = {shift:.3e}",
            regularized.nrows()
        );
        Ok(Self {
            max_condition_number,
            shift,
            dim: regularized.nrows(),
            pattern: pattern_of(&regularized),
            symbolic,
            factor,
        })
    }

    /// The diagonal shift `λ` added before factoring.
    pub fn shift(&self) -> f64 {
        self.shift
    }

    /// Refactors for a new matrix; the symbolic analysis is reused when the sparsity
    /// pattern of the regularized matrix is unchanged.
    pub fn refresh(&mut self, a: &SparseColMat<usize, f64>) -> Result<()> {
        let shift = regularization_shift(a, self.max_condition_number)?;
        let regularized = shifted(a, shift)?;
        if pattern_of(&regularized) != self.pattern {
            debug!("Sparsity pattern changed; redoing the symbolic Cholesky analysis");
            *self = Self::new(a, self.max_condition_number)?;
            return Ok(());
        }
        self.factor = numeric_factorization(&self.symbolic, &regularized)?;
        self.shift = shift;
        Ok(())
    }
}

fn pattern_of(a: &SparseColMat<usize, f64>) -> (Vec<usize>, Vec<usize>) {
    let symbolic = a.symbolic();
    (symbolic.col_ptr().to_vec(), symbolic.row_idx().to_vec())
}

fn numeric_factorization(
    symbolic: &SymbolicLlt<usize>,
    a: &SparseColMat<usize, f64>,
) -> Result<Llt<usize, f64>> {
    Llt::try_new_with_symbolic(symbolic.clone(), a.as_ref(), Side::Lower)
        .map_err(|e| SeSyncError::factorization(format!("sparse Cholesky failed: {e:?}")))
}

fn regularization_shift(a: &SparseColMat<usize, f64>, max_condition_number: f64) -> Result<f64> {
    let dim = a.as_ref().nrows();
    let mut rng = StdRng::seed_from_u64(LANCZOS_SEED);
    let start = Mat::from_fn(dim, 1, |_, _| rng.random_range(-1.0..1.0));
    let lambda_max = estimate_largest_eigenvalue(a, start.as_ref(), LANCZOS_STEPS)?;
    if !(lambda_max > 0.0) {
        warn!("Largest eigenvalue estimate is {lambda_max:.3e}; using a unit shift");
        return Ok(1.0);
    }
    Ok(lambda_max / (max_condition_number - 1.0))
}

/// Returns `a + shift * I`. Every diagonal entry is present in the result, so the
/// pattern does not depend on which diagonal entries of `a` happen to be stored.
fn shifted(a: &SparseColMat<usize, f64>, shift: f64) -> Result<SparseColMat<usize, f64>> {
    let dim = a.as_ref().nrows();
    let mut triplets = sparse_triplets(a);
    triplets.extend((0..dim).map(|i| Triplet::new(i, i, shift)));
    SparseColMat::try_new_from_triplets(dim, dim, &triplets)
        .map_err(|e| SeSyncError::factorization(format!("failed to regularize matrix: {e:?}")))
}

impl LinearOperator<f64> for RegularizedCholesky {
    fn nrows(&self) -> usize {
        self.dim
    }

    fn ncols(&self) -> usize {
        self.dim
    }

    fn apply(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        check_rhs(self.dim, rhs);
        self.factor.solve(rhs)
    }
}

/// Incomplete `LDLᵀ` factorization with threshold dropping.
///
/// `L` is unit lower triangular and stored by columns, without the unit diagonal.
#[derive(Debug, Clone)]
pub struct IncompleteLdlt {
    columns: Vec<Vec<(usize, f64)>>,
    diagonal: Vec<f64>,
}

impl IncompleteLdlt {
    /// Factors the symmetric matrix `a`, of which only the lower triangle is read.
    ///
    /// Column `k` of `L` keeps at most `⌈max_fill_factor · nnz(a) / dim(a)⌉` entries;
    /// entries with `|l| <= drop_tol · ||L_k||₁` are discarded first. Pivots smaller than
    /// `1e-8 · max |a_ii|` in magnitude are floored to that value.
    pub fn new(a: &SparseColMat<usize, f64>, max_fill_factor: f64, drop_tol: f64) -> Result<Self> {
        let dim = check_square(a)?;
        let a_ref = a.as_ref();
        let nnz = a_ref.compute_nnz();
        let fill_limit = if dim == 0 {
            0
        } else {
            ((max_fill_factor * nnz as f64) / dim as f64).ceil().max(1.0) as usize
        };

        let mut max_diagonal: f64 = 0.0;
        for t in sparse_triplets(a) {
            if t.row == t.col {
                max_diagonal = max_diagonal.max(t.val.abs());
            }
        }
        let pivot_floor = 1e-8 * max_diagonal.max(1.0);

        let mut columns: Vec<Vec<(usize, f64)>> = Vec::with_capacity(dim);
        let mut diagonal = vec![0.0; dim];
        // rows[k] lists (j, L[k, j]) for the finished columns j < k with a nonzero in row k.
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); dim];
        let mut work = vec![0.0; dim];
        let mut occupied = vec![false; dim];
        let mut pattern: Vec<usize> = Vec::new();
        let mut floored = 0usize;

        for k in 0..dim {
            let mut touch = |i: usize, pattern: &mut Vec<usize>| {
                if !occupied[i] {
                    occupied[i] = true;
                    pattern.push(i);
                }
            };

            for (&i, &value) in a_ref
                .symbolic()
                .row_idx_of_col_raw(k)
                .iter()
                .zip(a_ref.val_of_col(k))
            {
                if i >= k {
                    touch(i, &mut pattern);
                    work[i] += value;
                }
            }
            for &(j, l_kj) in &rows[k] {
                let scale = l_kj * diagonal[j];
                work[k] -= scale * l_kj;
                for &(i, l_ij) in &columns[j] {
                    if i > k {
                        touch(i, &mut pattern);
                        work[i] -= scale * l_ij;
                    }
                }
            }

            let mut pivot = work[k];
            if pivot.abs() < pivot_floor {
                pivot = if pivot < 0.0 { -pivot_floor } else { pivot_floor };
                floored += 1;
            }
            diagonal[k] = pivot;

            let mut candidates: Vec<(usize, f64)> = pattern
                .iter()
                .filter(|&&i| i > k)
                .map(|&i| (i, work[i] / pivot))
                .filter(|&(_, l)| l != 0.0)
                .collect();
            let column_norm: f64 = candidates.iter().map(|(_, l)| l.abs()).sum();
            candidates.retain(|&(_, l)| l.abs() > drop_tol * column_norm);
            if candidates.len() > fill_limit {
                candidates.sort_by(|x, y| y.1.abs().total_cmp(&x.1.abs()));
                candidates.truncate(fill_limit);
            }
            candidates.sort_by_key(|&(i, _)| i);

            for &(i, l) in &candidates {
                rows[i].push((k, l));
            }
            columns.push(candidates);

            for &i in &pattern {
                work[i] = 0.0;
                occupied[i] = false;
            }
            pattern.clear();
        }

        if floored > 0 {
            warn!("Incomplete LDLᵀ floored {floored} of {dim} pivots");
        }
        debug!(
            "Incomplete LDLᵀ: dim = {dim}, nnz(L) = {}, fill limit per column = {fill_limit}",
            columns.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            columns,
            diagonal,
        })
    }

    /// Number of stored strictly-lower entries of `L`.
    pub fn nnz(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    /// The pivots `D` of the factorization (before taking absolute values).
    pub fn diagonal(&self) -> &[f64] {
        &self.diagonal
    }

    fn solve_column(&self, x: &mut [f64]) {
        for (j, column) in self.columns.iter().enumerate() {
            let x_j = x[j];
            if x_j != 0.0 {
                for &(i, l) in column {
                    x[i] -= l * x_j;
                }
            }
        }
        for (x_j, d) in x.iter_mut().zip(&self.diagonal) {
            *x_j /= d.abs();
        }
        for (j, column) in self.columns.iter().enumerate().rev() {
            let correction: f64 = column.iter().map(|&(i, l)| l * x[i]).sum();
            x[j] -= correction;
        }
    }
}

impl LinearOperator<f64> for IncompleteLdlt {
    fn nrows(&self) -> usize {
        self.diagonal.len()
    }

    fn ncols(&self) -> usize {
        self.diagonal.len()
    }

    fn apply(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        check_rhs(self.diagonal.len(), rhs);
        let mut out = Mat::<f64>::zeros(rhs.nrows(), rhs.ncols());
        let mut x = vec![0.0; rhs.nrows()];
        for c in 0..rhs.ncols() {
            for (i, x_i) in x.iter_mut().enumerate() {
                *x_i = rhs[(i, c)];
            }
            self.solve_column(&mut x);
            for (i, &x_i) in x.iter().enumerate() {
                out[(i, c)] = x_i;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Symmetric positive definite 2D grid Laplacian plus identity.
    fn grid_matrix(side: usize) -> SparseColMat<usize, f64> {
        let dim = side * side;
        let mut triplets = Vec::new();
        for x in 0..side {
            for y in 0..side {
                let k = x * side + y;
                triplets.push(Triplet::new(k, k, 5.0));
                if x + 1 < side {
                    triplets.push(Triplet::new(k, k + side, -1.0));
                    triplets.push(Triplet::new(k + side, k, -1.0));
                }
                if y + 1 < side {
                    triplets.push(Triplet::new(k, k + 1, -1.0));
                    triplets.push(Triplet::new(k + 1, k, -1.0));
                }
            }
        }
        SparseColMat::try_new_from_triplets(dim, dim, &triplets).unwrap()
    }

    fn rhs(dim: usize) -> Mat<f64> {
        Mat::from_fn(dim, 2, |i, j| ((i + 3 * j) % 7) as f64 - 3.0)
    }

    #[test]
    fn test_jacobi_inverts_diagonal() {
        let a = grid_matrix(3);
        let p = Preconditioner::build(&PreconditionerKind::Jacobi, &a).unwrap();
        let b = rhs(9);
        let x = p.apply(b.as_ref());
        assert!((x[(4, 1)] - b[(4, 1)] / 5.0).abs() < 1e-15);
    }

    #[test]
    fn test_regularized_cholesky_solves_shifted_system() {
        let a = grid_matrix(4);
        let kind = PreconditionerKind::RegularizedCholesky {
            max_condition_number: 100.0,
        };
        let p = Preconditioner::build(&kind, &a).unwrap();
        let Preconditioner::RegularizedCholesky(chol) = &p else {
            panic!("wrong preconditioner variant");
        };
        // λ_max of the grid matrix is below 5 + 4 = 9.
        assert!(chol.shift() > 0.0 && chol.shift() < 9.0 / 99.0 + 1e-9);

        let b = rhs(16);
        let x = p.apply(b.as_ref());
        let dense = a.as_ref().to_dense();
        let residual = &dense * &x + Mat::from_fn(16, 2, |i, j| chol.shift() * x[(i, j)]) - &b;
        assert!(residual.norm_l2() < 1e-10);
    }

    #[test]
    fn test_regularized_cholesky_refresh_reuses_pattern() {
        let a = grid_matrix(3);
        let mut chol = RegularizedCholesky::new(&a, 1e4).unwrap();
        let doubled = SparseColMat::try_new_from_triplets(
            9,
            9,
            &sparse_triplets(&a)
                .into_iter()
                .map(|t| Triplet::new(t.row, t.col, 2.0 * t.val))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let before = chol.shift();
        chol.refresh(&doubled).unwrap();
        assert!((chol.shift() - 2.0 * before).abs() < 1e-8 * before.max(1.0));

        let b = rhs(9);
        let x = chol.apply(b.as_ref());
        let dense = doubled.as_ref().to_dense();
        let residual = &dense * &x + Mat::from_fn(9, 2, |i, j| chol.shift() * x[(i, j)]) - &b;
        assert!(residual.norm_l2() < 1e-10);
    }

    #[test]
    fn test_incomplete_ldlt_without_dropping_is_exact() {
        let a = grid_matrix(4);
        // With unlimited fill and no dropping the factorization is complete.
        let ildl = IncompleteLdlt::new(&a, 100.0, 0.0).unwrap();
        let b = rhs(16);
        let x = ildl.apply(b.as_ref());
        let residual = a.as_ref().to_dense() * &x - &b;
        assert!(residual.norm_l2() < 1e-10);
    }

    #[test]
    fn test_incomplete_ldlt_respects_fill_limit_and_stays_positive() {
        let a = grid_matrix(6);
        let dim = 36;
        let nnz = a.as_ref().compute_nnz();
        let ildl = IncompleteLdlt::new(&a, 1.0, 1e-2).unwrap();
        let limit = (nnz as f64 / dim as f64).ceil() as usize;
        assert!(ildl.columns.iter().all(|c| c.len() <= limit));
        assert!(ildl.nnz() <= limit * dim);

        // The operator is symmetric positive definite.
        let identity = Mat::<f64>::identity(dim, dim);
        let p = ildl.apply(identity.as_ref());
        let asymmetry = (p.as_ref() - p.transpose()).norm_l2();
        assert!(asymmetry < 1e-12);
        let b = rhs(dim);
        for c in 0..2 {
            let col = b.as_ref().subcols(c, 1);
            let quad = (col.transpose() * ildl.apply(col)).as_ref()[(0, 0)];
            assert!(quad > 0.0);
        }
    }

    #[test]
    fn test_incomplete_ldlt_handles_indefinite_input() {
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(1, 1, -2.0),
            Triplet::new(0, 1, 0.5),
            Triplet::new(1, 0, 0.5),
            Triplet::new(2, 2, 0.0),
        ];
        let a = SparseColMat::try_new_from_triplets(3, 3, &triplets).unwrap();
        let ildl = IncompleteLdlt::new(&a, 10.0, 0.0).unwrap();
        assert!(ildl.diagonal()[1] < 0.0);
        // The zero pivot is floored.
        assert!(ildl.diagonal()[2] > 0.0);
        let b = Mat::from_fn(3, 1, |i, _| (i + 1) as f64);
        let x = ildl.apply(b.as_ref());
        let quad: f64 = (0..3).map(|i| x[(i, 0)] * b[(i, 0)]).sum();
        assert!(quad > 0.0);
    }
}
