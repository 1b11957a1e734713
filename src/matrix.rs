//! This module defines the core abstraction for linear operators, plus the handful of
//! dense helpers shared by the solvers.
//!
//! Both eigen-solvers in this crate (the Lanczos estimator used to size the Cholesky
//! regularization and the LOBPCG certifier) only ever need the action `A * X`. The
//! certificate matrix `S = Q - Λ` in particular is never formed: in the simplified
//! formulation `Q` contains a dense projected translational term that is only
//! available through sparse triangular solves. Writing the solvers against
//! [`LinearOperator`] lets the same code run on dense test matrices, on `faer`
//! sparse matrices, and on the matrix-free certificate operator.

use faer::{
    Accum, Mat, MatMut, MatRef, Par,
    prelude::Reborrow,
    sparse::{SparseColMat, Triplet, linalg::matmul::sparse_dense_matmul},
    traits::ComplexField,
};

/// Represents a linear operator that can be applied to a block of vectors.
///
/// # Type Parameters
///
/// *   `T`: The scalar type, which must implement `ComplexField`.
///
/// # Example
///
/// ```
/// use faer::{Mat, MatRef};
/// use sesync::matrix::LinearOperator;
///
/// fn power_step(operator: &impl LinearOperator<f64>, x: MatRef<'_, f64>) -> Mat<f64> {
///     assert_eq!(operator.ncols(), x.nrows());
///     let y = operator.apply(x);
///     let norm = y.norm_l2();
///     Mat::from_fn(y.nrows(), y.ncols(), |i, j| y[(i, j)] / norm)
/// }
///
/// let a = Mat::<f64>::from_fn(3, 3, |i, j| if i == j { (i + 1) as f64 } else { 0.0 });
/// let x = Mat::<f64>::from_fn(3, 1, |_, _| 1.0);
/// let y = power_step(&a, x.as_ref());
/// assert!((y.norm_l2() - 1.0).abs() < 1e-12);
/// ```
pub trait LinearOperator<T: ComplexField> {
    /// Returns the number of rows of the operator.
    fn nrows(&self) -> usize;

    /// Returns the number of columns of the operator.
    fn ncols(&self) -> usize;

    /// Applies the linear operator to a matrix `rhs`, returning `A * rhs`.
    ///
    /// # Panics
    ///
    /// Implementations panic if the inner dimension of the operator does not match
    /// the number of rows of `rhs`.
    fn apply(&self, rhs: MatRef<'_, T>) -> Mat<T>;
}

impl<'a, T: ComplexField> LinearOperator<T> for MatRef<'a, T> {
    #[inline]
    fn nrows(&self) -> usize {
        self.nrows()
    }

    #[inline]
    fn ncols(&self) -> usize {
        self.ncols()
    }

    #[inline]
    fn apply(&self, rhs: MatRef<'_, T>) -> Mat<T> {
        assert_eq!(
            self.ncols(),
            rhs.nrows(),
            "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
            self.ncols(),
            rhs.nrows(),
        );
        self * rhs
    }
}

impl<T: ComplexField> LinearOperator<T> for Mat<T> {
    #[inline]
    fn nrows(&self) -> usize {
        self.as_ref().nrows()
    }

    #[inline]
    fn ncols(&self) -> usize {
        self.as_ref().ncols()
    }

    #[inline]
    fn apply(&self, rhs: MatRef<'_, T>) -> Mat<T> {
        self.as_ref().apply(rhs)
    }
}

/// Sparse matrices are the natural operators for the connection Laplacian and the
/// sparse certificate surrogate.
impl LinearOperator<f64> for SparseColMat<usize, f64> {
    #[inline]
    fn nrows(&self) -> usize {
        self.as_ref().nrows()
    }

    #[inline]
    fn ncols(&self) -> usize {
        self.as_ref().ncols()
    }

    #[inline]
    fn apply(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        assert_eq!(
            self.as_ref().ncols(),
            rhs.nrows(),
            "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
            self.as_ref().ncols(),
            rhs.nrows(),
        );
        self.as_ref() * rhs
    }
}

/// Computes `A * X` for a sparse `A`, with the requested parallelism.
pub fn sparse_matmul(a: &SparseColMat<usize, f64>, x: MatRef<'_, f64>, par: Par) -> Mat<f64> {
    assert_eq!(
        a.as_ref().ncols(),
        x.nrows(),
        "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
        a.as_ref().ncols(),
        x.nrows(),
    );
    let mut out = Mat::<f64>::zeros(a.as_ref().nrows(), x.ncols());
    sparse_dense_matmul(out.as_mut(), Accum::Replace, a.as_ref(), x, 1.0, par);
    out
}

/// Lists the stored entries of a sparse matrix, column by column.
pub fn sparse_triplets(a: &SparseColMat<usize, f64>) -> Vec<Triplet<usize, usize, f64>> {
    let a = a.as_ref();
    let mut triplets = Vec::with_capacity(a.compute_nnz());
    for j in 0..a.ncols() {
        let rows = a.symbolic().row_idx_of_col_raw(j);
        let values = a.val_of_col(j);
        triplets.extend(
            rows.iter()
                .zip(values)
                .map(|(&i, &value)| Triplet::new(i, j, value)),
        );
    }
    triplets
}

/// Frobenius inner product `<A, B> = tr(Aᵀ B)` of two equally-shaped real matrices.
#[inline]
pub fn frobenius_inner(a: MatRef<'_, f64>, b: MatRef<'_, f64>) -> f64 {
    debug_assert_eq!((a.nrows(), a.ncols()), (b.nrows(), b.ncols()));
    let mut acc = 0.0;
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            acc += a[(i, j)] * b[(i, j)];
        }
    }
    acc
}

/// `y <- y + alpha * x`.
#[inline]
pub fn axpy(alpha: f64, x: MatRef<'_, f64>, mut y: MatMut<'_, f64>) {
    debug_assert_eq!((x.nrows(), x.ncols()), (y.nrows(), y.ncols()));
    for j in 0..x.ncols() {
        for i in 0..x.nrows() {
            y[(i, j)] += alpha * x[(i, j)];
        }
    }
}

/// Returns `alpha * x + beta * y` as a new matrix.
#[inline]
pub fn linear_combination(
    alpha: f64,
    x: MatRef<'_, f64>,
    beta: f64,
    y: MatRef<'_, f64>,
) -> Mat<f64> {
    debug_assert_eq!((x.nrows(), x.ncols()), (y.nrows(), y.ncols()));
    Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
        alpha * x[(i, j)] + beta * y[(i, j)]
    })
}

/// Returns `alpha * x` as a new matrix.
#[inline]
pub fn scaled(alpha: f64, x: MatRef<'_, f64>) -> Mat<f64> {
    Mat::from_fn(x.nrows(), x.ncols(), |i, j| alpha * x[(i, j)])
}

/// Sum of the diagonal entries of a square matrix.
pub fn trace(a: MatRef<'_, f64>) -> f64 {
    (0..a.nrows().min(a.ncols())).map(|i| a[(i, i)]).sum()
}

/// Determinant of a small dense square matrix, by Gaussian elimination with partial
/// pivoting. Only used on `d x d` rotation blocks.
pub fn determinant(a: MatRef<'_, f64>) -> f64 {
    assert_eq!(a.nrows(), a.ncols(), "determinant requires a square matrix");
    let n = a.nrows();
    let mut lu = a.to_owned();
    let mut det = 1.0;
    for k in 0..n {
        let pivot_row = (k..n)
            .max_by(|&p, &q| lu[(p, k)].abs().total_cmp(&lu[(q, k)].abs()))
            .unwrap_or(k);
        if lu[(pivot_row, k)] == 0.0 {
            return 0.0;
        }
        if pivot_row != k {
            for j in 0..n {
                let tmp = lu[(k, j)];
                lu[(k, j)] = lu[(pivot_row, j)];
                lu[(pivot_row, j)] = tmp;
            }
            det = -det;
        }
        let pivot = lu[(k, k)];
        det *= pivot;
        for i in (k + 1)..n {
            let factor = lu[(i, k)] / pivot;
            for j in k..n {
                lu[(i, j)] -= factor * lu[(k, j)];
            }
        }
    }
    det
}

/// Returns the symmetric part `(A + Aᵀ) / 2` of a square matrix.
pub fn symmetric_part(a: MatRef<'_, f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| 0.5 * (a[(i, j)] + a[(j, i)]))
}
