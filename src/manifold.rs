//! The product of Stiefel manifolds `St(d, r)^n` on which the relaxed problem lives.
//!
//! A point is stored as a single dense `r x dn` matrix `Y = [Y_1, ..., Y_n]` whose
//! `r x d` column blocks satisfy `Y_iᵀ Y_i = I_d`. Tangent vectors share the same
//! shape. The shape is carried explicitly as the triple `(d, r, n)`; growing the
//! relaxation rank is the explicit pad performed by [`StiefelProduct::lift`].

use crate::{
    error::Result,
    matrix::{determinant, symmetric_part},
};
use faer::{Mat, MatRef};
use rand::Rng;

/// Dimensions of `St(d, r)^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StiefelProduct {
    d: usize,
    r: usize,
    n: usize,
}

impl StiefelProduct {
    /// Creates the manifold `St(d, r)^n`.
    ///
    /// # Panics
    /// Panics if `r < d`: the Stiefel manifold is empty in that case.
    pub fn new(d: usize, r: usize, n: usize) -> Self {
        assert!(r >= d, "St({d}, {r}) is empty: the rank must be at least d");
        Self { d, r, n }
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    pub fn rank(&self) -> usize {
        self.r
    }

    pub fn num_poses(&self) -> usize {
        self.n
    }

    /// Changes the rank `r`, keeping `d` and `n`.
    pub fn set_rank(&mut self, r: usize) {
        assert!(r >= self.d, "St({}, {r}) is empty", self.d);
        self.r = r;
    }

    /// Shape `(r, dn)` of points and tangent vectors.
    pub fn shape(&self) -> (usize, usize) {
        (self.r, self.d * self.n)
    }

    /// Projects an arbitrary `r x dn` matrix onto the manifold, block by block, by
    /// taking the orthogonal polar factor `U Vᵀ` of each `r x d` block.
    pub fn project(&self, a: MatRef<'_, f64>) -> Result<Mat<f64>> {
        debug_assert_eq!((a.nrows(), a.ncols()), self.shape());
        let d = self.d;
        let mut out = Mat::<f64>::zeros(a.nrows(), a.ncols());
        for i in 0..self.n {
            let block = a.submatrix(0, d * i, a.nrows(), d);
            let polar = polar_factor(block)?;
            out.as_mut()
                .submatrix_mut(0, d * i, a.nrows(), d)
                .copy_from(polar.as_ref());
        }
        Ok(out)
    }

    /// Computes `A_i Sym(B_iᵀ C_i)` for every block `i`.
    ///
    /// With `A = B = Y` and `C = V` this is the normal component of `V` at `Y`; with
    /// `B = Y` and `C = ∇F(Y)` it produces the Lagrange-multiplier correction used in
    /// the Riemannian Hessian.
    pub fn sym_block_diag_product(
        &self,
        a: MatRef<'_, f64>,
        b: MatRef<'_, f64>,
        c: MatRef<'_, f64>,
    ) -> Mat<f64> {
        let d = self.d;
        let rows = a.nrows();
        let mut out = Mat::<f64>::zeros(rows, a.ncols());
        for i in 0..self.n {
            let b_i = b.submatrix(0, d * i, b.nrows(), d);
            let c_i = c.submatrix(0, d * i, c.nrows(), d);
            let sym = symmetric_part((b_i.transpose() * c_i).as_ref());
            let a_i = a.submatrix(0, d * i, rows, d);
            out.as_mut()
                .submatrix_mut(0, d * i, rows, d)
                .copy_from((a_i * sym.as_ref()).as_ref());
        }
        out
    }

    /// Orthogonal projection of an ambient `r x dn` matrix onto the tangent space at `y`:
    /// `Proj_Y(V)_i = V_i - Y_i Sym(Y_iᵀ V_i)`.
    pub fn tangent_projection(&self, y: MatRef<'_, f64>, v: MatRef<'_, f64>) -> Mat<f64> {
        let normal = self.sym_block_diag_product(y, y, v);
        Mat::from_fn(v.nrows(), v.ncols(), |i, j| v[(i, j)] - normal[(i, j)])
    }

    /// Retraction `R_Y(V) = π(Y + V)`, with `π` the blockwise polar projection.
    pub fn retract(&self, y: MatRef<'_, f64>, v: MatRef<'_, f64>) -> Result<Mat<f64>> {
        let sum = Mat::from_fn(y.nrows(), y.ncols(), |i, j| y[(i, j)] + v[(i, j)]);
        self.project(sum.as_ref())
    }

    /// Samples a point by projecting a matrix with independent uniform entries.
    pub fn random_sample(&self, rng: &mut impl Rng) -> Result<Mat<f64>> {
        let (rows, cols) = self.shape();
        let ambient = Mat::from_fn(rows, cols, |_, _| rng.random_range(-1.0..1.0));
        self.project(ambient.as_ref())
    }

    /// Pads `y` (an `r x dn` point) with zero rows up to `rank` rows. The result is a
    /// point of `St(d, rank)^n` with the same Gram matrix `YᵀY`.
    pub fn lift(y: MatRef<'_, f64>, rank: usize) -> Mat<f64> {
        assert!(rank >= y.nrows(), "lift cannot reduce the rank");
        let mut out = Mat::<f64>::zeros(rank, y.ncols());
        out.as_mut()
            .submatrix_mut(0, 0, y.nrows(), y.ncols())
            .copy_from(y);
        out
    }

    /// Largest deviation `max_i ||Y_iᵀ Y_i - I||_max` from the manifold constraint.
    pub fn constraint_violation(&self, y: MatRef<'_, f64>) -> f64 {
        let d = self.d;
        let mut worst: f64 = 0.0;
        for i in 0..self.n {
            let y_i = y.submatrix(0, d * i, y.nrows(), d);
            let gram = y_i.transpose() * y_i;
            for a in 0..d {
                for b in 0..d {
                    let target = if a == b { 1.0 } else { 0.0 };
                    worst = worst.max((gram[(a, b)] - target).abs());
                }
            }
        }
        worst
    }
}

/// Orthogonal polar factor `U Vᵀ` of a tall `r x d` matrix with thin SVD `U Σ Vᵀ`.
pub fn polar_factor(a: MatRef<'_, f64>) -> Result<Mat<f64>> {
    let svd = a.thin_svd()?;
    Ok(svd.U() * svd.V().transpose())
}

/// Projects a `d x d` matrix onto SO(d): the closest rotation in the Frobenius norm,
/// `U diag(1, ..., 1, det(U Vᵀ)) Vᵀ`.
pub fn project_to_rotation_group(m: MatRef<'_, f64>) -> Result<Mat<f64>> {
    let d = m.nrows();
    let svd = m.thin_svd()?;
    let u = svd.U();
    let v = svd.V();
    let sign = determinant((u * v.transpose()).as_ref()).signum();
    // Singular values come sorted in nonincreasing order; the correction goes on the
    // direction with the smallest one.
    let correction = Mat::from_fn(d, d, |i, j| match (i == j, i + 1 == d) {
        (true, true) => sign,
        (true, false) => 1.0,
        _ => 0.0,
    });
    Ok(u * correction.as_ref() * v.transpose())
}
