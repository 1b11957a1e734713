//! The rank-restricted SE-Sync problem.
//!
//! [`SeSyncProblem`] owns the immutable data of a synchronization instance (the
//! connection Laplacian, the translational data matrices and a factorization of the
//! reduced translational Laplacian) together with the mutable relaxation rank `r`.
//! It exposes everything the Riemannian Staircase needs at that rank: the objective
//! `F(Y) = tr(Q YᵀY)`, its Riemannian gradient and Hessian, the preconditioner, the
//! retraction, the certificate `S = Q - Λ(Y)`, initialization, rounding and translation
//! recovery.
//!
//! `Q` is never formed. In the simplified formulation
//! `Q = L(G^ρ) + Σ̃ - Ṽᵀ L(W^τ)⁻¹ Ṽ`, and the last term is dense; products with it go
//! through sparse products and a solve with the factored `L(W^τ)`.

use crate::{
    algorithms::trust_region::RiemannianObjective,
    error::{Result, SeSyncError},
    manifold::{StiefelProduct, project_to_rotation_group},
    matrix::{LinearOperator, axpy, determinant, frobenius_inner, sparse_matmul, sparse_triplets},
    measurement::{self, RelativePoseMeasurement},
    options::{Formulation, Initialization, ProjectionFactorization, SeSyncOptions},
    preconditioner::Preconditioner,
    utils::construction,
};
use faer::{
    Mat, MatRef, Par, Scale, Side,
    linalg::{
        solvers::Solve,
        triangular_solve::{solve_lower_triangular_in_place, solve_upper_triangular_in_place},
    },
    sparse::{
        SparseColMat, Triplet,
        linalg::solvers::{Llt, SymbolicLlt},
    },
};
use log::debug;
use rand::{SeedableRng, rngs::StdRng};

/// Solver for systems with the reduced translational Laplacian `L(W^τ)`.
enum TranslationalSolver {
    Cholesky(Llt<usize, f64>),
    /// Upper-triangular `R` from a thin QR of `Ω^{1/2} Āᵀ`, so that `RᵀR = L(W^τ)`.
    Qr(Mat<f64>),
}

impl TranslationalSolver {
    fn new(
        measurements: &[RelativePoseMeasurement],
        n: usize,
        factorization: ProjectionFactorization,
    ) -> Result<Self> {
        match factorization {
            ProjectionFactorization::Cholesky => {
                let laplacian = construction::reduced_translational_laplacian(measurements, n)?;
                Ok(TranslationalSolver::Cholesky(sparse_cholesky(
                    &laplacian,
                    "reduced translational Laplacian",
                )?))
            }
            ProjectionFactorization::Qr => {
                let incidence = construction::weighted_reduced_incidence_transpose(measurements, n);
                let r = incidence.qr().thin_R().to_owned();
                let largest = (0..r.nrows())
                    .map(|i| r[(i, i)].abs())
                    .fold(0.0_f64, f64::max);
                if (0..r.nrows()).any(|i| r[(i, i)].abs() <= 1e-12 * largest.max(1.0)) {
                    return Err(SeSyncError::factorization(
                        "QR factor of the reduced incidence matrix is singular",
                    ));
                }
                Ok(TranslationalSolver::Qr(r))
            }
        }
    }

    fn solve(&self, b: MatRef<'_, f64>, par: Par) -> Mat<f64> {
        match self {
            TranslationalSolver::Cholesky(llt) => llt.solve(b),
            TranslationalSolver::Qr(r) => {
                let mut x = b.to_owned();
                solve_lower_triangular_in_place(r.transpose(), x.as_mut(), par);
                solve_upper_triangular_in_place(r.as_ref(), x.as_mut(), par);
                x
            }
        }
    }
}

fn sparse_cholesky(a: &SparseColMat<usize, f64>, what: &str) -> Result<Llt<usize, f64>> {
    let symbolic = SymbolicLlt::try_new(a.symbolic(), Side::Lower).map_err(|e| {
        SeSyncError::factorization(format!("symbolic analysis of the {what} failed: {e:?}"))
    })?;
    Llt::try_new_with_symbolic(symbolic, a.as_ref(), Side::Lower).map_err(|e| {
        SeSyncError::factorization(format!("the {what} is not positive definite: {e:?}"))
    })
}

/// An SE-Sync problem instance at a given relaxation rank.
pub struct SeSyncProblem {
    d: usize,
    n: usize,
    num_measurements: usize,
    manifold: StiefelProduct,
    formulation: Formulation,
    par: Par,
    lg_rho: SparseColMat<usize, f64>,
    sigma: SparseColMat<usize, f64>,
    v: SparseColMat<usize, f64>,
    vt: SparseColMat<usize, f64>,
    translational: TranslationalSolver,
    preconditioner: Preconditioner,
}

impl std::fmt::Debug for SeSyncProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeSyncProblem")
            .field("d", &self.d)
            .field("n", &self.n)
            .field("num_measurements", &self.num_measurements)
            .field("rank", &self.manifold.rank())
            .field("formulation", &self.formulation)
            .field("preconditioner", &self.preconditioner)
            .finish_non_exhaustive()
    }
}

/// `true` when fewer than `⌊n/2⌋` of the `n` rounded blocks have positive determinant.
fn reflection_needed(positive: usize, n: usize) -> bool {
    positive < n / 2
}

impl SeSyncProblem {
    /// Builds the problem from raw measurements.
    ///
    /// The formulation, the factorization used for `L(W^τ)`, the preconditioner kind
    /// and the thread count are read from `options`; the rank starts at `options.r0`.
    /// `options` is validated before any matrix is assembled or factored.
    pub fn new(measurements: &[RelativePoseMeasurement], options: &SeSyncOptions) -> Result<Self> {
        let (d, n) = measurement::validate(measurements)?;
        options.validate(d)?;

        let lg_rho = construction::rotational_connection_laplacian(measurements, d, n)?;
        let sigma = construction::translational_covariance(measurements, d, n)?;
        let (v, vt) = construction::translational_data_matrix(measurements, d, n)?;
        let translational =
            TranslationalSolver::new(measurements, n, options.projection_factorization)?;
        let preconditioner = Preconditioner::build(&options.preconditioner, &lg_rho)?;

        debug!(
            "Constructed SE-Sync problem: d = {d}, n = {n}, m = {}, formulation = {:?}, nnz(L(G^rho)) = {}",
            measurements.len(),
            options.formulation,
            lg_rho.as_ref().compute_nnz()
        );

        Ok(Self {
            d,
            n,
            num_measurements: measurements.len(),
            manifold: StiefelProduct::new(d, options.r0, n),
            formulation: options.formulation,
            par: options.parallelism(),
            lg_rho,
            sigma,
            v,
            vt,
            translational,
            preconditioner,
        })
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    pub fn num_poses(&self) -> usize {
        self.n
    }

    pub fn num_measurements(&self) -> usize {
        self.num_measurements
    }

    pub fn formulation(&self) -> Formulation {
        self.formulation
    }

    pub fn relaxation_rank(&self) -> usize {
        self.manifold.rank()
    }

    /// Sets the rank `r` of the Stiefel factors. The data matrices are unaffected.
    pub fn set_relaxation_rank(&mut self, r: usize) {
        self.manifold.set_rank(r);
    }

    pub fn manifold(&self) -> &StiefelProduct {
        &self.manifold
    }

    pub fn rotational_connection_laplacian(&self) -> &SparseColMat<usize, f64> {
        &self.lg_rho
    }

    /// Applies `Q` to the columns of a `dn x k` matrix.
    pub fn apply_q(&self, z: MatRef<'_, f64>) -> Mat<f64> {
        let mut out = sparse_matmul(&self.lg_rho, z, self.par);
        if self.formulation == Formulation::Simplified {
            let sigma_z = sparse_matmul(&self.sigma, z, self.par);
            axpy(1.0, sigma_z.as_ref(), out.as_mut());
            let vz = sparse_matmul(&self.v, z, self.par);
            let projected = self.translational.solve(vz.as_ref(), self.par);
            let correction = sparse_matmul(&self.vt, projected.as_ref(), self.par);
            axpy(-1.0, correction.as_ref(), out.as_mut());
        }
        out
    }

    /// Computes `Y Q` for an `r x dn` matrix `Y`.
    pub fn data_matrix_product(&self, y: MatRef<'_, f64>) -> Mat<f64> {
        self.apply_q(y.transpose()).transpose().to_owned()
    }

    /// `F(Y) = tr(Q YᵀY) = <Y, YQ>`.
    pub fn evaluate_objective(&self, y: MatRef<'_, f64>) -> f64 {
        let yq = self.data_matrix_product(y);
        frobenius_inner(y, yq.as_ref())
    }

    /// Euclidean gradient `∇F(Y) = 2 YQ`.
    pub fn euclidean_gradient(&self, y: MatRef<'_, f64>) -> Mat<f64> {
        &self.data_matrix_product(y) * Scale(2.0)
    }

    /// Riemannian gradient `Proj_Y(∇F(Y))`, given the Euclidean gradient at `y`.
    pub fn riemannian_gradient(&self, y: MatRef<'_, f64>, nabla_f: MatRef<'_, f64>) -> Mat<f64> {
        self.manifold.tangent_projection(y, nabla_f)
    }

    /// Riemannian Hessian-vector product
    /// `Hess F(Y)[Ẏ] = Proj_Y(2ẎQ - SymBlockDiagProduct(Ẏ, Y, ∇F(Y)))`.
    pub fn riemannian_hessian_vector_product(
        &self,
        y: MatRef<'_, f64>,
        nabla_f: MatRef<'_, f64>,
        ydot: MatRef<'_, f64>,
    ) -> Mat<f64> {
        let mut ambient = &self.data_matrix_product(ydot) * Scale(2.0);
        let correction = self.manifold.sym_block_diag_product(ydot, y, nabla_f);
        axpy(-1.0, correction.as_ref(), ambient.as_mut());
        self.manifold.tangent_projection(y, ambient.as_ref())
    }

    /// Preconditioner `P(Ẏ) = Proj_Y((M⁻¹ Ẏᵀ)ᵀ)`, with `M⁻¹` approximating `L(G^ρ)⁻¹`.
    pub fn precondition(&self, y: MatRef<'_, f64>, ydot: MatRef<'_, f64>) -> Mat<f64> {
        let solved = self.preconditioner.apply(ydot.transpose());
        self.manifold.tangent_projection(y, solved.as_ref().transpose())
    }

    pub fn retract(&self, y: MatRef<'_, f64>, ydot: MatRef<'_, f64>) -> Result<Mat<f64>> {
        self.manifold.retract(y, ydot)
    }

    /// Lagrange multiplier blocks `Λ_i = Sym(Y_iᵀ (YQ)_i)`, returned as a `d x dn`
    /// matrix `[Λ_1, ..., Λ_n]`.
    pub fn compute_lambda_blocks(&self, y: MatRef<'_, f64>) -> Mat<f64> {
        let d = self.d;
        let yq = self.data_matrix_product(y);
        let mut blocks = Mat::<f64>::zeros(d, d * self.n);
        for i in 0..self.n {
            let y_i = y.submatrix(0, d * i, y.nrows(), d);
            let yq_i = yq.as_ref().submatrix(0, d * i, y.nrows(), d);
            let p = y_i.transpose() * yq_i;
            for a in 0..d {
                for b in 0..d {
                    blocks[(a, d * i + b)] = 0.5 * (p[(a, b)] + p[(b, a)]);
                }
            }
        }
        blocks
    }

    /// Assembles `Λ` as a sparse block-diagonal `dn x dn` matrix.
    pub fn compute_lambda_matrix(&self, lambda_blocks: MatRef<'_, f64>) -> Result<SparseColMat<usize, f64>> {
        let d = self.d;
        let triplets: Vec<_> = (0..self.n)
            .flat_map(|i| {
                (0..d).flat_map(move |a| {
                    (0..d).map(move |b| {
                        Triplet::new(d * i + a, d * i + b, lambda_blocks[(a, d * i + b)])
                    })
                })
            })
            .collect();
        SparseColMat::try_new_from_triplets(d * self.n, d * self.n, &triplets).map_err(|e| {
            SeSyncError::factorization(format!("failed to assemble the multiplier matrix: {e:?}"))
        })
    }

    /// The certificate `S = Q - Λ(Y)` as a matrix-free operator.
    pub fn certificate_operator(&self, y: MatRef<'_, f64>) -> CertificateOperator<'_> {
        CertificateOperator {
            problem: self,
            lambda_blocks: self.compute_lambda_blocks(y),
        }
    }

    /// The sparse surrogate `S̃ + ηI` used to precondition the certifier:
    /// `S̃ = L(G^ρ) + Σ̃ - Λ` in the simplified formulation (so `S̃ ⪰ S`) and
    /// `S̃ = S = L(G^ρ) - Λ` in the rotation-only one.
    pub fn certificate_surrogate(
        &self,
        lambda_blocks: MatRef<'_, f64>,
        shift: f64,
    ) -> Result<SparseColMat<usize, f64>> {
        let dim = self.d * self.n;
        let mut triplets = sparse_triplets(&self.lg_rho);
        if self.formulation == Formulation::Simplified {
            triplets.extend(sparse_triplets(&self.sigma));
        }
        let lambda = self.compute_lambda_matrix(lambda_blocks)?;
        triplets.extend(
            sparse_triplets(&lambda)
                .into_iter()
                .map(|t| Triplet::new(t.row, t.col, -t.val)),
        );
        triplets.extend((0..dim).map(|i| Triplet::new(i, i, shift)));
        SparseColMat::try_new_from_triplets(dim, dim, &triplets).map_err(|e| {
            SeSyncError::factorization(format!("failed to assemble the certificate surrogate: {e:?}"))
        })
    }

    /// Chordal initialization: the minimizer of `tr(R L(G^ρ) Rᵀ)` with `R_1 = I`,
    /// projected blockwise onto SO(d). Returns a `d x dn` matrix of rotations.
    pub fn chordal_initialization(&self) -> Result<Mat<f64>> {
        let d = self.d;
        let rest = d * (self.n - 1);
        let mut reduced = Vec::new();
        let mut coupling = Mat::<f64>::zeros(rest, d);
        for t in sparse_triplets(&self.lg_rho) {
            match (t.row >= d, t.col >= d) {
                (true, true) => reduced.push(Triplet::new(t.row - d, t.col - d, t.val)),
                (true, false) => coupling[(t.row - d, t.col)] -= t.val,
                _ => {}
            }
        }
        let reduced = SparseColMat::try_new_from_triplets(rest, rest, &reduced).map_err(|e| {
            SeSyncError::factorization(format!("failed to assemble the reduced Laplacian: {e:?}"))
        })?;
        // Rows of `rest_t` stack R_2ᵀ, ..., R_nᵀ.
        let rest_t = sparse_cholesky(&reduced, "reduced rotational Laplacian")?.solve(coupling.as_ref());

        let mut rotations = Mat::<f64>::zeros(d, d * self.n);
        rotations
            .as_mut()
            .submatrix_mut(0, 0, d, d)
            .copy_from(Mat::<f64>::identity(d, d).as_ref());
        for k in 1..self.n {
            let block = rest_t.as_ref().submatrix(d * (k - 1), 0, d, d).transpose();
            let rotation = project_to_rotation_group(block)?;
            rotations
                .as_mut()
                .submatrix_mut(0, d * k, d, d)
                .copy_from(rotation.as_ref());
        }
        Ok(rotations)
    }

    /// A random point of `St(d, r)^n`, reproducible from `seed`.
    pub fn random_initialization(&self, seed: u64) -> Result<Mat<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.manifold.random_sample(&mut rng)
    }

    /// The first iterate at the current rank, as requested by `options.initialization`.
    pub fn initial_iterate(&self, options: &SeSyncOptions) -> Result<Mat<f64>> {
        match options.initialization {
            Initialization::Chordal => {
                let rotations = self.chordal_initialization()?;
                Ok(StiefelProduct::lift(rotations.as_ref(), self.relaxation_rank()))
            }
            Initialization::Random => self.random_initialization(options.seed),
        }
    }

    /// Rounds a relaxed `r x dn` solution to a `d x dn` matrix of rotations.
    ///
    /// The rows of `Y` are rotated onto its top-`d` left singular subspace; if fewer
    /// than `⌊n/2⌋` of the resulting blocks have positive determinant the whole
    /// estimate is reflected (so with odd `n` an exact minority of `⌊n/2⌋` blocks is
    /// kept as is); finally every block is projected onto SO(d).
    pub fn round_solution(&self, y: MatRef<'_, f64>) -> Result<Mat<f64>> {
        let d = self.d;
        let r = y.nrows();
        let gram = y * y.transpose();
        let eigen = gram.self_adjoint_eigen(Side::Lower)?;
        let u = eigen.U();
        // Eigenvalues come in nondecreasing order.
        let top = Mat::from_fn(r, d, |i, k| u[(i, r - 1 - k)]);
        let mut rounded = top.transpose() * y;

        let positive = (0..self.n)
            .filter(|&i| determinant(rounded.as_ref().submatrix(0, d * i, d, d)) > 0.0)
            .count();
        if reflection_needed(positive, self.n) {
            for j in 0..rounded.ncols() {
                rounded[(0, j)] = -rounded[(0, j)];
            }
        }

        let mut rotations = Mat::<f64>::zeros(d, d * self.n);
        for i in 0..self.n {
            let rotation = project_to_rotation_group(rounded.as_ref().submatrix(0, d * i, d, d))?;
            rotations
                .as_mut()
                .submatrix_mut(0, d * i, d, d)
                .copy_from(rotation.as_ref());
        }
        Ok(rotations)
    }

    /// Optimal translations `t` (`d x n`) for fixed rotations `R` (`d x dn`):
    /// `t̄ᵀ = -L(W^τ)⁻¹ Ṽ Rᵀ`, with the last translation pinned at the origin.
    pub fn recover_translations(&self, rotations: MatRef<'_, f64>) -> Mat<f64> {
        let rhs = sparse_matmul(&self.v, rotations.transpose(), self.par);
        let solved = self.translational.solve(rhs.as_ref(), self.par);
        let mut translations = Mat::<f64>::zeros(self.d, self.n);
        for k in 0..self.n - 1 {
            for a in 0..self.d {
                translations[(a, k)] = -solved[(k, a)];
            }
        }
        translations
    }
}

impl RiemannianObjective for SeSyncProblem {
    /// The Euclidean gradient `2YQ`, computed together with the objective.
    type Cache = Mat<f64>;

    fn evaluate(&self, y: MatRef<'_, f64>) -> (f64, Self::Cache) {
        let yq = self.data_matrix_product(y);
        let value = frobenius_inner(y, yq.as_ref());
        (value, &yq * Scale(2.0))
    }

    fn gradient(&self, y: MatRef<'_, f64>, nabla_f: &Self::Cache) -> Mat<f64> {
        self.riemannian_gradient(y, nabla_f.as_ref())
    }

    fn hessian_vector_product(
        &self,
        y: MatRef<'_, f64>,
        nabla_f: &Self::Cache,
        v: MatRef<'_, f64>,
    ) -> Mat<f64> {
        self.riemannian_hessian_vector_product(y, nabla_f.as_ref(), v)
    }

    fn precondition(&self, y: MatRef<'_, f64>, _: &Self::Cache, v: MatRef<'_, f64>) -> Mat<f64> {
        SeSyncProblem::precondition(self, y, v)
    }

    fn retract(&self, y: MatRef<'_, f64>, v: MatRef<'_, f64>) -> Result<Mat<f64>> {
        SeSyncProblem::retract(self, y, v)
    }
}

/// The certificate matrix `S = Q - Λ` of an iterate, applied matrix-free.
pub struct CertificateOperator<'a> {
    problem: &'a SeSyncProblem,
    lambda_blocks: Mat<f64>,
}

impl CertificateOperator<'_> {
    /// The multiplier blocks `[Λ_1, ..., Λ_n]` (`d x dn`).
    pub fn lambda_blocks(&self) -> MatRef<'_, f64> {
        self.lambda_blocks.as_ref()
    }

    /// `tr(Λ)`, which equals `F(Y)` at the iterate the operator was built from.
    pub fn lambda_trace(&self) -> f64 {
        let d = self.problem.d;
        (0..self.problem.n)
            .map(|i| (0..d).map(|a| self.lambda_blocks[(a, d * i + a)]).sum::<f64>())
            .sum()
    }
}

impl LinearOperator<f64> for CertificateOperator<'_> {
    fn nrows(&self) -> usize {
        self.problem.d * self.problem.n
    }

    fn ncols(&self) -> usize {
        self.problem.d * self.problem.n
    }

    fn apply(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        assert_eq!(
            LinearOperator::ncols(self),
            rhs.nrows(),
            "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
            LinearOperator::ncols(self),
            rhs.nrows(),
        );
        let d = self.problem.d;
        let mut out = self.problem.apply_q(rhs);
        for i in 0..self.problem.n {
            let lambda_i = self.lambda_blocks.as_ref().submatrix(0, d * i, d, d);
            let x_i = rhs.submatrix(d * i, 0, d, rhs.ncols());
            let product = lambda_i * x_i;
            axpy(
                -1.0,
                product.as_ref(),
                out.as_mut().submatrix_mut(d * i, 0, d, rhs.ncols()),
            );
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::matrix::trace;
    use faer::mat;
    use rand::Rng;

    fn rotation_2d(theta: f64) -> Mat<f64> {
        mat![[theta.cos(), -theta.sin()], [theta.sin(), theta.cos()]]
    }

    /// A noisy planar square with one diagonal: 4 poses, 5 measurements.
    pub(crate) fn planar_square() -> Vec<RelativePoseMeasurement> {
        let edges = [
            (0, 1, 1.57, [1.0, 0.02]),
            (1, 2, 1.59, [0.98, -0.01]),
            (2, 3, 1.55, [1.01, 0.0]),
            (3, 0, 1.58, [0.99, 0.03]),
            (0, 2, 3.13, [1.0, 1.01]),
        ];
        edges
            .iter()
            .map(|&(i, j, theta, t)| {
                RelativePoseMeasurement::new(
                    i,
                    j,
                    rotation_2d(theta),
                    mat![[t[0]], [t[1]]],
                    10.0,
                    5.0,
                )
            })
            .collect()
    }

    fn random_tangent(problem: &SeSyncProblem, y: MatRef<'_, f64>, seed: u64) -> Mat<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let v = Mat::from_fn(y.nrows(), y.ncols(), |_, _| rng.random_range(-1.0..1.0));
        problem.manifold().tangent_projection(y, v.as_ref())
    }

    fn dense_q(problem: &SeSyncProblem) -> Mat<f64> {
        let dim = problem.dimension() * problem.num_poses();
        problem.apply_q(Mat::<f64>::identity(dim, dim).as_ref())
    }

    #[test]
    fn test_q_is_symmetric_psd_and_factorizations_agree() {
        let measurements = planar_square();
        let cholesky = SeSyncProblem::new(&measurements, &SeSyncOptions::default()).unwrap();
        let qr = SeSyncProblem::new(
            &measurements,
            &SeSyncOptions::default().with_projection_factorization(ProjectionFactorization::Qr),
        )
        .unwrap();
        let q = dense_q(&cholesky);
        assert!((q.as_ref() - q.transpose()).norm_l2() < 1e-10);
        assert!((&q - dense_q(&qr)).norm_l2() < 1e-10);

        let eigen = q.self_adjoint_eigen(Side::Lower).unwrap();
        assert!(eigen.S().column_vector()[0] > -1e-10);
    }

    #[test]
    fn test_objective_gradient_and_hessian_are_consistent() {
        let measurements = planar_square();
        let mut problem = SeSyncProblem::new(&measurements, &SeSyncOptions::default()).unwrap();
        problem.set_relaxation_rank(3);
        let y = problem.random_initialization(1).unwrap();
        let (f, nabla) = problem.evaluate(y.as_ref());
        assert!((f - problem.evaluate_objective(y.as_ref())).abs() < 1e-10);
        let grad = problem.gradient(y.as_ref(), &nabla);

        // First-order check along a retraction curve.
        let v = random_tangent(&problem, y.as_ref(), 2);
        let h = 1e-6;
        let step = Mat::from_fn(v.nrows(), v.ncols(), |i, j| h * v[(i, j)]);
        let moved = problem.retract(y.as_ref(), step.as_ref()).unwrap();
        let directional = (problem.evaluate_objective(moved.as_ref()) - f) / h;
        let predicted = frobenius_inner(grad.as_ref(), v.as_ref());
        assert!((directional - predicted).abs() < 1e-3 * predicted.abs().max(1.0));

        // The Hessian is symmetric on the tangent space.
        let w = random_tangent(&problem, y.as_ref(), 3);
        let hv = problem.hessian_vector_product(y.as_ref(), &nabla, v.as_ref());
        let hw = problem.hessian_vector_product(y.as_ref(), &nabla, w.as_ref());
        let lhs = frobenius_inner(hv.as_ref(), w.as_ref());
        let rhs = frobenius_inner(v.as_ref(), hw.as_ref());
        assert!((lhs - rhs).abs() < 1e-8 * lhs.abs().max(1.0));

        // grad F = 2 Y S and Hess F[V] = 2 Proj(V S).
        let certificate = problem.certificate_operator(y.as_ref());
        let ys = certificate.apply(y.transpose()).transpose().to_owned();
        let two_ys = Mat::from_fn(ys.nrows(), ys.ncols(), |i, j| 2.0 * ys[(i, j)]);
        assert!((&two_ys - &grad).norm_l2() < 1e-8);
        let vs = certificate.apply(v.transpose()).transpose().to_owned();
        let expected = problem.manifold().tangent_projection(y.as_ref(), vs.as_ref());
        let expected = Mat::from_fn(vs.nrows(), vs.ncols(), |i, j| 2.0 * expected[(i, j)]);
        assert!((&expected - &hv).norm_l2() < 1e-8);
    }

    #[test]
    fn test_certificate_is_symmetric_and_trace_matches_objective() {
        let measurements = planar_square();
        let mut problem = SeSyncProblem::new(&measurements, &SeSyncOptions::default()).unwrap();
        problem.set_relaxation_rank(4);
        let y = problem.random_initialization(9).unwrap();
        let certificate = problem.certificate_operator(y.as_ref());
        let dim = 8;
        let s = certificate.apply(Mat::<f64>::identity(dim, dim).as_ref());
        assert!((s.as_ref() - s.transpose()).norm_l2() < 1e-10);
        assert!((certificate.lambda_trace() - problem.evaluate_objective(y.as_ref())).abs() < 1e-9);

        let lambda = problem
            .compute_lambda_matrix(certificate.lambda_blocks())
            .unwrap()
            .as_ref()
            .to_dense();
        assert!((trace(lambda.as_ref()) - certificate.lambda_trace()).abs() < 1e-12);

        // S̃ = S + Ṽᵀ L(W^τ)⁻¹ Ṽ dominates S.
        let surrogate = problem
            .certificate_surrogate(certificate.lambda_blocks(), 0.0)
            .unwrap()
            .as_ref()
            .to_dense();
        let gap = &surrogate - &s;
        let eigen = gap.self_adjoint_eigen(Side::Lower).unwrap();
        assert!(eigen.S().column_vector()[0] > -1e-9);
    }

    #[test]
    fn test_reflection_follows_floor_half_rule() {
        assert!(reflection_needed(0, 3));
        assert!(!reflection_needed(1, 3));
        assert!(reflection_needed(1, 4));
        assert!(!reflection_needed(2, 4));
        assert!(!reflection_needed(0, 1));
    }

    #[test]
    fn test_chordal_initialization_recovers_consistent_rotations() {
        // Noise-free measurements generated from known poses.
        let angles = [0.0, 0.4, 1.1, -0.7];
        let positions = [[0.0, 0.0], [1.0, 0.5], [1.5, 2.0], [-0.5, 1.0]];
        let edges = [(0, 1), (1, 2), (2, 3), (3, 0), (1, 3)];
        let measurements: Vec<_> = edges
            .iter()
            .map(|&(i, j)| {
                let ri = rotation_2d(angles[i]);
                let rj = rotation_2d(angles[j]);
                let delta = mat![
                    [positions[j][0] - positions[i][0]],
                    [positions[j][1] - positions[i][1]]
                ];
                RelativePoseMeasurement::new(
                    i,
                    j,
                    ri.transpose() * rj.as_ref(),
                    ri.transpose() * delta.as_ref(),
                    2.0,
                    3.0,
                )
            })
            .collect();
        let problem = SeSyncProblem::new(&measurements, &SeSyncOptions::default()).unwrap();

        let rotations = problem.chordal_initialization().unwrap();
        let r0_t = rotation_2d(angles[0]).transpose().to_owned();
        for k in 0..4 {
            let expected = &r0_t * rotation_2d(angles[k]);
            let block = rotations.as_ref().submatrix(0, 2 * k, 2, 2);
            assert!((block - expected.as_ref()).norm_l2() < 1e-10);
        }
        // The noise-free solution has zero cost.
        assert!(problem.evaluate_objective(rotations.as_ref()).abs() < 1e-10);

        // Translations are recovered in the frame of pose 0, anchored at the last pose.
        let translations = problem.recover_translations(rotations.as_ref());
        for k in 0..4 {
            for a in 0..2 {
                let world = [
                    positions[k][0] - positions[3][0],
                    positions[k][1] - positions[3][1],
                ];
                let expected = r0_t[(a, 0)] * world[0] + r0_t[(a, 1)] * world[1];
                assert!((translations[(a, k)] - expected).abs() < 1e-9);
            }
        }

        // Rounding a lifted, rotated copy gives back the same rotations up to a global
        // rotation, which leaves the cost unchanged.
        let lifted = StiefelProduct::lift(rotations.as_ref(), 3);
        let mut mixer = Mat::<f64>::identity(3, 3);
        let c = 0.3_f64.cos();
        let s = 0.3_f64.sin();
        mixer[(0, 0)] = c;
        mixer[(0, 2)] = -s;
        mixer[(2, 0)] = s;
        mixer[(2, 2)] = c;
        let mixed = &mixer * &lifted;
        let rounded = problem.round_solution(mixed.as_ref()).unwrap();
        assert!(problem.evaluate_objective(rounded.as_ref()).abs() < 1e-10);
    }

    #[test]
    fn test_initial_iterate_shapes() {
        let measurements = planar_square();
        let options = SeSyncOptions::default();
        let problem = SeSyncProblem::new(&measurements, &options).unwrap();
        assert_eq!(problem.relaxation_rank(), 5);
        let chordal = problem.initial_iterate(&options).unwrap();
        assert_eq!((chordal.nrows(), chordal.ncols()), (5, 8));
        assert!(problem.manifold().constraint_violation(chordal.as_ref()) < 1e-12);

        let random = problem
            .initial_iterate(&options.clone().with_initialization(Initialization::Random))
            .unwrap();
        assert_eq!((random.nrows(), random.ncols()), (5, 8));
        let again = problem.random_initialization(options.seed).unwrap();
        assert_eq!(random, again);
    }

    #[test]
    fn test_rotation_only_formulation_ignores_translations() {
        let measurements = planar_square();
        let options = SeSyncOptions::default().with_formulation(Formulation::SoSync);
        let problem = SeSyncProblem::new(&measurements, &options).unwrap();
        let q = dense_q(&problem);
        let l = problem.rotational_connection_laplacian().as_ref().to_dense();
        assert!((&q - &l).norm_l2() < 1e-14);
    }
}
