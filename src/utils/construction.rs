//! Assembly of the sparse data matrices of the synchronization problem from a list of
//! relative-pose measurements.
//!
//! For `m` measurements on `n` poses of dimension `d`, edge `e = (i, j)` contributes:
//!
//! - to the rotational connection Laplacian `L(G^ρ)` (`dn x dn`): `κ_e I_d` on the
//!   diagonal blocks `(i, i)` and `(j, j)`, `-κ_e R̃_e` on block `(i, j)` and `-κ_e R̃_eᵀ`
//!   on block `(j, i)`;
//! - to the reduced translational Laplacian `L(W^τ) = Ā Ω Āᵀ` (`(n-1) x (n-1)`): the
//!   usual weighted graph Laplacian stencil, with the row and column of the last pose
//!   removed. `Ā` is the incidence matrix (`-1` at the tail, `+1` at the head) without
//!   its last row;
//! - to `Σ̃ = T̃ᵀ Ω T̃` (`dn x dn`, block diagonal): `τ_e t̃_e t̃_eᵀ` on block `(i, i)`;
//! - to `Ṽ = Ā Ω T̃` (`(n-1) x dn`): `τ_e t̃_eᵀ` on row `i` and `-τ_e t̃_eᵀ` on row `j`,
//!   both in the column block of `i`.
//!
//! Here `T̃` is the `m x dn` translational data matrix whose row `e` holds `-t̃_eᵀ` in the
//! column block of the tail `i`. Duplicate triplets are summed by `faer` on assembly.

use crate::{
    error::{Result, SeSyncError},
    measurement::RelativePoseMeasurement,
};
use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};

type Triplets = Vec<Triplet<usize, usize, f64>>;

fn assemble(nrows: usize, ncols: usize, triplets: &Triplets) -> Result<SparseColMat<usize, f64>> {
    SparseColMat::try_new_from_triplets(nrows, ncols, triplets).map_err(|e| {
        SeSyncError::invalid_measurements(format!(
            "failed to assemble a {nrows}x{ncols} sparse matrix: {e:?}"
        ))
    })
}

/// Builds the rotational connection Laplacian `L(G^ρ)`.
pub fn rotational_connection_laplacian(
    measurements: &[RelativePoseMeasurement],
    d: usize,
    n: usize,
) -> Result<SparseColMat<usize, f64>> {
    let mut triplets = Triplets::with_capacity(measurements.len() * 2 * d * (d + 1));
    for m in measurements {
        let (i, j) = (m.i, m.j);
        for a in 0..d {
            triplets.push(Triplet::new(d * i + a, d * i + a, m.kappa));
            triplets.push(Triplet::new(d * j + a, d * j + a, m.kappa));
        }
        for a in 0..d {
            for b in 0..d {
                let value = -m.kappa * m.rotation[(a, b)];
                triplets.push(Triplet::new(d * i + a, d * j + b, value));
                triplets.push(Triplet::new(d * j + b, d * i + a, value));
            }
        }
    }
    assemble(d * n, d * n, &triplets)
}

/// Builds the reduced translational Laplacian `L(W^τ)`, omitting the last pose.
pub fn reduced_translational_laplacian(
    measurements: &[RelativePoseMeasurement],
    n: usize,
) -> Result<SparseColMat<usize, f64>> {
    let last = n - 1;
    let mut triplets = Triplets::with_capacity(measurements.len() * 4);
    for m in measurements {
        let (i, j) = (m.i, m.j);
        if i != last {
            triplets.push(Triplet::new(i, i, m.tau));
        }
        if j != last {
            triplets.push(Triplet::new(j, j, m.tau));
        }
        if i != last && j != last {
            triplets.push(Triplet::new(i, j, -m.tau));
            triplets.push(Triplet::new(j, i, -m.tau));
        }
    }
    assemble(last, last, &triplets)
}

/// Builds the block-diagonal translational covariance `Σ̃ = T̃ᵀ Ω T̃`.
pub fn translational_covariance(
    measurements: &[RelativePoseMeasurement],
    d: usize,
    n: usize,
) -> Result<SparseColMat<usize, f64>> {
    let mut triplets = Triplets::with_capacity(measurements.len() * d * d);
    for m in measurements {
        let i = m.i;
        for a in 0..d {
            for b in 0..d {
                let value = m.tau * m.translation[(a, 0)] * m.translation[(b, 0)];
                triplets.push(Triplet::new(d * i + a, d * i + b, value));
            }
        }
    }
    assemble(d * n, d * n, &triplets)
}

/// Builds `Ṽ = Ā Ω T̃` together with its transpose, both stored column-major.
pub fn translational_data_matrix(
    measurements: &[RelativePoseMeasurement],
    d: usize,
    n: usize,
) -> Result<(SparseColMat<usize, f64>, SparseColMat<usize, f64>)> {
    let last = n - 1;
    let mut triplets = Triplets::with_capacity(measurements.len() * 2 * d);
    for m in measurements {
        let (i, j) = (m.i, m.j);
        for a in 0..d {
            let value = m.tau * m.translation[(a, 0)];
            if i != last {
                triplets.push(Triplet::new(i, d * i + a, value));
            }
            if j != last {
                triplets.push(Triplet::new(j, d * i + a, -value));
            }
        }
    }
    let transposed: Triplets = triplets
        .iter()
        .map(|t| Triplet::new(t.col, t.row, t.val))
        .collect();
    Ok((
        assemble(last, d * n, &triplets)?,
        assemble(d * n, last, &transposed)?,
    ))
}

/// Dense `Ω^{1/2} Āᵀ` (`m x (n-1)`), whose QR factor `R` satisfies `RᵀR = L(W^τ)`.
pub fn weighted_reduced_incidence_transpose(
    measurements: &[RelativePoseMeasurement],
    n: usize,
) -> Mat<f64> {
    let last = n - 1;
    let mut out = Mat::<f64>::zeros(measurements.len(), last);
    for (e, m) in measurements.iter().enumerate() {
        let weight = m.tau.sqrt();
        if m.i != last {
            out[(e, m.i)] = -weight;
        }
        if m.j != last {
            out[(e, m.j)] = weight;
        }
    }
    out
}
