//! Relative-pose measurements, the raw input of a synchronization problem.

use crate::error::{Result, SeSyncError};
use faer::Mat;

/// A noisy measurement of the pose of node `j` relative to node `i`.
///
/// `rotation` is the `d x d` measured rotation `R̃_ij` and `translation` the `d x 1`
/// measured translation `t̃_ij`. The concentration parameters `kappa` (rotation) and
/// `tau` (translation) weight the measurement in the objective.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePoseMeasurement {
    pub i: usize,
    pub j: usize,
    pub rotation: Mat<f64>,
    pub translation: Mat<f64>,
    pub kappa: f64,
    pub tau: f64,
}

impl RelativePoseMeasurement {
    pub fn new(
        i: usize,
        j: usize,
        rotation: Mat<f64>,
        translation: Mat<f64>,
        kappa: f64,
        tau: f64,
    ) -> Self {
        Self {
            i,
            j,
            rotation,
            translation,
            kappa,
            tau,
        }
    }

    /// Dimension `d` of the poses this measurement relates.
    pub fn dimension(&self) -> usize {
        self.rotation.nrows()
    }
}

/// Checks that `measurements` describe a well-posed problem and returns `(d, n)`:
/// the pose dimension and the number of poses (one more than the largest index).
///
/// Connectivity is checked as well; a disconnected graph leaves the translational
/// Laplacian singular.
pub fn validate(measurements: &[RelativePoseMeasurement]) -> Result<(usize, usize)> {
    let first = measurements
        .first()
        .ok_or_else(|| SeSyncError::invalid_measurements("no measurements were provided"))?;
    let d = first.dimension();
    if d < 2 {
        return Err(SeSyncError::invalid_measurements(format!(
            "pose dimension must be at least 2, got {d}"
        )));
    }

    let mut n = 0;
    for (k, m) in measurements.iter().enumerate() {
        if m.rotation.nrows() != d || m.rotation.ncols() != d {
            return Err(SeSyncError::invalid_measurements(format!(
                "measurement {k} has a {}x{} rotation, expected {d}x{d}",
                m.rotation.nrows(),
                m.rotation.ncols()
            )));
        }
        if m.translation.nrows() != d || m.translation.ncols() != 1 {
            return Err(SeSyncError::invalid_measurements(format!(
                "measurement {k} has a {}x{} translation, expected {d}x1",
                m.translation.nrows(),
                m.translation.ncols()
            )));
        }
        if m.i == m.j {
            return Err(SeSyncError::invalid_measurements(format!(
                "measurement {k} is a self-loop on node {}",
                m.i
            )));
        }
        if !(m.kappa.is_finite() && m.kappa > 0.0 && m.tau.is_finite() && m.tau > 0.0) {
            return Err(SeSyncError::invalid_measurements(format!(
                "measurement {k} has non-positive or non-finite weights (kappa = {}, tau = {})",
                m.kappa, m.tau
            )));
        }
        let finite = (0..d).all(|a| {
            m.translation[(a, 0)].is_finite() && (0..d).all(|b| m.rotation[(a, b)].is_finite())
        });
        if !finite {
            return Err(SeSyncError::invalid_measurements(format!(
                "measurement {k} contains non-finite entries"
            )));
        }
        n = n.max(m.i + 1).max(m.j + 1);
    }

    if !is_connected(measurements, n) {
        return Err(SeSyncError::invalid_measurements(
            "measurement graph is not connected",
        ));
    }
    Ok((d, n))
}

fn is_connected(measurements: &[RelativePoseMeasurement], n: usize) -> bool {
    let mut adjacency = vec![Vec::new(); n];
    for m in measurements {
        adjacency[m.i].push(m.j);
        adjacency[m.j].push(m.i);
    }
    let mut seen = vec![false; n];
    let mut stack = vec![0];
    seen[0] = true;
    let mut visited = 1;
    while let Some(node) = stack.pop() {
        for &next in &adjacency[node] {
            if !seen[next] {
                seen[next] = true;
                visited += 1;
                stack.push(next);
            }
        }
    }
    visited == n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SeSyncErrorKind;

    fn planar(i: usize, j: usize) -> RelativePoseMeasurement {
        RelativePoseMeasurement::new(
            i,
            j,
            Mat::identity(2, 2),
            Mat::from_fn(2, 1, |a, _| a as f64),
            1.0,
            1.0,
        )
    }

    #[test]
    fn test_validate_chain() {
        let measurements = vec![planar(0, 1), planar(1, 2)];
        assert_eq!(validate(&measurements).unwrap(), (2, 3));
    }

    #[test]
    fn test_validate_rejects_disconnected_graph() {
        let measurements = vec![planar(0, 1), planar(2, 3)];
        let error = validate(&measurements).unwrap_err();
        assert_eq!(
            error.kind(),
            &SeSyncErrorKind::InvalidMeasurements("measurement graph is not connected".into())
        );
    }

    #[test]
    fn test_validate_rejects_bad_weights_and_loops() {
        let mut bad = planar(0, 1);
        bad.tau = 0.0;
        assert!(validate(&[bad]).is_err());
        assert!(validate(&[planar(1, 1)]).is_err());
        assert!(validate(&[]).is_err());
    }
}
