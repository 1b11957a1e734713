//! This module provides utilities for loading pose-graph problems from files.
//!
//! Measurements are read from the g2o text format. Two edge types are understood:
//!
//! - `EDGE_SE2 i j dx dy dθ I11 I12 I13 I22 I23 I33`, with the upper triangle of the
//!   3x3 information matrix in `(x, y, θ)` order;
//! - `EDGE_SE3:QUAT i j x y z qx qy qz qw` followed by the 21 upper-triangular entries
//!   of the 6x6 information matrix in `(x, y, z, rx, ry, rz)` order.
//!
//! The isotropic weights are obtained from the information blocks as
//! `τ = d / tr(I_t⁻¹)` and `κ = d / (2 tr(I_R⁻¹))` (`κ = I33` in the planar case).
//! Any other line (vertices, fixes, comments) is skipped.

use crate::measurement::RelativePoseMeasurement;
use faer::{Mat, mat};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};
use thiserror::Error;

/// Represents all possible errors that can occur while reading a g2o file.
#[derive(Error, Debug)]
pub enum DataLoaderError {
    /// Wraps a standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Occurs when a token cannot be parsed into a pose index.
    #[error("Parse error on line {line}: failed to parse an index from '{token}'")]
    ParseInt { line: usize, token: String },
    /// Occurs when a token cannot be parsed into a float.
    #[error("Parse error on line {line}: failed to parse a number from '{token}'")]
    ParseFloat { line: usize, token: String },
    /// Occurs when an edge line has fewer fields than its type requires.
    #[error("Format error on line {line}: {tag} needs {expected} fields, found {found}")]
    MissingFields {
        line: usize,
        tag: String,
        expected: usize,
        found: usize,
    },
    /// Occurs when planar and spatial edges appear in the same file.
    #[error("Format error on line {line}: mixed SE(2) and SE(3) edges")]
    MixedDimensions { line: usize },
    /// Occurs when an information block is not positive definite.
    #[error("Invalid information matrix on line {line}")]
    InvalidInformation { line: usize },
    /// Occurs when the file contains no edges at all.
    #[error("No relative-pose measurements found")]
    Empty,
}

/// A pose graph read from disk.
#[derive(Debug, Clone)]
pub struct PoseGraph {
    pub measurements: Vec<RelativePoseMeasurement>,
    /// One more than the largest pose index referenced.
    pub num_poses: usize,
    pub dimension: usize,
}

struct Fields<'a> {
    tokens: Vec<&'a str>,
    line: usize,
}

impl Fields<'_> {
    fn index(&self, k: usize) -> Result<usize, DataLoaderError> {
        self.tokens[k]
            .parse::<usize>()
            .map_err(|_| DataLoaderError::ParseInt {
                line: self.line,
                token: self.tokens[k].to_string(),
            })
    }

    fn float(&self, k: usize) -> Result<f64, DataLoaderError> {
        self.tokens[k]
            .parse::<f64>()
            .map_err(|_| DataLoaderError::ParseFloat {
                line: self.line,
                token: self.tokens[k].to_string(),
            })
    }

    fn floats(&self, from: usize, count: usize) -> Result<Vec<f64>, DataLoaderError> {
        (from..from + count).map(|k| self.float(k)).collect()
    }

    fn require(&self, expected: usize) -> Result<(), DataLoaderError> {
        if self.tokens.len() < expected {
            return Err(DataLoaderError::MissingFields {
                line: self.line,
                tag: self.tokens[0].to_string(),
                expected,
                found: self.tokens.len(),
            });
        }
        Ok(())
    }
}

/// `tr(A⁻¹)` for a symmetric 2x2 block, or `None` if it is not positive definite.
fn trace_of_inverse_2(a: f64, b: f64, c: f64) -> Option<f64> {
    let det = a * c - b * b;
    (a > 0.0 && det > 0.0).then(|| (a + c) / det)
}

/// `tr(A⁻¹)` for a symmetric 3x3 block given by its upper triangle
/// `[a11, a12, a13, a22, a23, a33]`, or `None` if it is not positive definite.
fn trace_of_inverse_3(u: [f64; 6]) -> Option<f64> {
    let [a11, a12, a13, a22, a23, a33] = u;
    let m11 = a22 * a33 - a23 * a23;
    let m22 = a11 * a33 - a13 * a13;
    let m33 = a11 * a22 - a12 * a12;
    let det = a11 * m11 - a12 * (a12 * a33 - a23 * a13) + a13 * (a12 * a23 - a22 * a13);
    (a11 > 0.0 && m33 > 0.0 && det > 0.0).then(|| (m11 + m22 + m33) / det)
}

fn rotation_from_quaternion(qx: f64, qy: f64, qz: f64, qw: f64) -> Mat<f64> {
    let norm = (qx * qx + qy * qy + qz * qz + qw * qw).sqrt();
    let (x, y, z, w) = (qx / norm, qy / norm, qz / norm, qw / norm);
    mat![
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - z * w),
            2.0 * (x * z + y * w)
        ],
        [
            2.0 * (x * y + z * w),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - x * w)
        ],
        [
            2.0 * (x * z - y * w),
            2.0 * (y * z + x * w),
            1.0 - 2.0 * (x * x + y * y)
        ]
    ]
}

fn parse_se2(fields: &Fields<'_>) -> Result<RelativePoseMeasurement, DataLoaderError> {
    fields.require(12)?;
    let (i, j) = (fields.index(1)?, fields.index(2)?);
    let v = fields.floats(3, 9)?;
    let (dx, dy, dtheta) = (v[0], v[1], v[2]);
    let (i11, i12, i22, i33) = (v[3], v[4], v[6], v[8]);

    let tau = trace_of_inverse_2(i11, i12, i22)
        .map(|t| 2.0 / t)
        .ok_or(DataLoaderError::InvalidInformation { line: fields.line })?;
    if !(i33 > 0.0) {
        return Err(DataLoaderError::InvalidInformation { line: fields.line });
    }
    let rotation = mat![
        [dtheta.cos(), -dtheta.sin()],
        [dtheta.sin(), dtheta.cos()]
    ];
    Ok(RelativePoseMeasurement::new(
        i,
        j,
        rotation,
        mat![[dx], [dy]],
        i33,
        tau,
    ))
}

fn parse_se3(fields: &Fields<'_>) -> Result<RelativePoseMeasurement, DataLoaderError> {
    fields.require(31)?;
    let (i, j) = (fields.index(1)?, fields.index(2)?);
    let v = fields.floats(3, 28)?;
    let translation = mat![[v[0]], [v[1]], [v[2]]];
    let rotation = rotation_from_quaternion(v[3], v[4], v[5], v[6]);

    // Upper triangle of the 6x6 information matrix, row by row.
    let info = &v[7..];
    let translational = [info[0], info[1], info[2], info[6], info[7], info[11]];
    let rotational = [info[15], info[16], info[17], info[18], info[19], info[20]];
    let invalid = DataLoaderError::InvalidInformation { line: fields.line };
    let tau = trace_of_inverse_3(translational).map(|t| 3.0 / t);
    let kappa = trace_of_inverse_3(rotational).map(|t| 3.0 / (2.0 * t));
    match (tau, kappa) {
        (Some(tau), Some(kappa)) => Ok(RelativePoseMeasurement::new(
            i,
            j,
            rotation,
            translation,
            kappa,
            tau,
        )),
        _ => Err(invalid),
    }
}

/// Parses g2o content from any buffered reader.
pub fn parse_g2o(reader: impl BufRead) -> Result<PoseGraph, DataLoaderError> {
    let mut measurements = Vec::new();
    let mut dimension = None;
    let mut num_poses = 0;

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let fields = Fields {
            tokens: line.split_whitespace().collect(),
            line: number + 1,
        };
        let Some(&tag) = fields.tokens.first() else {
            continue;
        };
        let (measurement, d) = match tag {
            "EDGE_SE2" => (parse_se2(&fields)?, 2),
            "EDGE_SE3:QUAT" => (parse_se3(&fields)?, 3),
            _ => continue,
        };
        if *dimension.get_or_insert(d) != d {
            return Err(DataLoaderError::MixedDimensions { line: fields.line });
        }
        num_poses = num_poses.max(measurement.i.max(measurement.j) + 1);
        measurements.push(measurement);
    }

    match dimension {
        Some(dimension) => Ok(PoseGraph {
            measurements,
            num_poses,
            dimension,
        }),
        None => Err(DataLoaderError::Empty),
    }
}

/// Reads a g2o file.
///
/// # Arguments
/// * `path`: The path to the `.g2o` file.
pub fn read_g2o(path: impl AsRef<Path>) -> Result<PoseGraph, DataLoaderError> {
    let file = File::open(path)?;
    parse_g2o(BufReader::new(file))
}
