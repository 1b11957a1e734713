//! Helpers around the core solver.
//!
//! - **`construction`**: assembles the sparse data matrices of a synchronization
//!   problem (connection Laplacian, translational Laplacian and data matrices) from a
//!   list of relative-pose measurements.
//!
//! - **`data_loader`**: reads measurements from g2o files, as used by the `se_sync`
//!   binary and the dataset tests.

pub mod construction;
pub mod data_loader;
