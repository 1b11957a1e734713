//! Command-line driver for SE-Sync.
//!
//! Reads a pose graph from a g2o file, runs the Riemannian Staircase and reports the
//! outcome. The estimated poses and a per-level summary can be written as CSV.
use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use sesync::{
    Formulation, Initialization, PreconditionerKind, ProjectionFactorization, SeSyncOptions,
    SeSyncResult, se_sync_from_measurements, utils::data_loader::read_g2o,
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FormulationArg {
    Simplified,
    SoSync,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum InitializationArg {
    Chordal,
    Random,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FactorizationArg {
    Cholesky,
    Qr,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PreconditionerArg {
    Jacobi,
    RegularizedCholesky,
    IncompleteCholesky,
}

/// Command-line arguments of the SE-Sync driver.
#[derive(Parser, Debug)]
#[clap(
    name = "se_sync",
    about = "Certifiably correct pose-graph optimization with the Riemannian Staircase."
)]
struct Args {
    /// Path to the input g2o file.
    #[clap(long, value_name = "PATH")]
    input: PathBuf,

    /// Optional CSV file receiving one row per pose (index, translation, rotation).
    #[clap(long, value_name = "PATH")]
    poses: Option<PathBuf>,

    /// Optional CSV file receiving one row per staircase level.
    #[clap(long, value_name = "PATH")]
    levels: Option<PathBuf>,

    #[clap(long, value_enum, default_value_t = FormulationArg::Simplified)]
    formulation: FormulationArg,

    #[clap(long, value_enum, default_value_t = InitializationArg::Chordal)]
    initialization: InitializationArg,

    /// Factorization used for the reduced translational Laplacian.
    #[clap(long, value_enum, default_value_t = FactorizationArg::Cholesky)]
    factorization: FactorizationArg,

    #[clap(long, value_enum, default_value_t = PreconditionerArg::RegularizedCholesky)]
    preconditioner: PreconditionerArg,

    /// Maximum condition number of the regularized Cholesky preconditioner.
    #[clap(long, default_value_t = 1e6)]
    max_condition_number: f64,

    #[clap(long, default_value_t = 5)]
    r0: usize,

    #[clap(long, default_value_t = 10)]
    rmax: usize,

    #[clap(long, default_value_t = 1e-2)]
    grad_norm_tol: f64,

    #[clap(long, default_value_t = 1e-4)]
    preconditioned_grad_norm_tol: f64,

    #[clap(long, default_value_t = 1e-3)]
    min_eig_num_tol: f64,

    #[clap(long, default_value_t = 1000)]
    max_iterations: usize,

    /// Time budget in seconds.
    #[clap(long, default_value_t = 1800.0)]
    max_time: f64,

    #[clap(long, default_value_t = 1)]
    threads: usize,

    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Log staircase progress at info level and trust-region iterations at debug level.
    #[clap(long)]
    verbose: bool,
}

impl Args {
    fn options(&self) -> SeSyncOptions {
        let preconditioner = match self.preconditioner {
            PreconditionerArg::Jacobi => PreconditionerKind::Jacobi,
            PreconditionerArg::RegularizedCholesky => PreconditionerKind::RegularizedCholesky {
                max_condition_number: self.max_condition_number,
            },
            PreconditionerArg::IncompleteCholesky => PreconditionerKind::IncompleteCholesky {
                max_fill_factor: 3.0,
                drop_tol: 1e-3,
            },
        };
        SeSyncOptions::default()
            .with_formulation(match self.formulation {
                FormulationArg::Simplified => Formulation::Simplified,
                FormulationArg::SoSync => Formulation::SoSync,
            })
            .with_initialization(match self.initialization {
                InitializationArg::Chordal => Initialization::Chordal,
                InitializationArg::Random => Initialization::Random,
            })
            .with_projection_factorization(match self.factorization {
                FactorizationArg::Cholesky => ProjectionFactorization::Cholesky,
                FactorizationArg::Qr => ProjectionFactorization::Qr,
            })
            .with_preconditioner(preconditioner)
            .with_ranks(self.r0, self.rmax)
            .with_tolerances(self.grad_norm_tol, self.preconditioned_grad_norm_tol)
            .with_min_eig_num_tol(self.min_eig_num_tol)
            .with_max_iterations(self.max_iterations)
            .with_max_computation_time(self.max_time)
            .with_num_threads(self.threads)
            .with_seed(self.seed)
            .with_verbose(self.verbose)
    }
}

/// One row of the per-level summary.
#[derive(Debug, Serialize)]
struct LevelRow {
    rank: usize,
    rtr_status: String,
    rtr_iterations: usize,
    hessian_vector_products: usize,
    objective: f64,
    gradient_norm: f64,
    optimization_time_s: f64,
    theta: Option<f64>,
    lobpcg_iterations: Option<usize>,
    verification_time_s: Option<f64>,
    escape_curvature: Option<f64>,
}

fn write_levels(path: &PathBuf, result: &SeSyncResult) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create level summary {path:?}"))?;
    for level in &result.levels {
        writer.serialize(LevelRow {
            rank: level.rank,
            rtr_status: format!("{:?}", level.rtr_status),
            rtr_iterations: level.rtr_iterations,
            hessian_vector_products: level.total_hessian_vector_products(),
            objective: level.final_objective(),
            gradient_norm: level.final_gradient_norm(),
            optimization_time_s: level.optimization_time,
            theta: level.verification.map(|v| v.theta),
            lobpcg_iterations: level.verification.map(|v| v.lobpcg_iterations),
            verification_time_s: level.verification.map(|v| v.elapsed),
            escape_curvature: level.escape_curvature,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `index, t_1..t_d, R_11..R_dd` (rotation in row-major order) per pose.
fn write_poses(path: &PathBuf, result: &SeSyncResult) -> Result<()> {
    let translations = result.translations();
    let rotations = result.rotations();
    let d = translations.nrows();
    let n = translations.ncols();

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create pose file {path:?}"))?;
    let mut header = vec!["pose".to_string()];
    header.extend((0..d).map(|a| format!("t{a}")));
    header.extend((0..d).flat_map(|a| (0..d).map(move |b| format!("r{a}{b}"))));
    writer.write_record(&header)?;
    for i in 0..n {
        let mut row = vec![i.to_string()];
        row.extend((0..d).map(|a| translations[(a, i)].to_string()));
        row.extend(
            (0..d).flat_map(|a| (0..d).map(move |b| rotations[(a, d * i + b)].to_string())),
        );
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .parse_default_env()
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;

    let graph = read_g2o(&args.input)
        .with_context(|| format!("Failed to read pose graph {:?}", args.input))?;
    log::info!(
        "Loaded {} measurements on {} poses (d = {}) from {:?}",
        graph.measurements.len(),
        graph.num_poses,
        graph.dimension,
        args.input
    );

    let options = args.options();
    let result = se_sync_from_measurements(&graph.measurements, &options, None)?;

    println!("status: {:?}", result.status);
    println!("final rank: {}", result.final_rank());
    println!("SDP value: {:.10e}", result.sdp_value);
    println!("rounded value: {:.10e}", result.rounded_value);
    println!("suboptimality bound: {:.4e}", result.suboptimality_bound);
    println!("total time: {:.3} s", result.total_time);

    if let Some(path) = &args.levels {
        write_levels(path, &result)?;
        log::info!("Wrote level summary to {path:?}");
    }
    if let Some(path) = &args.poses {
        write_poses(path, &result)?;
        log::info!("Wrote poses to {path:?}");
    }
    Ok(())
}
