//! This module provides the high-level entry points of the crate: the Riemannian
//! Staircase ([`se_sync`]) and the saddle-escape step that connects two of its levels
//! ([`escape_saddle`]).

use crate::{
    algorithms::trust_region::{
        RiemannianObjective, TrustRegionOptions, TrustRegionStatus, riemannian_trust_region,
    },
    certification::verify_solution,
    error::{Result, SeSyncError},
    manifold::StiefelProduct,
    matrix::scaled,
    measurement::RelativePoseMeasurement,
    options::SeSyncOptions,
    problem::SeSyncProblem,
    result::{LevelRecord, SeSyncResult, SeSyncStatus, Verification},
};
use faer::{Mat, MatRef};
use log::{Level, debug, log, warn};
use std::time::Instant;

/// Smallest step length tried along an escape direction.
const MIN_ESCAPE_STEP: f64 = 1e-6;

/// Runs the Riemannian Staircase on `problem`.
///
/// # Arguments
/// * `problem`: The problem instance. Its relaxation rank is changed as the staircase
///   climbs and is left at the rank of the returned iterate.
/// * `options`: Tolerances, rank range, time budget and solver settings. Validated
///   before any work is done.
/// * `y0`: An optional `r0 x dn` initial iterate. It is projected onto the manifold.
///   Without it, the iterate is built as requested by `options.initialization`.
///
/// # Returns
/// The [`SeSyncResult`]. Failures of the optimization itself (time budget, saddle
/// points, imprecise eigenvalues, maximum rank) are reported through its status, not
/// as errors.
pub fn se_sync(
    problem: &mut SeSyncProblem,
    options: &SeSyncOptions,
    y0: Option<MatRef<'_, f64>>,
) -> Result<SeSyncResult> {
    let start = Instant::now();
    let d = problem.dimension();
    let n = problem.num_poses();
    options.validate(d)?;
    if let Some(y0) = y0 {
        if y0.nrows() != options.r0 || y0.ncols() != d * n {
            return Err(SeSyncError::dimension_mismatch(
                "initial iterate",
                (options.r0, d * n),
                (y0.nrows(), y0.ncols()),
            ));
        }
        if (0..y0.ncols()).any(|j| (0..y0.nrows()).any(|i| !y0[(i, j)].is_finite())) {
            return Err(SeSyncError::invalid_options(
                "initial iterate contains non-finite entries",
            ));
        }
    }

    let level = if options.verbose {
        Level::Info
    } else {
        Level::Debug
    };
    log!(
        level,
        "SE-Sync: {n} poses, {} measurements, d = {d}, ranks {}..={}, {:?} formulation",
        problem.num_measurements(),
        options.r0,
        options.rmax,
        problem.formulation(),
    );

    problem.set_relaxation_rank(options.r0);
    let mut y = match y0 {
        Some(y0) => problem.manifold().project(y0)?,
        None => problem.initial_iterate(options)?,
    };
    let initialization_time = start.elapsed().as_secs_f64();
    log!(
        level,
        "Initialization ({}) finished in {initialization_time:.3} s",
        if y0.is_some() {
            "supplied".to_string()
        } else {
            format!("{:?}", options.initialization)
        },
    );

    let mut levels = Vec::new();
    let status = loop {
        let r = problem.relaxation_rank();
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed >= options.max_computation_time {
            break SeSyncStatus::ElapsedTime;
        }

        log!(level, "Optimizing at rank {r}");
        let rtr_options =
            TrustRegionOptions::from_sesync(options, options.max_computation_time - elapsed);
        let rtr = riemannian_trust_region(&*problem, y.as_ref(), &rtr_options)?;
        let mut record = LevelRecord::from_trust_region(r, &rtr);
        y = rtr.x;
        log!(
            level,
            "Rank {r}: RTR stopped after {} iterations ({}), f = {:.8e}, ||grad|| = {:.4e}",
            rtr.iterations,
            rtr.status,
            rtr.f,
            rtr.grad_norm,
        );
        if rtr.status == TrustRegionStatus::ElapsedTime {
            levels.push(record);
            break SeSyncStatus::ElapsedTime;
        }

        let certificate = verify_solution(problem, y.as_ref(), options)?;
        record.verification = Some(Verification {
            theta: certificate.theta,
            lobpcg_iterations: certificate.iterations,
            converged: certificate.converged,
            elapsed: certificate.elapsed,
        });
        log!(
            level,
            "Rank {r}: minimum eigenvalue of the certificate {:.6e} ({} LOBPCG iterations)",
            certificate.theta,
            certificate.iterations,
        );

        if !certificate.converged {
            levels.push(record);
            break SeSyncStatus::EigImprecision;
        }
        if certificate.theta >= -options.min_eig_num_tol {
            levels.push(record);
            break SeSyncStatus::GlobalOpt;
        }
        if r >= options.rmax {
            levels.push(record);
            break SeSyncStatus::MaxRank;
        }

        problem.set_relaxation_rank(r + 1);
        record.escape_curvature = Some(certificate.theta);
        let (escaped, y_plus) = escape_saddle(
            problem,
            y.as_ref(),
            certificate.theta,
            certificate.eigenvector.as_ref(),
            options.grad_norm_tol,
            options.preconditioned_grad_norm_tol,
        )?;
        levels.push(record);
        if !escaped {
            problem.set_relaxation_rank(r);
            break SeSyncStatus::SaddlePoint;
        }
        y = y_plus;
    };

    let result = post_process(problem, y, initialization_time, status, levels, start)?;
    log!(
        level,
        "SE-Sync finished ({}) at rank {} in {:.3} s: SDP value {:.8e}, rounded value {:.8e}, suboptimality bound {:.3e}",
        result.status,
        result.final_rank(),
        result.total_time,
        result.sdp_value,
        result.rounded_value,
        result.suboptimality_bound,
    );
    Ok(result)
}

fn post_process(
    problem: &SeSyncProblem,
    y: Mat<f64>,
    initialization_time: f64,
    status: SeSyncStatus,
    levels: Vec<LevelRecord>,
    start: Instant,
) -> Result<SeSyncResult> {
    let d = problem.dimension();
    let n = problem.num_poses();

    let (sdp_value, nabla_f) = problem.evaluate(y.as_ref());
    let gradient_norm = problem.riemannian_gradient(y.as_ref(), nabla_f.as_ref()).norm_l2();
    let lambda_blocks = problem.compute_lambda_blocks(y.as_ref());
    let trace_lambda: f64 = (0..d * n).map(|k| lambda_blocks[(k % d, k)]).sum();

    let rotations = problem.round_solution(y.as_ref())?;
    let translations = problem.recover_translations(rotations.as_ref());
    let mut xhat = Mat::<f64>::zeros(d, n + d * n);
    xhat.as_mut().subcols_mut(0, n).copy_from(translations.as_ref());
    xhat.as_mut().subcols_mut(n, d * n).copy_from(rotations.as_ref());
    let rounded_value = problem.evaluate_objective(rotations.as_ref());

    Ok(SeSyncResult {
        y_opt: y,
        sdp_value,
        gradient_norm,
        duality_gap: sdp_value - trace_lambda,
        lambda_blocks,
        trace_lambda,
        xhat,
        rounded_value,
        suboptimality_bound: rounded_value - trace_lambda,
        initialization_time,
        total_time: start.elapsed().as_secs_f64(),
        status,
        levels,
    })
}

/// Builds the problem from `measurements` and runs [`se_sync`] on it.
pub fn se_sync_from_measurements(
    measurements: &[RelativePoseMeasurement],
    options: &SeSyncOptions,
    y0: Option<MatRef<'_, f64>>,
) -> Result<SeSyncResult> {
    let mut problem = SeSyncProblem::new(measurements, options)?;
    se_sync(&mut problem, options, y0)
}

/// Moves from a saddle point `y` of rank `r` to a point of rank `r + 1` with strictly
/// smaller objective, along the negative-curvature direction `v` of the certificate.
///
/// The problem must already be at rank `r + 1`. Starting from `Y₊ = [Y; 0]` and the
/// tangent direction `Ẏ = [0; vᵀ]`, step lengths `α` are halved from
/// `max(16 α_min, 100 · grad_norm_tol / |θ|)` down to `α_min` until the retracted point
/// decreases the objective and has gradient norms above both tolerances (so the next
/// trust-region run does not stop immediately).
///
/// Returns whether a step was found, with the new iterate (or `[Y; 0]` on failure).
pub fn escape_saddle(
    problem: &SeSyncProblem,
    y: MatRef<'_, f64>,
    theta: f64,
    v: MatRef<'_, f64>,
    grad_norm_tol: f64,
    preconditioned_grad_norm_tol: f64,
) -> Result<(bool, Mat<f64>)> {
    let r = y.nrows();
    let dim = problem.dimension() * problem.num_poses();
    if problem.relaxation_rank() != r + 1 {
        return Err(SeSyncError::invalid_options(format!(
            "saddle escape from rank {r} requires the problem at rank {}, but it is at rank {}",
            r + 1,
            problem.relaxation_rank()
        )));
    }
    if y.ncols() != dim {
        return Err(SeSyncError::dimension_mismatch(
            "saddle point",
            (r, dim),
            (y.nrows(), y.ncols()),
        ));
    }
    if v.nrows() != dim || v.ncols() != 1 {
        return Err(SeSyncError::dimension_mismatch(
            "escape direction",
            (dim, 1),
            (v.nrows(), v.ncols()),
        ));
    }

    let f = problem.evaluate_objective(y);
    let lifted = StiefelProduct::lift(y, r + 1);
    let mut direction = Mat::<f64>::zeros(r + 1, dim);
    direction
        .as_mut()
        .subrows_mut(r, 1)
        .copy_from(v.transpose());

    let mut alpha = (16.0 * MIN_ESCAPE_STEP).max(100.0 * grad_norm_tol / theta.abs());
    while alpha >= MIN_ESCAPE_STEP {
        let candidate = problem.retract(lifted.as_ref(), scaled(alpha, direction.as_ref()).as_ref())?;
        let (f_candidate, nabla_f) = problem.evaluate(candidate.as_ref());
        let gradient = problem.riemannian_gradient(candidate.as_ref(), nabla_f.as_ref());
        let gradient_norm = gradient.norm_l2();
        let preconditioned_norm = problem
            .precondition(candidate.as_ref(), gradient.as_ref())
            .norm_l2();
        debug!(
            "Saddle escape: alpha = {alpha:.3e}, f = {f_candidate:.8e} (from {f:.8e}), ||grad|| = {gradient_norm:.3e}"
        );
        if f_candidate < f
            && gradient_norm > grad_norm_tol
            && preconditioned_norm > preconditioned_grad_norm_tol
        {
            return Ok((true, candidate));
        }
        alpha /= 2.0;
    }

    warn!(
        "Saddle escape from rank {r} failed: no admissible step along a direction of curvature {theta:.3e}"
    );
    Ok((false, lifted))
}
