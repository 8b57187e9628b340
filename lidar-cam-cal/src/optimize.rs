//! Nelder-Mead shell over the six transform parameters.
//!
//! The total loss is a weighted sum of the edge-alignment, mutual
//! information, correspondence and chamfer terms over all frames. Every
//! proposed transform first rebuilds the projection tables; a degenerate
//! projection aborts the solver run, the shell perturbs the transform
//! around the pre-optimize value and restarts, up to a budget. An outer
//! schedule repeats the minimization for each kernel width, coarse to
//! fine, warm-starting from the previous best.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;

use argmin::core::{CostFunction, Error as ArgminError, Executor};
use argmin::solver::neldermead::NelderMead;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::chamfer::{chamfer_cost, distance_transform};
use crate::corresp::{correspondence_cost, Correspondences};
use crate::edge_align::{edge_alignment_cost, EdgeAlignParams};
use crate::frame::Frame;
use crate::image_edge::ImageEdges;
use crate::mutual_info::mutual_info_cost;
use crate::pc_edge::PcEdges;
use crate::project::{project_all, project_frame, FrustumFloor, Intrinsics};
use crate::transform::Tau;
use crate::{viz, CalibError, Result};

/// Blend factors for the cost terms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Weights {
    pub mi: f64,
    pub gmm: f64,
    pub corr: f64,
    pub chamfer: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            mi: 1.0,
            gmm: 1.0,
            corr: 0.0,
            chamfer: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizeParams {
    pub weights: Weights,
    /// Kernel width schedule, coarse to fine.
    pub sigmas: Vec<f64>,
    pub scale_sigma_by_depth: bool,
    /// Nelder-Mead iteration cap per stage.
    pub max_iters: u64,
    /// Perturb-and-restart attempts after degenerate projections.
    pub restart_budget: usize,
    /// Dump a reprojection image every this many evaluations; 0 disables.
    pub save_every: usize,
    pub out_dir: Option<PathBuf>,
    /// Refine translation alone (rotation frozen) after each full pass.
    pub translation_only_pass: bool,
    pub floor: FrustumFloor,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            sigmas: vec![3.0, 2.0, 1.0],
            scale_sigma_by_depth: true,
            max_iters: 600,
            restart_budget: 5,
            save_every: 0,
            out_dir: None,
            translation_only_pass: false,
            floor: FrustumFloor::default(),
        }
    }
}

/// Everything the loss needs besides the transform. Frames, edge tables
/// and correspondences are borrowed immutably; the projection tables are
/// rebuilt per evaluation and owned by it.
pub struct CalibrationInput<'a> {
    pub frames: &'a [Frame],
    pub pc_edges: &'a [PcEdges],
    pub img_edges: &'a [ImageEdges],
    /// One entry per frame; may all be empty (then `weights.corr` must
    /// be zero).
    pub corrs: &'a [Correspondences],
    pub k: Intrinsics,
}

impl CalibrationInput<'_> {
    fn validate(&self, weights: &Weights) -> Result<()> {
        let n = self.frames.len();
        if n == 0 {
            return Err(CalibError::InvalidConfig("no frames selected".into()));
        }
        if self.pc_edges.len() != n || self.img_edges.len() != n || self.corrs.len() != n {
            return Err(CalibError::InvalidConfig(format!(
                "{} frames but {} pc edge, {} image edge, {} correspondence sets",
                n,
                self.pc_edges.len(),
                self.img_edges.len(),
                self.corrs.len()
            )));
        }
        for w in [weights.mi, weights.gmm, weights.corr, weights.chamfer] {
            if !w.is_finite() || w < 0.0 {
                return Err(CalibError::InvalidConfig(format!("bad cost weight {w}")));
            }
        }
        if weights.corr > 0.0 && self.corrs.iter().all(|c| c.is_empty()) {
            return Err(CalibError::InvalidConfig(
                "correspondence weight set but no correspondences picked".into(),
            ));
        }
        Ok(())
    }
}

/// The loss at a fixed kernel width. Evaluation rebuilds the projection
/// tables first and hands them to every cost term.
pub struct Objective<'a> {
    input: &'a CalibrationInput<'a>,
    /// Distance transforms of the image edge masks, one per frame
    /// (empty when the chamfer weight is zero).
    dts: &'a [Vec<f64>],
    weights: Weights,
    align: EdgeAlignParams,
    floor: FrustumFloor,
}

impl<'a> Objective<'a> {
    pub fn new(
        input: &'a CalibrationInput<'a>,
        dts: &'a [Vec<f64>],
        weights: Weights,
        sigma: f64,
        scale_sigma_by_depth: bool,
        floor: FrustumFloor,
    ) -> Self {
        Self {
            input,
            dts,
            weights,
            align: EdgeAlignParams {
                sigma,
                scale_by_depth: scale_sigma_by_depth,
            },
            floor,
        }
    }

    /// Total loss, or `BadProjection` when the transform is degenerate.
    pub fn eval(&self, tau: &Tau) -> Result<f64> {
        let tables = project_all(tau, &self.input.k, self.input.frames, &self.floor)?;

        let mut loss = 0.0;
        for (i, frame) in self.input.frames.iter().enumerate() {
            if self.weights.gmm != 0.0 {
                loss += self.weights.gmm
                    * edge_alignment_cost(
                        &tables[i],
                        &self.input.pc_edges[i],
                        &self.input.img_edges[i],
                        &self.align,
                    );
            }
            if self.weights.mi != 0.0 {
                loss += self.weights.mi * mutual_info_cost(frame, &tables[i]);
            }
            if self.weights.corr != 0.0 && !self.input.corrs[i].is_empty() {
                loss += self.weights.corr
                    * correspondence_cost(
                        &self.input.corrs[i],
                        tau,
                        &self.input.k,
                        frame.width(),
                        frame.height(),
                    );
            }
        }

        if self.weights.chamfer != 0.0 && self.dts.len() == self.input.frames.len() {
            let per_frame: Vec<_> = (0..self.input.frames.len())
                .map(|i| {
                    (
                        &tables[i],
                        &self.input.pc_edges[i],
                        &self.input.img_edges[i],
                        self.dts[i].as_slice(),
                    )
                })
                .collect();
            loss += self.weights.chamfer * chamfer_cost(&per_frame);
        }

        Ok(loss)
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub tau: Tau,
    pub loss: f64,
    /// Loss at every cost evaluation, across all stages and restarts.
    pub loss_history: Vec<f64>,
    pub evaluations: usize,
    pub restarts: usize,
}

/// Rescaling applied so rotation and translation span comparable
/// numerical ranges inside the solver.
const TAU_SCALE: [f64; 6] = [1.0, 1.0, 1.0, 1e-2, 1e-2, 1e-2];
const SIMPLEX_ROT_STEP: f64 = 0.05;
const SIMPLEX_TRANS_STEP: f64 = 0.5;
/// Perturbation bounds for restarts after a degenerate projection.
const PERTURB_ROT: f64 = 0.005;
const PERTURB_TRANS: f64 = 0.5;

#[derive(Clone, Copy)]
enum Mode {
    Full,
    /// Rotation frozen at the given axis-angle vector.
    TranslationOnly(Vector3<f64>),
}

impl Mode {
    fn to_scaled(&self, tau: &Tau) -> Vec<f64> {
        match self {
            Mode::Full => (0..6).map(|i| tau[i] * TAU_SCALE[i]).collect(),
            Mode::TranslationOnly(_) => (3..6).map(|i| tau[i] * TAU_SCALE[i]).collect(),
        }
    }

    fn from_scaled(&self, p: &[f64]) -> Tau {
        match self {
            Mode::Full => Tau::from_fn(|i, _| p[i] / TAU_SCALE[i]),
            Mode::TranslationOnly(rot) => Tau::new(
                rot.x,
                rot.y,
                rot.z,
                p[0] / TAU_SCALE[3],
                p[1] / TAU_SCALE[4],
                p[2] / TAU_SCALE[5],
            ),
        }
    }

    /// Simplex vertices: the seed plus one per-axis step (steps are in
    /// physical units, converted to solver units with the seed).
    fn initial_simplex(&self, seed: &Tau) -> Vec<Vec<f64>> {
        let (axes, step): (Vec<usize>, Box<dyn Fn(usize) -> f64>) = match self {
            Mode::Full => (
                (0..6).collect(),
                Box::new(|i| {
                    if i < 3 {
                        SIMPLEX_ROT_STEP
                    } else {
                        SIMPLEX_TRANS_STEP
                    }
                }),
            ),
            // tighter simplex for the refinement pass
            Mode::TranslationOnly(_) => {
                ((3..6).collect(), Box::new(|_| SIMPLEX_TRANS_STEP * 0.1))
            }
        };
        let mut vertices = vec![self.to_scaled(seed)];
        for &i in &axes {
            let mut t = *seed;
            t[i] += step(i);
            vertices.push(self.to_scaled(&t));
        }
        vertices
    }
}

struct DumpConfig {
    every: usize,
    dir: PathBuf,
}

struct SimplexProblem<'a> {
    objective: &'a Objective<'a>,
    mode: Mode,
    history: RefCell<Vec<f64>>,
    evals: Cell<usize>,
    dump: Option<DumpConfig>,
}

impl CostFunction for SimplexProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        let tau = self.mode.from_scaled(param);
        tracing::trace!("projecting and costing at tau = {:?}", tau.as_slice());
        let loss = self.objective.eval(&tau)?;
        self.history.borrow_mut().push(loss);
        let n = self.evals.get() + 1;
        self.evals.set(n);

        if let Some(dump) = &self.dump {
            if dump.every > 0 && n % dump.every == 0 {
                self.save_reprojection(&tau, n);
            }
        }
        Ok(loss)
    }
}

impl SimplexProblem<'_> {
    fn save_reprojection(&self, tau: &Tau, n: usize) {
        let input = self.objective.input;
        let frame = &input.frames[0];
        let tables = project_frame(tau, &input.k, frame.width(), frame.height(), &frame.points);
        let img = viz::draw_reprojection(frame, &tables);
        if let Some(dump) = &self.dump {
            let path = dump.dir.join(format!("reproj-{n:06}.png"));
            if let Err(err) = img.save(&path) {
                tracing::warn!("could not save {}: {err}", path.display());
            }
        }
    }
}

fn perturb(tau: &Tau) -> Tau {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut out = *tau;
    for i in 0..3 {
        out[i] += rng.random_range(-PERTURB_ROT..PERTURB_ROT);
    }
    for i in 3..6 {
        out[i] += rng.random_range(-PERTURB_TRANS..PERTURB_TRANS);
    }
    out
}

fn is_bad_projection(err: &ArgminError) -> bool {
    matches!(
        err.downcast_ref::<CalibError>(),
        Some(CalibError::BadProjection { .. })
    )
}

/// One Nelder-Mead run with perturb-and-restart on degenerate
/// projections.
#[allow(clippy::too_many_arguments)]
fn minimize(
    objective: &Objective<'_>,
    tau0: Tau,
    mode: Mode,
    params: &OptimizeParams,
    history: &mut Vec<f64>,
    evals: &mut usize,
    restarts: &mut usize,
) -> Result<Tau> {
    let pre_tau = tau0;
    let mut seed = tau0;
    let mut attempts = 0usize;
    loop {
        let problem = SimplexProblem {
            objective,
            mode,
            history: RefCell::new(Vec::new()),
            evals: Cell::new(0),
            dump: params.out_dir.as_ref().map(|dir| DumpConfig {
                every: params.save_every,
                dir: dir.clone(),
            }),
        };
        let nm: NelderMead<Vec<f64>, f64> = NelderMead::new(mode.initial_simplex(&seed))
            .with_sd_tolerance(1e-8)
            .map_err(|e| CalibError::Solver(e.to_string()))?;

        let run = Executor::new(problem, nm)
            .configure(|state| state.max_iters(params.max_iters))
            .run();

        match run {
            Ok(res) => {
                if let Some(p) = res.problem.problem {
                    history.extend(p.history.into_inner());
                    *evals += p.evals.get();
                }
                let tau = match res.state.best_param {
                    Some(best) => mode.from_scaled(&best),
                    None => seed,
                };
                tracing::debug!(
                    "converged after {} iterations, best cost {:?}",
                    res.state.iter,
                    res.state.best_cost,
                );
                return Ok(tau);
            }
            Err(err) if is_bad_projection(&err) => {
                attempts += 1;
                *restarts += 1;
                if attempts > params.restart_budget {
                    tracing::error!("restart budget exhausted: {err}");
                    return Err(CalibError::RestartsExhausted { attempts });
                }
                seed = perturb(&pre_tau);
                tracing::warn!(
                    "degenerate projection, perturbing and restarting \
                     (attempt {attempts}/{})",
                    params.restart_budget
                );
            }
            Err(err) => return Err(CalibError::Solver(err.to_string())),
        }
    }
}

/// Run the full calibration: for each kernel width in the schedule,
/// minimize the weighted loss starting from the previous best transform.
pub fn calibrate(
    input: &CalibrationInput<'_>,
    tau_init: &Tau,
    params: &OptimizeParams,
) -> Result<CalibrationOutcome> {
    input.validate(&params.weights)?;
    if params.sigmas.is_empty() {
        return Err(CalibError::InvalidConfig("empty sigma schedule".into()));
    }
    if params.sigmas.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(CalibError::InvalidConfig(format!(
            "sigma schedule must be positive: {:?}",
            params.sigmas
        )));
    }
    if params.max_iters == 0 {
        return Err(CalibError::InvalidConfig("max_iters is zero".into()));
    }

    let dts: Vec<Vec<f64>> = if params.weights.chamfer != 0.0 {
        input.img_edges.iter().map(distance_transform).collect()
    } else {
        Vec::new()
    };

    let mut tau = *tau_init;
    let mut history = Vec::new();
    let mut evaluations = 0usize;
    let mut restarts = 0usize;

    for (stage, &sigma) in params.sigmas.iter().enumerate() {
        tracing::info!(
            "refinement stage {}/{}: sigma = {sigma}",
            stage + 1,
            params.sigmas.len()
        );
        let objective = Objective::new(
            input,
            &dts,
            params.weights,
            sigma,
            params.scale_sigma_by_depth,
            params.floor,
        );
        tau = minimize(
            &objective,
            tau,
            Mode::Full,
            params,
            &mut history,
            &mut evaluations,
            &mut restarts,
        )?;
        if params.translation_only_pass {
            let rot = Vector3::new(tau[0], tau[1], tau[2]);
            tau = minimize(
                &objective,
                tau,
                Mode::TranslationOnly(rot),
                params,
                &mut history,
                &mut evaluations,
                &mut restarts,
            )?;
        }
    }

    let final_objective = Objective::new(
        input,
        &dts,
        params.weights,
        *params.sigmas.last().unwrap_or(&1.0),
        params.scale_sigma_by_depth,
        params.floor,
    );
    let loss = final_objective.eval(&tau)?;
    tracing::info!("calibration finished: loss = {loss:.6}");

    Ok(CalibrationOutcome {
        tau,
        loss,
        loss_history: history,
        evaluations,
        restarts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_roundtrip_full() {
        let tau = Tau::new(0.1, -0.2, 0.3, 1.5, -2.5, 0.5);
        let mode = Mode::Full;
        let p = mode.to_scaled(&tau);
        assert_eq!(p.len(), 6);
        approx::assert_relative_eq!(p[3], 1.5e-2);
        approx::assert_relative_eq!(mode.from_scaled(&p), tau);
    }

    #[test]
    fn scaled_roundtrip_translation_only() {
        let tau = Tau::new(0.1, -0.2, 0.3, 1.5, -2.5, 0.5);
        let mode = Mode::TranslationOnly(Vector3::new(0.1, -0.2, 0.3));
        let p = mode.to_scaled(&tau);
        assert_eq!(p.len(), 3);
        approx::assert_relative_eq!(mode.from_scaled(&p), tau);
    }

    #[test]
    fn simplex_has_per_axis_steps() {
        let tau = Tau::zeros();
        let vertices = Mode::Full.initial_simplex(&tau);
        assert_eq!(vertices.len(), 7);
        approx::assert_relative_eq!(vertices[1][0], SIMPLEX_ROT_STEP);
        approx::assert_relative_eq!(vertices[4][3], SIMPLEX_TRANS_STEP * TAU_SCALE[3]);
        let t = Mode::TranslationOnly(Vector3::zeros()).initial_simplex(&tau);
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn perturbation_stays_bounded() {
        let tau = Tau::zeros();
        for _ in 0..20 {
            let p = perturb(&tau);
            for i in 0..3 {
                assert!(p[i].abs() < PERTURB_ROT);
            }
            for i in 3..6 {
                assert!(p[i].abs() < PERTURB_TRANS);
            }
        }
    }
}
