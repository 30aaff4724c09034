//! SILP / BESO optimisation loop for one design target.
//!
//! A run moves through INIT → ITERATE* → FINALIZE. Each iteration:
//!
//!   1. select the elements whose filtered signals allow a flip
//!   2. discrete flip decision (BESO when the stiffness floor is inactive,
//!      constrained sub-solver otherwise)
//!   3. morphological open over `Mf`
//!   4. budgeted island pruning
//!   5. forced erosion when nothing changed
//!   6. incremental physical update for the changed elements
//!   7. homogenized properties
//!   8. rewind + dilate when the stiffness floor is violated
//!   9. sensitivity re-analysis, filtering, momentum
//!  10. convergence bookkeeping against the running best
//!
//! All mutable per-run arrays live in [`RunContext`]; the filters, the
//! connectivity analyzer and the collaborators are only borrowed, so many
//! runs can share them.

use crate::connectivity::{ConnectivityAnalyzer, IslandBudget};
use crate::filters::FilterSet;
use crate::homogenization::{Evaluation, HomogenizedProperties};
use crate::ilp::{check_assignment, ConstraintSense, FlipSolver};
use crate::morphology;
use crate::physics::{analyze_all_timed, find_method, Baseline, PhysicalModel, SensitivityKernel};
use crate::sensitivity::{element_sensitivities, filter_fields, FilteredFields, MomentumField};
use crate::types::{
    changed_elements, volume_fraction, DesignTarget, IslandRanking, IterationRecord, OptimizationResult,
    OptimizerSettings, RunStatus, SensitivityMethod, StageTimings, TensorSensitivity, TopoptError, TopoptResult,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────
//  Run state
// ─────────────────────────────────────────────────────────────

/// Best topology found so far.
///
/// `objective` follows every accepted iteration; `topology`, `poisson_ratio`
/// and `youngs_modulus` only follow a strict improvement of the ν error.
#[derive(Debug, Clone, PartialEq)]
pub struct BestSoFar {
    pub topology: Vec<bool>,
    pub poisson_ratio: f64,
    pub youngs_modulus: f64,
    pub objective: f64,
}

#[derive(Debug, Clone, Default)]
struct StageClock {
    decision: Duration,
    physics: Duration,
    sensitivity: Duration,
    methods: Vec<(SensitivityMethod, Duration)>,
    post: Duration,
}

impl StageClock {
    fn add_method(&mut self, method: SensitivityMethod, elapsed: Duration) {
        self.sensitivity += elapsed;
        match self.methods.iter_mut().find(|(m, _)| *m == method) {
            Some((_, total)) => *total += elapsed,
            None => self.methods.push((method, elapsed)),
        }
    }
}

/// Mutable state of one optimisation run.
#[derive(Debug, Clone)]
pub struct RunContext<P> {
    target: DesignTarget,
    topology: Vec<bool>,
    model: P,
    evaluation: Evaluation,
    filtered: FilteredFields,
    momentum: MomentumField,
    best: BestSoFar,
    waiting: usize,
    iteration: usize,
    history: Vec<IterationRecord>,
    clock: StageClock,
}

impl<P> RunContext<P> {
    pub fn target(&self) -> &DesignTarget {
        &self.target
    }

    /// Current accepted topology `x`.
    pub fn topology(&self) -> &[bool] {
        &self.topology
    }

    pub fn model(&self) -> &P {
        &self.model
    }

    pub fn evaluation(&self) -> &Evaluation {
        &self.evaluation
    }

    pub fn filtered(&self) -> &FilteredFields {
        &self.filtered
    }

    pub fn momentum(&self) -> &MomentumField {
        &self.momentum
    }

    pub fn best(&self) -> &BestSoFar {
        &self.best
    }

    /// Consecutive non-improving iterations.
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }
}

/// What one ITERATE pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub iteration: usize,
    /// Number of elements eligible for the discrete decision.
    pub selected: usize,
    /// Entries changed by the discrete decision.
    pub flips: usize,
    /// Island elements removed.
    pub pruned: usize,
    /// Entries that differ from the previous accepted topology.
    pub changed: usize,
    pub eroded: bool,
    pub rolled_back: bool,
    /// The objective or the ν error improved on a feasible design; resets
    /// the patience counter.
    pub accepted: bool,
    /// The stored best topology was replaced.
    pub improved: bool,
    /// Patience exhausted.
    pub stop: bool,
}

/// Eligibility of one element for re-decision.
fn eligible(material: bool, momentum: f64, modulus: f64, tol: f64) -> bool {
    if material {
        momentum > -tol || modulus < tol
    } else {
        momentum < tol || modulus > -tol
    }
}

// ─────────────────────────────────────────────────────────────
//  Optimizer
// ─────────────────────────────────────────────────────────────

/// Shared, read-only machinery for any number of runs.
#[derive(Debug)]
pub struct Optimizer<'a, K: ?Sized, S: ?Sized> {
    settings: &'a OptimizerSettings,
    filters: &'a FilterSet,
    connectivity: &'a ConnectivityAnalyzer,
    kernel: &'a K,
    flip_solver: &'a S,
    budget: usize,
}

impl<'a, K: ?Sized, S: FlipSolver + ?Sized> Optimizer<'a, K, S> {
    pub fn new(
        settings: &'a OptimizerSettings,
        filters: &'a FilterSet,
        connectivity: &'a ConnectivityAnalyzer,
        kernel: &'a K,
        flip_solver: &'a S,
    ) -> TopoptResult<Self> {
        settings.validate()?;
        let n = connectivity.num_design();
        if filters.sensitivity.dim() != n || filters.morphology.dim() != n {
            return Err(TopoptError::Shape(format!(
                "filters of size ({}, {}) for {n} design elements",
                filters.sensitivity.dim(),
                filters.morphology.dim()
            )));
        }
        let budget = settings.flip_budget(n);
        if budget == 0 {
            return Err(TopoptError::Config(format!(
                "flip budget rounds to zero for {n} elements (max_change_fraction = {})",
                settings.max_change_fraction
            )));
        }
        Ok(Self { settings, filters, connectivity, kernel, flip_solver, budget })
    }

    pub fn settings(&self) -> &OptimizerSettings {
        self.settings
    }

    /// Per-iteration flip budget `dXmax`.
    pub fn budget(&self) -> usize {
        self.budget
    }

    fn num_design(&self) -> usize {
        self.connectivity.num_design()
    }

    fn evaluate<P: PhysicalModel>(&self, model: &P, topology: &[bool], target: &DesignTarget) -> TopoptResult<Evaluation> {
        let properties = HomogenizedProperties::from_tensor(&model.homogenized_tensor(), topology)?;
        Ok(Evaluation::new(properties, target, self.settings))
    }

    fn decision_signal<'s>(&self, analysis: &'s [(SensitivityMethod, TensorSensitivity)]) -> TopoptResult<&'s TensorSensitivity> {
        find_method(analysis, self.settings.decision_method)
    }

    fn snapshot<P: PhysicalModel>(
        &self,
        ctx: &mut RunContext<P>,
        report: Option<&StepReport>,
        analysis: Vec<(SensitivityMethod, TensorSensitivity)>,
    ) {
        if !self.settings.record_history {
            return;
        }
        let p = &ctx.evaluation.properties;
        ctx.history.push(IterationRecord {
            iteration: ctx.iteration,
            topology: ctx.topology.clone(),
            poisson_ratio: p.poisson_ratio,
            youngs_modulus: p.youngs_modulus,
            volume: p.volume,
            flips: report.map_or(0, |r| r.flips),
            changed: report.map_or(0, |r| r.changed),
            rolled_back: report.is_some_and(|r| r.rolled_back),
            eroded: report.is_some_and(|r| r.eroded),
            accepted: report.is_some_and(|r| r.accepted),
            improved: report.is_some_and(|r| r.improved),
            displacements: Some(ctx.model.displacements()),
            sensitivities: analysis,
        });
    }

    // ── INIT ───────────────────────────────────────────────

    /// Set up a run from the shared baseline.
    pub fn start<P>(&self, baseline: &Baseline<P>, target: DesignTarget) -> TopoptResult<RunContext<P>>
    where
        P: PhysicalModel,
        K: SensitivityKernel<P>,
    {
        target.validate()?;
        let n = self.num_design();
        if baseline.topology.len() != n {
            return Err(TopoptError::Shape(format!(
                "baseline topology of length {} for {n} design elements",
                baseline.topology.len()
            )));
        }
        if !self.connectivity.seeds().iter().any(|&s| baseline.topology[s]) {
            return Err(TopoptError::Config("baseline topology has no material boundary seed".into()));
        }

        let topology = baseline.topology.clone();
        let model = baseline.model.clone();
        let evaluation = self.evaluate(&model, &topology, &target)?;

        let d = self.decision_signal(&baseline.sensitivities)?;
        let raw = element_sensitivities(&evaluation, d, &topology, self.settings.volume_penalty)?;
        let filtered = filter_fields(&self.filters.sensitivity, &raw)?;
        let mut momentum = MomentumField::new(n, self.settings.momentum);
        momentum.update(&filtered.objective)?;

        let p = evaluation.properties;
        let best = BestSoFar {
            topology: topology.clone(),
            poisson_ratio: p.poisson_ratio,
            youngs_modulus: p.youngs_modulus,
            objective: evaluation.objective,
        };

        info!(
            nu_target = target.poisson_ratio,
            ey_min = target.min_modulus,
            nu = p.poisson_ratio,
            ey = p.youngs_modulus,
            budget = self.budget,
            "run started"
        );

        let mut ctx = RunContext {
            target,
            topology,
            model,
            evaluation,
            filtered,
            momentum,
            best,
            waiting: 0,
            iteration: 0,
            history: Vec::new(),
            clock: StageClock::default(),
        };
        self.snapshot(&mut ctx, None, baseline.sensitivities.clone());
        Ok(ctx)
    }

    // ── ITERATE ────────────────────────────────────────────

    /// One full ITERATE pass.
    pub fn step<P>(&self, ctx: &mut RunContext<P>) -> TopoptResult<StepReport>
    where
        P: PhysicalModel,
        K: SensitivityKernel<P>,
    {
        let tol = self.settings.tolerance;
        let mf = &self.filters.morphology;
        ctx.iteration += 1;

        // 1–5. Topology decision
        let t0 = Instant::now();
        let x = &ctx.topology;
        let mom = ctx.momentum.values();
        let fil_ey = &ctx.filtered.modulus;
        let selection: Vec<usize> = (0..x.len()).filter(|&e| eligible(x[e], mom[e], fil_ey[e], tol)).collect();

        let mut y = x.clone();
        let mut flips = 0;
        if !selection.is_empty() {
            let states: Vec<bool> = selection.iter().map(|&e| x[e]).collect();
            let obj: Vec<f64> = selection.iter().map(|&e| mom[e]).collect();
            let answer = if ctx.evaluation.floor_inactive(&ctx.target, tol) {
                self.flip_solver.solve_unconstrained(&states, &obj, self.budget)?
            } else {
                let con: Vec<f64> = selection.iter().map(|&e| fil_ey[e]).collect();
                self.flip_solver.solve_constrained(
                    &states,
                    &obj,
                    &con,
                    ctx.evaluation.modulus_margin,
                    ctx.evaluation.modulus_slack,
                    self.budget,
                    ConstraintSense::GreaterEqual,
                )?
            };
            flips = check_assignment(&states, &answer, self.budget)?;
            for (&e, &v) in selection.iter().zip(&answer) {
                y[e] = v;
            }
        }

        let mut y = morphology::open(mf, &y)?;
        let ranking = match self.settings.island_ranking {
            IslandRanking::Objective => &ctx.filtered.objective,
            IslandRanking::Modulus => &ctx.filtered.modulus,
        };
        let pruned = self
            .connectivity
            .prune_islands(&mut y, Some(IslandBudget { max_removals: self.budget, ranking }))?
            .len();

        let mut eroded = false;
        if y == ctx.topology {
            debug!(iteration = ctx.iteration, "no change, eroding");
            y = morphology::erode(mf, &y)?;
            eroded = true;
        }
        ctx.clock.decision += t0.elapsed();

        // 6–8. Physical update and feasibility
        let t0 = Instant::now();
        let previous = ctx.topology.clone();
        let changed = changed_elements(&previous, &y);
        if !changed.is_empty() {
            ctx.model.update(&y, &changed, true)?;
            ctx.topology = y;
        }
        let mut evaluation = self.evaluate(&ctx.model, &ctx.topology, &ctx.target)?;

        let rolled_back = evaluation.modulus_margin < 0.0;
        if rolled_back {
            if !changed.is_empty() {
                ctx.model.update(&previous, &changed, false)?;
                ctx.topology = previous.clone();
            }
            let dilated = morphology::dilate(mf, &ctx.topology)?;
            let grown = changed_elements(&ctx.topology, &dilated);
            warn!(
                iteration = ctx.iteration,
                margin = evaluation.modulus_margin,
                grown = grown.len(),
                "stiffness floor violated, rewinding and dilating"
            );
            if !grown.is_empty() {
                ctx.model.update(&dilated, &grown, true)?;
                ctx.topology = dilated;
            }
            evaluation = self.evaluate(&ctx.model, &ctx.topology, &ctx.target)?;
            if evaluation.modulus_margin < -tol {
                warn!(
                    iteration = ctx.iteration,
                    margin = evaluation.modulus_margin,
                    "stiffness floor still violated after dilation"
                );
            }
        }
        ctx.evaluation = evaluation;
        ctx.clock.physics += t0.elapsed();

        // 9. Sensitivity re-analysis, timed per method
        let mut analysis = Vec::new();
        for (method, s, elapsed) in analyze_all_timed(self.kernel, &ctx.topology, &ctx.model)? {
            ctx.clock.add_method(method, elapsed);
            analysis.push((method, s));
        }

        let t0 = Instant::now();
        let d = self.decision_signal(&analysis)?;
        let raw = element_sensitivities(&ctx.evaluation, d, &ctx.topology, self.settings.volume_penalty)?;
        ctx.filtered = filter_fields(&self.filters.sensitivity, &raw)?;
        ctx.momentum.update(&ctx.filtered.objective)?;

        // 10. Convergence bookkeeping
        let p = ctx.evaluation.properties;
        let nu_err = ctx.evaluation.poisson_error(&ctx.target);
        let best_err = (ctx.best.poisson_ratio - ctx.target.poisson_ratio).abs();
        let improves = ctx.evaluation.objective < (1.0 - tol) * ctx.best.objective || nu_err < (1.0 - tol) * best_err;
        let feasible = p.youngs_modulus > ctx.target.min_modulus - tol;
        let accepted = improves && feasible;
        let improved = accepted && nu_err < (1.0 - tol) * best_err;
        if accepted {
            ctx.waiting = 0;
            ctx.best.objective = ctx.evaluation.objective;
            // The stored design only moves on a strict ν-error gain, so its
            // error never grows.
            if improved {
                ctx.best.topology.clone_from(&ctx.topology);
                ctx.best.poisson_ratio = p.poisson_ratio;
                ctx.best.youngs_modulus = p.youngs_modulus;
            }
        } else {
            ctx.waiting += 1;
        }

        let report = StepReport {
            iteration: ctx.iteration,
            selected: selection.len(),
            flips,
            pruned,
            changed: changed_elements(&previous, &ctx.topology).len(),
            eroded,
            rolled_back,
            accepted,
            improved,
            stop: ctx.waiting >= self.settings.patience,
        };
        self.snapshot(ctx, Some(&report), analysis);
        ctx.clock.post += t0.elapsed();

        debug!(
            iteration = report.iteration,
            selected = report.selected,
            flips = report.flips,
            pruned = report.pruned,
            changed = report.changed,
            nu = p.poisson_ratio,
            ey = p.youngs_modulus,
            vol = p.volume,
            objective = ctx.evaluation.objective,
            waiting = ctx.waiting,
            "iteration done"
        );
        Ok(report)
    }

    // ── FINALIZE ───────────────────────────────────────────

    /// Strip the remaining islands from the best topology and build the
    /// result.
    pub fn finalize<P>(&self, mut ctx: RunContext<P>, status: RunStatus) -> TopoptResult<OptimizationResult>
    where
        P: PhysicalModel,
    {
        let mut pruned = ctx.best.topology.clone();
        let removed = self.connectivity.prune_islands(&mut pruned, None)?;
        if !removed.is_empty() {
            let changed = changed_elements(&ctx.topology, &pruned);
            if !changed.is_empty() {
                ctx.model.update(&pruned, &changed, true)?;
                ctx.topology = pruned.clone();
            }
            let evaluation = self.evaluate(&ctx.model, &ctx.topology, &ctx.target)?;
            debug!(removed = removed.len(), "islands removed from best topology");
            ctx.best = BestSoFar {
                topology: pruned,
                poisson_ratio: evaluation.properties.poisson_ratio,
                youngs_modulus: evaluation.properties.youngs_modulus,
                objective: evaluation.objective,
            };
        }

        let it = ctx.iteration.max(1) as f64;
        let c = &ctx.clock;
        let timings = StageTimings {
            decision: c.decision.as_secs_f64() / it,
            physics: c.physics.as_secs_f64() / it,
            sensitivity: c.sensitivity.as_secs_f64() / it,
            methods: c.methods.iter().map(|&(m, d)| (m, d.as_secs_f64() / it)).collect(),
            post: c.post.as_secs_f64() / it,
            total: (c.decision + c.physics + c.sensitivity + c.post).as_secs_f64(),
            iterations: ctx.iteration,
        };

        info!(
            nu_target = ctx.target.poisson_ratio,
            ey_min = ctx.target.min_modulus,
            nu_opt = ctx.best.poisson_ratio,
            ey_opt = ctx.best.youngs_modulus,
            iterations = ctx.iteration,
            ?status,
            seconds = timings.total,
            "run finished"
        );

        let volume = volume_fraction(&ctx.best.topology);
        Ok(OptimizationResult {
            target: ctx.target,
            topology: ctx.best.topology,
            poisson_ratio: ctx.best.poisson_ratio,
            youngs_modulus: ctx.best.youngs_modulus,
            volume,
            iterations: ctx.iteration,
            status,
            history: ctx.history,
            timings,
        })
    }

    // ── Top-level entry point ──────────────────────────────

    /// Run INIT → ITERATE* → FINALIZE for one design target.
    ///
    /// Ends with [`RunStatus::Converged`] when the patience counter runs out,
    /// or [`RunStatus::IterationLimit`] when the optional ceiling is hit first.
    pub fn optimize<P>(&self, baseline: &Baseline<P>, target: DesignTarget) -> TopoptResult<OptimizationResult>
    where
        P: PhysicalModel,
        K: SensitivityKernel<P>,
    {
        let mut ctx = self.start(baseline, target)?;
        let status = loop {
            let report = self.step(&mut ctx)?;
            if report.stop {
                break RunStatus::Converged;
            }
            if self.settings.max_iterations.is_some_and(|max| ctx.iteration >= max) {
                warn!(iterations = ctx.iteration, "iteration ceiling reached before convergence");
                break RunStatus::IterationLimit;
            }
        };
        self.finalize(ctx, status)
    }
}
