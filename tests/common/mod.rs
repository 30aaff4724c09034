//! Shared fixtures: square meshes, a cheap analytic physical model, its
//! sensitivity kernel and a few discrete sub-solvers.

#![allow(dead_code)]

use basecell_silp::ilp::{ConstraintSense, FlipSolver};
use basecell_silp::physics::{PhysicalModel, SensitivityKernel};
use basecell_silp::types::*;
use ndarray::Array2;

// ─────────────────────────────────────────────────────────────
//  Meshes
// ─────────────────────────────────────────────────────────────

/// Unit-square mesh of `ns × ns` quads, design index `i * ns + j` for row i,
/// column j.
///
/// With `periodic` a one-element ghost ring (corners included) is appended
/// after the physical elements; every ghost is a copy of the design element
/// on the opposite side of the cell. The ring shares nodes with the boundary
/// elements, so wrap-around faces show up as ordinary shared edges.
pub fn square_grid_mesh(ns: usize, periodic: bool) -> PeriodicMesh {
    let h = 1.0 / ns as f64;
    let centroid = |i: isize, j: isize| [(j as f64 + 0.5) * h, (i as f64 + 0.5) * h];

    if !periodic {
        let side = ns + 1;
        let mut connectivity = Vec::with_capacity(ns * ns);
        let mut centroids = Vec::with_capacity(ns * ns);
        for i in 0..ns {
            for j in 0..ns {
                let n = |r: usize, c: usize| r * side + c;
                connectivity.push([n(i, j), n(i, j + 1), n(i + 1, j + 1), n(i + 1, j)]);
                centroids.push(centroid(i as isize, j as isize));
            }
        }
        let symmetry = (0..ns * ns).map(|e| vec![e]).collect();
        return PeriodicMesh { grid_side: ns, connectivity, centroids, symmetry };
    }

    // Extended grid rows/cols run over -1..=ns; node (I, J) with I, J in 0..ns+3.
    let side = ns + 3;
    let node = |i: isize, j: isize| ((i + 1) as usize) * side + (j + 1) as usize;
    let quad = |i: isize, j: isize| [node(i, j), node(i, j + 1), node(i + 1, j + 1), node(i + 1, j)];

    let mut connectivity = Vec::new();
    let mut centroids = Vec::new();
    let mut symmetry: Vec<Vec<usize>> = vec![Vec::new(); ns * ns];

    for i in 0..ns as isize {
        for j in 0..ns as isize {
            let e = connectivity.len();
            connectivity.push(quad(i, j));
            centroids.push(centroid(i, j));
            symmetry[e].push(e);
        }
    }
    let wrap = |k: isize| k.rem_euclid(ns as isize) as usize;
    for i in -1..=ns as isize {
        for j in -1..=ns as isize {
            let inside = (0..ns as isize).contains(&i) && (0..ns as isize).contains(&j);
            if inside {
                continue;
            }
            let c = connectivity.len();
            connectivity.push(quad(i, j));
            centroids.push(centroid(i, j));
            symmetry[wrap(i) * ns + wrap(j)].push(c);
        }
    }
    PeriodicMesh { grid_side: ns, connectivity, centroids, symmetry }
}

/// Build a topology from a picture: `#` material, `.` void, one row per line.
pub fn topology_from_rows(rows: &[&str]) -> Vec<bool> {
    rows.iter().flat_map(|r| r.chars().map(|c| c == '#')).collect()
}

// ─────────────────────────────────────────────────────────────
//  Analytic physical model
// ─────────────────────────────────────────────────────────────

/// Stiffness driven by the weighted material fraction `m`:
///
///   C00 = A·m + C0,  C22 = B·m²
///
/// Both Ey and C22/C00 grow monotonically with `m`, so removing material
/// raises the Poisson's ratio and lowers the Young's modulus.
#[derive(Debug, Clone)]
pub struct FractionModel {
    weights: Vec<f64>,
    total: f64,
    mass: f64,
    /// Mass before the last incremental update.
    rewind_mass: f64,
    topology: Vec<bool>,
    pub full_solves: usize,
    pub updates: usize,
}

pub const A: f64 = 1.0;
pub const C0: f64 = 0.01;
pub const B: f64 = 0.35;

pub fn element_weights(n: usize) -> Vec<f64> {
    (0..n).map(|e| 1.0 + 0.1 * (e % 7) as f64).collect()
}

pub fn tensor_for(m: f64) -> Array2<f64> {
    let c00 = A * m + C0;
    let c22 = B * m * m;
    let mut ch = Array2::zeros((3, 3));
    ch[[0, 0]] = c00;
    ch[[1, 1]] = c00;
    ch[[2, 2]] = c22;
    ch[[0, 1]] = c00 - 2.0 * c22;
    ch[[1, 0]] = c00 - 2.0 * c22;
    ch
}

impl FractionModel {
    pub fn new(n: usize) -> Self {
        let weights = element_weights(n);
        let total = weights.iter().sum();
        Self { weights, total, mass: 0.0, rewind_mass: 0.0, topology: vec![false; n], full_solves: 0, updates: 0 }
    }

    pub fn fraction(&self) -> f64 {
        self.mass / self.total
    }

    pub fn weight(&self, e: usize) -> f64 {
        self.weights[e]
    }

    fn check(&self, topology: &[bool]) -> TopoptResult<()> {
        if topology.len() != self.weights.len() {
            return Err(TopoptError::Physics(format!(
                "topology of length {} for a model of {} elements",
                topology.len(),
                self.weights.len()
            )));
        }
        Ok(())
    }
}

impl PhysicalModel for FractionModel {
    fn solve(&mut self, topology: &[bool]) -> TopoptResult<()> {
        self.check(topology)?;
        self.mass = topology.iter().zip(&self.weights).filter(|(x, _)| **x).map(|(_, &w)| w).sum();
        self.rewind_mass = self.mass;
        self.topology = topology.to_vec();
        self.full_solves += 1;
        Ok(())
    }

    fn update(&mut self, topology: &[bool], changed: &[usize], solve_system: bool) -> TopoptResult<()> {
        self.check(topology)?;
        if solve_system {
            self.rewind_mass = self.mass;
            for &e in changed {
                if topology[e] {
                    self.mass += self.weights[e];
                } else {
                    self.mass -= self.weights[e];
                }
            }
        } else {
            self.mass = self.rewind_mass;
        }
        self.topology = topology.to_vec();
        self.updates += 1;
        Ok(())
    }

    fn homogenized_tensor(&self) -> Array2<f64> {
        tensor_for(self.fraction())
    }

    fn displacements(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.topology.len(), 3), |(e, k)| {
            if self.topology[e] {
                self.weights[e] * (k + 1) as f64
            } else {
                0.0
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────
//  Sensitivity kernel
// ─────────────────────────────────────────────────────────────

/// `Ws`: exact change of `Ch` when one element flips.
/// `Cgs(0)`: first-order change.
#[derive(Debug, Clone, Copy)]
pub struct FractionKernel;

impl SensitivityKernel<FractionModel> for FractionKernel {
    fn methods(&self) -> Vec<SensitivityMethod> {
        vec![SensitivityMethod::Cgs(0), SensitivityMethod::Ws]
    }

    fn sensitivities(
        &self,
        method: SensitivityMethod,
        topology: &[bool],
        model: &FractionModel,
    ) -> TopoptResult<TensorSensitivity> {
        let n = topology.len();
        let m = model.fraction();
        let base = tensor_for(m);
        let mut s = TensorSensitivity::zeros(n);
        for e in 0..n {
            let sign = if topology[e] { -1.0 } else { 1.0 };
            let dm = sign * model.weight(e) / model.total;
            let (d00, d22) = match method {
                SensitivityMethod::Ws => {
                    let flipped = tensor_for(m + dm);
                    (flipped[[0, 0]] - base[[0, 0]], flipped[[2, 2]] - base[[2, 2]])
                }
                SensitivityMethod::Cgs(0) => (A * dm, 2.0 * B * m * dm),
                other => {
                    return Err(TopoptError::Sensitivity(format!("method {other:?} not supported")));
                }
            };
            s.d_c00[e] = d00;
            s.d_c11[e] = d00;
            s.d_c22[e] = d22;
        }
        Ok(s)
    }
}

// ─────────────────────────────────────────────────────────────
//  Sub-solvers
// ─────────────────────────────────────────────────────────────

/// Rank-and-flip that skips any flip breaking the linearised constraint.
#[derive(Debug, Clone, Copy)]
pub struct GreedySolver;

impl FlipSolver for GreedySolver {
    fn solve_constrained(
        &self,
        states: &[bool],
        objective: &[f64],
        constraint: &[f64],
        margin: f64,
        slack: f64,
        budget: usize,
        sense: ConstraintSense,
    ) -> TopoptResult<Vec<bool>> {
        let rhs = slack - margin;
        let mut order: Vec<usize> = (0..states.len())
            .filter(|&i| if states[i] { objective[i] > 0.0 } else { objective[i] < 0.0 })
            .collect();
        order.sort_by(|&a, &b| objective[b].abs().total_cmp(&objective[a].abs()));

        let mut out = states.to_vec();
        let mut lhs = 0.0;
        let mut flips = 0;
        for i in order {
            if flips == budget {
                break;
            }
            let delta = if states[i] { -constraint[i] } else { constraint[i] };
            let ok = match sense {
                ConstraintSense::GreaterEqual => lhs + delta >= rhs,
                ConstraintSense::LessEqual => lhs + delta <= rhs,
            };
            if ok {
                out[i] = !out[i];
                lhs += delta;
                flips += 1;
            }
        }
        Ok(out)
    }
}

/// Voids the first `budget` material elements, ignoring every signal.
#[derive(Debug, Clone, Copy)]
pub struct RecklessSolver;

fn void_first(states: &[bool], budget: usize) -> Vec<bool> {
    let mut out = states.to_vec();
    for x in out.iter_mut().filter(|x| **x).take(budget) {
        *x = false;
    }
    out
}

impl FlipSolver for RecklessSolver {
    fn solve_constrained(
        &self,
        states: &[bool],
        _objective: &[f64],
        _constraint: &[f64],
        _margin: f64,
        _slack: f64,
        budget: usize,
        _sense: ConstraintSense,
    ) -> TopoptResult<Vec<bool>> {
        Ok(void_first(states, budget))
    }

    fn solve_unconstrained(&self, states: &[bool], _objective: &[f64], budget: usize) -> TopoptResult<Vec<bool>> {
        Ok(void_first(states, budget))
    }
}

/// Never flips anything.
#[derive(Debug, Clone, Copy)]
pub struct FrozenSolver;

impl FlipSolver for FrozenSolver {
    fn solve_constrained(
        &self,
        states: &[bool],
        _objective: &[f64],
        _constraint: &[f64],
        _margin: f64,
        _slack: f64,
        _budget: usize,
        _sense: ConstraintSense,
    ) -> TopoptResult<Vec<bool>> {
        Ok(states.to_vec())
    }

    fn solve_unconstrained(&self, states: &[bool], _objective: &[f64], _budget: usize) -> TopoptResult<Vec<bool>> {
        Ok(states.to_vec())
    }
}

/// Flips every eligible element regardless of the budget.
#[derive(Debug, Clone, Copy)]
pub struct OverBudgetSolver;

impl FlipSolver for OverBudgetSolver {
    fn solve_constrained(
        &self,
        states: &[bool],
        _objective: &[f64],
        _constraint: &[f64],
        _margin: f64,
        _slack: f64,
        _budget: usize,
        _sense: ConstraintSense,
    ) -> TopoptResult<Vec<bool>> {
        Ok(states.iter().map(|x| !x).collect())
    }

    fn solve_unconstrained(&self, states: &[bool], _objective: &[f64], _budget: usize) -> TopoptResult<Vec<bool>> {
        Ok(states.iter().map(|x| !x).collect())
    }
}

// ─────────────────────────────────────────────────────────────
//  Settings
// ─────────────────────────────────────────────────────────────

/// Radii scaled to the grid: `Sf` covers the 3 × 3 block, `Mf` the
/// 5-element cross.
pub fn grid_settings(ns: usize) -> OptimizerSettings {
    let h = 1.0 / ns as f64;
    OptimizerSettings {
        sensitivity_radius: 1.5 * h,
        morphology_radius: 1.01 * h,
        max_change_fraction: 0.125,
        patience: 5,
        max_iterations: Some(200),
        ..OptimizerSettings::default()
    }
}

/// Young's modulus of a topology recomputed with a fresh full solve.
pub fn fresh_modulus(topology: &[bool]) -> f64 {
    let mut model = FractionModel::new(topology.len());
    model.solve(topology).expect("fresh solve");
    let ch = model.homogenized_tensor();
    let (c00, c22) = (ch[[0, 0]], ch[[2, 2]]);
    4.0 * c22 * (c00 - c22) / c00
}
