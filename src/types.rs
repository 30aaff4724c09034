use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Algorithmic outcomes (an empty selection, a violated stiffness floor)
/// are ordinary control flow and never surface here.
#[derive(Debug, Error)]
pub enum TopoptError {
    /// Invalid settings, design target or baseline.
    #[error("configuration error: {0}")]
    Config(String),
    /// Mesh tables are inconsistent (bad symmetry map, >4 face neighbours, …).
    #[error("mesh error: {0}")]
    Mesh(String),
    /// Shape mismatch between arrays or collaborator outputs.
    #[error("shape error: {0}")]
    Shape(String),
    /// The physical-state collaborator failed.
    #[error("physical model error: {0}")]
    Physics(String),
    /// The sensitivity kernel failed.
    #[error("sensitivity kernel error: {0}")]
    Sensitivity(String),
    /// The discrete sub-solver failed or broke its contract.
    #[error("flip solver error: {0}")]
    FlipSolver(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type TopoptResult<T> = Result<T, TopoptError>;

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Tolerance used for every comparison against zero.
pub const DEFAULT_TOLERANCE: f64 = 1e-14;

/// Number of face neighbours of a quadrilateral element.
pub const FACE_NEIGHBOURS: usize = 4;

// ─────────────────────────────────────────────────────────────
//  Sensitivity estimation methods
// ─────────────────────────────────────────────────────────────

/// Estimation method of the homogenization sensitivity kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensitivityMethod {
    /// Series estimate truncated at the given order (0, 1 or 2).
    Cgs(u8),
    /// Exact flip estimate; the default decision signal.
    Ws,
}

/// Which filtered field ranks islands when the change budget forces a
/// partial removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IslandRanking {
    /// Filtered objective sensitivity.
    Objective,
    /// Filtered modulus sensitivity.
    Modulus,
}

// ─────────────────────────────────────────────────────────────
//  Optimizer settings
// ─────────────────────────────────────────────────────────────

/// Fixed parameters of the SILP loop, shared by every input of a dataset run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Maximal decrease of the Young's modulus slack per iteration.
    pub modulus_variation: f64,
    /// Maximal shift of the Poisson's ratio goal per iteration.
    pub poisson_variation: f64,
    /// Maximal topology variation as a fraction of N.
    pub max_change_fraction: f64,
    /// Sensitivity filter radius.
    pub sensitivity_radius: f64,
    /// Morphology filter radius.
    pub morphology_radius: f64,
    /// Non-improving iterations tolerated before finalizing.
    pub patience: usize,
    /// Weight retained from the momentum history.
    pub momentum: f64,
    /// Volume penalization factor.
    pub volume_penalty: f64,
    /// Tolerance for comparisons against zero.
    pub tolerance: f64,
    /// Optional hard iteration ceiling.
    pub max_iterations: Option<usize>,
    /// Kernel method whose output drives the flip decision.
    pub decision_method: SensitivityMethod,
    pub island_ranking: IslandRanking,
    /// Keep a per-iteration snapshot history in the result.
    pub record_history: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            modulus_variation: 0.05,
            poisson_variation: 2.0,
            max_change_fraction: 0.015625,
            sensitivity_radius: 0.024,
            morphology_radius: 0.018,
            patience: 30,
            momentum: 0.25,
            volume_penalty: 0.05,
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: None,
            decision_method: SensitivityMethod::Ws,
            island_ranking: IslandRanking::Objective,
            record_history: true,
        }
    }
}

impl OptimizerSettings {
    /// Read settings from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> TopoptResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> TopoptResult<()> {
        for (name, r) in [
            ("sensitivity_radius", self.sensitivity_radius),
            ("morphology_radius", self.morphology_radius),
        ] {
            if !(r.is_finite() && r > 0.0) {
                return Err(TopoptError::Config(format!("{name} must be positive, got {r}")));
            }
        }
        if self.patience == 0 {
            return Err(TopoptError::Config("patience must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(TopoptError::Config(format!(
                "momentum must lie in [0, 1), got {}",
                self.momentum
            )));
        }
        if !(self.max_change_fraction > 0.0 && self.max_change_fraction <= 1.0) {
            return Err(TopoptError::Config(format!(
                "max_change_fraction must lie in (0, 1], got {}",
                self.max_change_fraction
            )));
        }
        if self.modulus_variation < 0.0 || self.poisson_variation < 0.0 {
            return Err(TopoptError::Config("per-iteration variations must be non-negative".into()));
        }
        if self.tolerance.is_nan() || self.tolerance < 0.0 || self.volume_penalty.is_nan() || self.volume_penalty < 0.0 {
            return Err(TopoptError::Config("tolerance and volume_penalty must be non-negative".into()));
        }
        if self.max_iterations == Some(0) {
            return Err(TopoptError::Config("max_iterations must be at least 1 when set".into()));
        }
        Ok(())
    }

    /// Per-iteration flip budget `dXmax = round(N · Dmax)`.
    pub fn flip_budget(&self, num_design: usize) -> usize {
        (num_design as f64 * self.max_change_fraction).round() as usize
    }
}

// ─────────────────────────────────────────────────────────────
//  Design target  (one dataset input)
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DesignTarget {
    /// Target Poisson's ratio `nuval`.
    pub poisson_ratio: f64,
    /// Young's modulus floor `Eymin`.
    pub min_modulus: f64,
}

impl DesignTarget {
    pub fn new(poisson_ratio: f64, min_modulus: f64) -> Self {
        Self { poisson_ratio, min_modulus }
    }

    pub fn validate(&self) -> TopoptResult<()> {
        if !self.poisson_ratio.is_finite() || !self.min_modulus.is_finite() {
            return Err(TopoptError::Config(format!("non-finite design target {self:?}")));
        }
        if self.min_modulus < 0.0 {
            return Err(TopoptError::Config(format!(
                "min_modulus must be non-negative, got {}",
                self.min_modulus
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Periodic mesh  (supplied by the mesh collaborator)
// ─────────────────────────────────────────────────────────────

/// Element tables of the symmetry-expanded base cell.
///
/// "Extended" elements are every physical element of the base cell plus the
/// ghost strips that make periodic wrap-around faces explicit. Each extended
/// element belongs to exactly one design element through `symmetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicMesh {
    /// Ns: the design grid is Ns × Ns, row-major.
    pub grid_side: usize,
    /// Node ids of each extended element (quadrilaterals).
    pub connectivity: Vec<[usize; 4]>,
    /// Centroid of each extended element.
    pub centroids: Vec<[f64; 2]>,
    /// Design index → extended copies; entry 0 is the representative.
    pub symmetry: Vec<Vec<usize>>,
}

impl PeriodicMesh {
    pub fn num_design(&self) -> usize {
        self.symmetry.len()
    }

    pub fn num_extended(&self) -> usize {
        self.connectivity.len()
    }

    /// Inverse of `symmetry`: extended element → design index.
    ///
    /// Fails unless every extended element is covered exactly once.
    pub fn design_owner(&self) -> TopoptResult<Vec<usize>> {
        let n_ext = self.num_extended();
        if self.centroids.len() != n_ext {
            return Err(TopoptError::Mesh(format!(
                "{} centroids for {} extended elements",
                self.centroids.len(),
                n_ext
            )));
        }
        let mut owner = vec![usize::MAX; n_ext];
        for (e, copies) in self.symmetry.iter().enumerate() {
            if copies.is_empty() {
                return Err(TopoptError::Mesh(format!("design element {e} has no physical copy")));
            }
            for &c in copies {
                if c >= n_ext {
                    return Err(TopoptError::Mesh(format!(
                        "design element {e} maps to element {c} outside the mesh ({n_ext})"
                    )));
                }
                if owner[c] != usize::MAX {
                    return Err(TopoptError::Mesh(format!(
                        "element {c} claimed by design elements {} and {e}",
                        owner[c]
                    )));
                }
                owner[c] = e;
            }
        }
        if let Some(c) = owner.iter().position(|&o| o == usize::MAX) {
            return Err(TopoptError::Mesh(format!("element {c} belongs to no design element")));
        }
        Ok(owner)
    }

    pub fn validate(&self) -> TopoptResult<()> {
        let n = self.num_design();
        if n == 0 {
            return Err(TopoptError::Config("mesh has no design elements".into()));
        }
        if self.grid_side * self.grid_side != n {
            return Err(TopoptError::Mesh(format!(
                "design grid side {} does not match {n} design elements",
                self.grid_side
            )));
        }
        self.design_owner().map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────
//  Tensor sensitivities  (output of the sensitivity kernel)
// ─────────────────────────────────────────────────────────────

/// Per-element derivatives of the three diagonal components of `Ch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSensitivity {
    pub d_c00: Vec<f64>,
    pub d_c11: Vec<f64>,
    pub d_c22: Vec<f64>,
}

impl TensorSensitivity {
    pub fn zeros(n: usize) -> Self {
        Self { d_c00: vec![0.0; n], d_c11: vec![0.0; n], d_c22: vec![0.0; n] }
    }

    pub fn len(&self) -> usize {
        self.d_c00.len()
    }

    pub fn is_empty(&self) -> bool {
        self.d_c00.is_empty()
    }

    pub fn check_len(&self, n: usize) -> TopoptResult<()> {
        if self.d_c00.len() != n || self.d_c11.len() != n || self.d_c22.len() != n {
            return Err(TopoptError::Shape(format!(
                "tensor sensitivity lengths ({}, {}, {}) != {n}",
                self.d_c00.len(),
                self.d_c11.len(),
                self.d_c22.len()
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Run outcome
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The patience counter ran out.
    Converged,
    /// The optional hard ceiling was hit first.
    IterationLimit,
}

/// Snapshot of one iteration (iteration 0 is the initial state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub topology: Vec<bool>,
    pub poisson_ratio: f64,
    pub youngs_modulus: f64,
    pub volume: f64,
    /// Entries changed by the discrete decision alone.
    pub flips: usize,
    /// Entries that differ from the previous accepted topology.
    pub changed: usize,
    pub rolled_back: bool,
    pub eroded: bool,
    /// Feasible objective or ν-error gain; resets the patience counter.
    pub accepted: bool,
    /// The stored best topology was replaced.
    pub improved: bool,
    pub displacements: Option<Array2<f64>>,
    pub sensitivities: Vec<(SensitivityMethod, TensorSensitivity)>,
}

/// Wall-clock breakdown of a run, in seconds.
///
/// Stage entries are per-iteration averages; `total` is the sum over the run.
/// `sensitivity` covers every kernel method, `methods` splits it per method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub decision: f64,
    pub physics: f64,
    pub sensitivity: f64,
    pub methods: Vec<(SensitivityMethod, f64)>,
    pub post: f64,
    pub total: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub target: DesignTarget,
    pub topology: Vec<bool>,
    pub poisson_ratio: f64,
    pub youngs_modulus: f64,
    pub volume: f64,
    pub iterations: usize,
    pub status: RunStatus,
    pub history: Vec<IterationRecord>,
    pub timings: StageTimings,
}

impl OptimizationResult {
    pub fn converged(&self) -> bool {
        self.status == RunStatus::Converged
    }
}

/// Indices where two topologies differ.
pub fn changed_elements(before: &[bool], after: &[bool]) -> Vec<usize> {
    before
        .iter()
        .zip(after)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(i, _)| i)
        .collect()
}

/// Material fraction `count(x) / N`.
pub fn volume_fraction(topology: &[bool]) -> f64 {
    if topology.is_empty() {
        return 0.0;
    }
    topology.iter().filter(|&&m| m).count() as f64 / topology.len() as f64
}
