//! Contracts of the physical-state and sensitivity collaborators, and the
//! shared baseline every run starts from.
//!
//! The finite-element side (assembly, periodic constraints, Cholesky
//! factorisation and its incremental update) lives behind [`PhysicalModel`].
//! The optimizer only ever asks for full solves, incremental updates keyed by
//! the flipped elements, exact rewinds of the last update, and the resulting
//! homogenized tensor.

use crate::types::{SensitivityMethod, TensorSensitivity, TopoptError, TopoptResult};
use ndarray::Array2;
use std::time::{Duration, Instant};
use tracing::debug;

/// Physical state of one run (operator, factorisation, displacements).
///
/// `Clone` hands every run its own copy; the factorisation must never be
/// shared between runs because rewinds replay the last update exactly.
pub trait PhysicalModel: Clone {
    /// Full assembly and solve for `topology`.
    fn solve(&mut self, topology: &[bool]) -> TopoptResult<()>;

    /// Incremental update after the elements in `changed` flipped; `topology`
    /// is the state *after* the flip.
    ///
    /// With `solve_system = false` the call is the exact inverse of the
    /// preceding update with the same `changed` list: operator, factorisation
    /// and displacements return to their earlier values without a new solve.
    fn update(&mut self, topology: &[bool], changed: &[usize], solve_system: bool) -> TopoptResult<()>;

    /// Homogenized stiffness tensor `Ch` (3 × 3) of the current state.
    fn homogenized_tensor(&self) -> Array2<f64>;

    /// Displacements of the three unit macro-strain load cases (DOF × 3).
    fn displacements(&self) -> Array2<f64>;
}

/// Per-element derivatives of the homogenized tensor diagonal.
///
/// Implementations must be free of side effects.
pub trait SensitivityKernel<P: PhysicalModel> {
    /// Every method this kernel supports.
    fn methods(&self) -> Vec<SensitivityMethod>;

    fn sensitivities(&self, method: SensitivityMethod, topology: &[bool], model: &P) -> TopoptResult<TensorSensitivity>;
}

/// Evaluate every method of `kernel`.
pub fn analyze_all<P, K>(kernel: &K, topology: &[bool], model: &P) -> TopoptResult<Vec<(SensitivityMethod, TensorSensitivity)>>
where
    P: PhysicalModel,
    K: SensitivityKernel<P> + ?Sized,
{
    let timed = analyze_all_timed(kernel, topology, model)?;
    Ok(timed.into_iter().map(|(method, s, _)| (method, s)).collect())
}

/// [`analyze_all`] with the wall-clock time of each method.
pub fn analyze_all_timed<P, K>(
    kernel: &K,
    topology: &[bool],
    model: &P,
) -> TopoptResult<Vec<(SensitivityMethod, TensorSensitivity, Duration)>>
where
    P: PhysicalModel,
    K: SensitivityKernel<P> + ?Sized,
{
    kernel
        .methods()
        .into_iter()
        .map(|method| {
            let t0 = Instant::now();
            let s = kernel.sensitivities(method, topology, model)?;
            let elapsed = t0.elapsed();
            s.check_len(topology.len())?;
            Ok((method, s, elapsed))
        })
        .collect()
}

/// Look up one method in an analysis result.
pub fn find_method(
    analysis: &[(SensitivityMethod, TensorSensitivity)],
    method: SensitivityMethod,
) -> TopoptResult<&TensorSensitivity> {
    analysis
        .iter()
        .find(|(m, _)| *m == method)
        .map(|(_, s)| s)
        .ok_or_else(|| TopoptError::Sensitivity(format!("kernel does not provide method {method:?}")))
}

// ─────────────────────────────────────────────────────────────
//  Baseline
// ─────────────────────────────────────────────────────────────

/// Initial topology analysed once and shared by every input.
#[derive(Debug, Clone)]
pub struct Baseline<P> {
    pub topology: Vec<bool>,
    pub model: P,
    pub sensitivities: Vec<(SensitivityMethod, TensorSensitivity)>,
}

impl<P: PhysicalModel> Baseline<P> {
    /// Solve `model` for `topology` and run every sensitivity method.
    pub fn analyze<K>(topology: Vec<bool>, mut model: P, kernel: &K) -> TopoptResult<Self>
    where
        K: SensitivityKernel<P> + ?Sized,
    {
        if topology.is_empty() {
            return Err(TopoptError::Config("baseline topology is empty".into()));
        }
        model.solve(&topology)?;
        let sensitivities = analyze_all(kernel, &topology, &model)?;
        debug!(elements = topology.len(), methods = sensitivities.len(), "baseline analysed");
        Ok(Self { topology, model, sensitivities })
    }
}
