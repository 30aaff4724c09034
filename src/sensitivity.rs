//! Element sensitivities of the objective and of the Young's modulus, their
//! filtered versions, and the momentum-smoothed decision signal.
//!
//! The kernel supplies `dC00_e`, `dC22_e`: the change of the tensor entries
//! when element `e` flips. From those, per element:
//!
//!   ggamma = (C22 + dC22) / (C00 + dC00)
//!   dnu    = 2 (gamma · dC00 − dC22) / (C00 + dC00)
//!   dEy    = 4 (1 − ggamma) · dC22 + 2 · C22 · dnu
//!   dobj   = 2 (nu_hat − nu_g) · dnu + dnu²
//!
//! Signs are taken with respect to the design variable: a material element
//! reports `−d`, a void element `+d`.

use crate::filters::SparseFilter;
use crate::homogenization::Evaluation;
use crate::types::{TensorSensitivity, TopoptError, TopoptResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ElementSensitivities {
    /// `s_obj + beta / N`
    pub objective: Vec<f64>,
    /// `s_Ey`
    pub modulus: Vec<f64>,
}

pub fn element_sensitivities(
    eval: &Evaluation,
    d: &TensorSensitivity,
    topology: &[bool],
    volume_penalty: f64,
) -> TopoptResult<ElementSensitivities> {
    let n = topology.len();
    d.check_len(n)?;
    let p = &eval.properties;
    let volume_term = volume_penalty / n as f64;

    let mut objective = Vec::with_capacity(n);
    let mut modulus = Vec::with_capacity(n);
    for e in 0..n {
        let c00 = p.c00 + d.d_c00[e];
        let ggamma = (p.c22 + d.d_c22[e]) / c00;
        let dnu = 2.0 * (p.gamma * d.d_c00[e] - d.d_c22[e]) / c00;
        let dey = 4.0 * (1.0 - ggamma) * d.d_c22[e] + 2.0 * p.c22 * dnu;
        let dobj = 2.0 * (p.poisson_ratio - eval.poisson_goal) * dnu + dnu * dnu;
        let sign = if topology[e] { -1.0 } else { 1.0 };
        objective.push(sign * dobj + volume_term);
        modulus.push(sign * dey);
    }
    Ok(ElementSensitivities { objective, modulus })
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredFields {
    /// `Sf · raw_obj`
    pub objective: Vec<f64>,
    /// `Sf · s_Ey`
    pub modulus: Vec<f64>,
}

pub fn filter_fields(filter: &SparseFilter, raw: &ElementSensitivities) -> TopoptResult<FilteredFields> {
    Ok(FilteredFields {
        objective: filter.apply(&raw.objective)?,
        modulus: filter.apply(&raw.modulus)?,
    })
}

pub fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |m, &x| m.max(x.abs()))
}

// ─────────────────────────────────────────────────────────────
//  Momentum
// ─────────────────────────────────────────────────────────────

/// Exponential moving average of the normalised filtered objective,
/// renormalised to unit max-magnitude after every update.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentumField {
    weight: f64,
    values: Vec<f64>,
}

impl MomentumField {
    /// Zero field; `weight` is the share kept from history.
    pub fn new(n: usize, weight: f64) -> Self {
        Self { weight, values: vec![0.0; n] }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// `m ← w·m + (1 − w)·f/max|f|`, then `m ← m/max|m|`.
    pub fn update(&mut self, filtered: &[f64]) -> TopoptResult<()> {
        if filtered.len() != self.values.len() {
            return Err(TopoptError::Shape(format!(
                "momentum of length {} updated with field of length {}",
                self.values.len(),
                filtered.len()
            )));
        }
        let fmax = max_abs(filtered);
        let scale = if fmax > 0.0 { (1.0 - self.weight) / fmax } else { 0.0 };
        for (m, &f) in self.values.iter_mut().zip(filtered) {
            *m = self.weight * *m + scale * f;
        }
        let mmax = max_abs(&self.values);
        if mmax > 0.0 {
            self.values.iter_mut().for_each(|m| *m /= mmax);
        }
        Ok(())
    }
}
