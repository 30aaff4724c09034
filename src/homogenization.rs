//! Effective properties of the base cell and the adaptive SILP targets.
//!
//! With the homogenized tensor `Ch` (3 × 3, Voigt order xx, yy, xy):
//!
//!   gamma  = C22 / C00
//!   nu_hat = 1 − 2 · C22 / C00
//!   Ey_hat = 4 · C22 · (C00 − C22) / C00

use crate::types::{volume_fraction, DesignTarget, OptimizerSettings, TopoptError, TopoptResult};
use ndarray::Array2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomogenizedProperties {
    pub c00: f64,
    pub c22: f64,
    pub gamma: f64,
    pub poisson_ratio: f64,
    pub youngs_modulus: f64,
    pub volume: f64,
}

impl HomogenizedProperties {
    pub fn from_tensor(ch: &Array2<f64>, topology: &[bool]) -> TopoptResult<Self> {
        if ch.shape() != [3, 3] {
            return Err(TopoptError::Shape(format!("homogenized tensor has shape {:?}", ch.shape())));
        }
        let c00 = ch[[0, 0]];
        let c22 = ch[[2, 2]];
        if !(c00.is_finite() && c22.is_finite()) || c00 == 0.0 {
            return Err(TopoptError::Physics(format!("degenerate homogenized tensor (C00 = {c00}, C22 = {c22})")));
        }
        let gamma = c22 / c00;
        Ok(Self {
            c00,
            c22,
            gamma,
            poisson_ratio: 1.0 - 2.0 * gamma,
            youngs_modulus: 4.0 * c22 * (c00 - c22) / c00,
            volume: volume_fraction(topology),
        })
    }
}

/// Poisson's ratio goal for this iteration, `nuval + eta_nu`, limiting the
/// requested shift to `nuvar`.
pub fn poisson_goal(nu_hat: f64, nu_target: f64, nu_var: f64) -> f64 {
    let eta = if nu_hat > nu_target {
        (nu_hat - nu_target - nu_var).max(0.0)
    } else {
        (nu_hat - nu_target + nu_var).min(0.0)
    };
    nu_target + eta
}

/// Properties plus every derived quantity the loop needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub properties: HomogenizedProperties,
    /// `nu_g`
    pub poisson_goal: f64,
    /// `(nu_hat − nu_g)² + beta · vol`
    pub objective: f64,
    /// `fEy = Ey_hat − Eymin`
    pub modulus_margin: f64,
    /// `eta_Ey = max(fEy − Eyvar, 0)`
    pub modulus_slack: f64,
}

impl Evaluation {
    pub fn new(properties: HomogenizedProperties, target: &DesignTarget, settings: &OptimizerSettings) -> Self {
        let nu_g = poisson_goal(properties.poisson_ratio, target.poisson_ratio, settings.poisson_variation);
        let margin = properties.youngs_modulus - target.min_modulus;
        Self {
            properties,
            poisson_goal: nu_g,
            objective: (properties.poisson_ratio - nu_g).powi(2) + settings.volume_penalty * properties.volume,
            modulus_margin: margin,
            modulus_slack: (margin - settings.modulus_variation).max(0.0),
        }
    }

    pub fn poisson_error(&self, target: &DesignTarget) -> f64 {
        (self.properties.poisson_ratio - target.poisson_ratio).abs()
    }

    /// The stiffness floor is treated as inactive.
    pub fn floor_inactive(&self, target: &DesignTarget, tol: f64) -> bool {
        target.min_modulus + self.modulus_slack < tol
    }
}
