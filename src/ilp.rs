//! Contract of the discrete sub-solver that picks element flips.
//!
//! Coefficients are linearised changes with respect to the design variable:
//! flipping element `i` from `x_i` to `y_i` changes the objective by about
//! `c_i · (y_i − x_i)`.

use crate::types::{TopoptError, TopoptResult};

/// Direction of the linearised stiffness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintSense {
    /// `Σ a_i (y_i − x_i) ≥ slack − margin`
    GreaterEqual,
    /// `Σ a_i (y_i − x_i) ≤ slack − margin`
    LessEqual,
}

pub trait FlipSolver {
    /// Minimise `Σ c_i (y_i − x_i)` subject to the linearised constraint
    /// `Σ a_i (y_i − x_i)` against `slack − margin` in direction `sense`,
    /// changing at most `budget` entries.
    #[allow(clippy::too_many_arguments)]
    fn solve_constrained(
        &self,
        states: &[bool],
        objective: &[f64],
        constraint: &[f64],
        margin: f64,
        slack: f64,
        budget: usize,
        sense: ConstraintSense,
    ) -> TopoptResult<Vec<bool>>;

    /// Budgeted rank-and-flip (BESO): every element whose flip lowers the
    /// linearised objective is a candidate; the `budget` strongest flip.
    fn solve_unconstrained(&self, states: &[bool], objective: &[f64], budget: usize) -> TopoptResult<Vec<bool>> {
        beso_flip(states, objective, budget)
    }
}

/// Rank-and-flip without constraint handling.
pub fn beso_flip(states: &[bool], objective: &[f64], budget: usize) -> TopoptResult<Vec<bool>> {
    if states.len() != objective.len() {
        return Err(TopoptError::Shape(format!(
            "{} states with {} objective coefficients",
            states.len(),
            objective.len()
        )));
    }
    let mut candidates: Vec<usize> = (0..states.len())
        .filter(|&i| if states[i] { objective[i] > 0.0 } else { objective[i] < 0.0 })
        .collect();
    candidates.sort_by(|&a, &b| objective[b].abs().total_cmp(&objective[a].abs()));

    let mut out = states.to_vec();
    for &i in candidates.iter().take(budget) {
        out[i] = !out[i];
    }
    Ok(out)
}

/// Check a sub-solver answer against its contract.
pub fn check_assignment(states: &[bool], answer: &[bool], budget: usize) -> TopoptResult<usize> {
    if answer.len() != states.len() {
        return Err(TopoptError::Shape(format!(
            "flip solver returned {} states for {} eligible elements",
            answer.len(),
            states.len()
        )));
    }
    let flips = states.iter().zip(answer).filter(|(a, b)| a != b).count();
    if flips > budget {
        return Err(TopoptError::FlipSolver(format!("{flips} flips exceed the budget of {budget}")));
    }
    Ok(flips)
}
