//! **basecell-silp**: discrete topology update engine for periodic
//! metamaterial base cells.
//!
//! Drives a binary material layout towards a target homogenized Poisson's
//! ratio while keeping the homogenized Young's modulus above a floor:
//!
//! 1. **Filters** (`filters`, `cache`): radius-based sensitivity and
//!    morphology operators folded through the periodic symmetry map.
//! 2. **Morphology** (`morphology`): erosion, dilation, open.
//! 3. **Connectivity** (`connectivity`): face adjacency over the periodic
//!    mesh, continent detection, island pruning.
//! 4. **Homogenization / sensitivities** (`homogenization`, `sensitivity`):
//!    derived properties, adaptive targets, filtered fields, momentum.
//! 5. **Collaborators** (`physics`, `ilp`): finite-element state, sensitivity
//!    kernel and discrete sub-solver contracts.
//! 6. **Optimiser** (`optimizer`): the SILP / BESO loop.
//! 7. **Dataset** (`dataset`): parallel batches and run records.

pub mod types;
pub mod filters;
pub mod cache;
pub mod morphology;
pub mod connectivity;
pub mod homogenization;
pub mod sensitivity;
pub mod physics;
pub mod ilp;
pub mod optimizer;
pub mod dataset;
