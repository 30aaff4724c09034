//! Binary morphology over the `Mf` stencil.
//!
//! Every operator reads its input topology and writes a fresh one, so the
//! order in which rows are visited never matters.

use crate::filters::SparseFilter;
use crate::types::{TopoptError, TopoptResult};

fn check(filter: &SparseFilter, topology: &[bool]) -> TopoptResult<()> {
    if filter.dim() != topology.len() {
        return Err(TopoptError::Shape(format!(
            "morphology stencil of size {} applied to topology of length {}",
            filter.dim(),
            topology.len()
        )));
    }
    Ok(())
}

/// Spread `value` from every element currently equal to `value` over its
/// stencil row.
fn spread(filter: &SparseFilter, topology: &[bool], value: bool) -> Vec<bool> {
    let mut out = topology.to_vec();
    for (e, &state) in topology.iter().enumerate() {
        if state != value {
            continue;
        }
        if let Some(row) = filter.row(e) {
            for (j, _) in row.iter() {
                out[j] = value;
            }
        }
    }
    out
}

/// Any void element voids its whole neighbourhood.
pub fn erode(filter: &SparseFilter, topology: &[bool]) -> TopoptResult<Vec<bool>> {
    check(filter, topology)?;
    Ok(spread(filter, topology, false))
}

/// Any material element fills its whole neighbourhood.
pub fn dilate(filter: &SparseFilter, topology: &[bool]) -> TopoptResult<Vec<bool>> {
    check(filter, topology)?;
    Ok(spread(filter, topology, true))
}

/// Erosion followed by dilation; strips features thinner than the stencil.
pub fn open(filter: &SparseFilter, topology: &[bool]) -> TopoptResult<Vec<bool>> {
    let eroded = erode(filter, topology)?;
    dilate(filter, &eroded)
}

/// Dilation followed by erosion; fills holes smaller than the stencil.
pub fn close(filter: &SparseFilter, topology: &[bool]) -> TopoptResult<Vec<bool>> {
    let dilated = dilate(filter, topology)?;
    erode(filter, &dilated)
}
