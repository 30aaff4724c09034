//! Radius-based sparse filters over the design elements.
//!
//! Both operators search every extended-mesh element (physical copies plus
//! periodic ghosts) around the representative copy of a design element, then
//! fold the hits back onto design indices through the spreading operator
//! `Q` (extended element → owning design element):
//!
//!   Sf = S_ext · Q    weights (r − d), rows normalised to 1
//!   Mf = M_ext · Q    weights 1, used as a dilation / erosion stencil

use crate::types::{PeriodicMesh, TopoptError, TopoptResult};
use sprs::{CsMat, CsVecView, TriMat};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
//  Sparse filter wrapper
// ─────────────────────────────────────────────────────────────

/// Square N × N operator stored as CSR.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseFilter {
    matrix: CsMat<f64>,
}

impl SparseFilter {
    pub fn new(matrix: CsMat<f64>) -> TopoptResult<Self> {
        if matrix.rows() != matrix.cols() {
            return Err(TopoptError::Shape(format!(
                "filter must be square, got {} × {}",
                matrix.rows(),
                matrix.cols()
            )));
        }
        let matrix = if matrix.is_csr() { matrix } else { matrix.to_csr() };
        Ok(Self { matrix })
    }

    pub fn dim(&self) -> usize {
        self.matrix.rows()
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    pub fn matrix(&self) -> &CsMat<f64> {
        &self.matrix
    }

    /// Row `e` as a sparse vector over design indices.
    pub fn row(&self, e: usize) -> Option<CsVecView<'_, f64>> {
        self.matrix.outer_view(e)
    }

    /// `out = F · v`
    pub fn apply(&self, v: &[f64]) -> TopoptResult<Vec<f64>> {
        let n = self.dim();
        if v.len() != n {
            return Err(TopoptError::Shape(format!("filter of size {n} applied to vector of length {}", v.len())));
        }
        let mut out = vec![0.0; n];
        for (e, row) in self.matrix.outer_iterator().enumerate() {
            out[e] = row.iter().map(|(j, &w)| w * v[j]).sum();
        }
        Ok(out)
    }

    /// Flatten into COO triplets (row-major order).
    pub fn to_triplets(&self) -> FilterTriplets {
        let mut t = FilterTriplets { dim: self.dim(), rows: Vec::new(), cols: Vec::new(), data: Vec::new() };
        for (e, row) in self.matrix.outer_iterator().enumerate() {
            for (j, &w) in row.iter() {
                t.rows.push(e);
                t.cols.push(j);
                t.data.push(w);
            }
        }
        t
    }

    pub fn from_triplets(t: &FilterTriplets) -> TopoptResult<Self> {
        if t.rows.len() != t.data.len() || t.cols.len() != t.data.len() {
            return Err(TopoptError::Shape(format!(
                "triplet arrays of unequal length ({}, {}, {})",
                t.rows.len(),
                t.cols.len(),
                t.data.len()
            )));
        }
        if let Some(&bad) = t.rows.iter().chain(&t.cols).find(|&&i| i >= t.dim) {
            return Err(TopoptError::Shape(format!("triplet index {bad} outside dimension {}", t.dim)));
        }
        let mut tri = TriMat::new((t.dim, t.dim));
        for ((&r, &c), &w) in t.rows.iter().zip(&t.cols).zip(&t.data) {
            tri.add_triplet(r, c, w);
        }
        Self::new(tri.to_csr())
    }
}

/// COO form of a filter, the on-disk representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTriplets {
    pub dim: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub data: Vec<f64>,
}

/// The two operators used by the optimization loop.
#[derive(Debug, Clone)]
pub struct FilterSet {
    pub sensitivity: SparseFilter,
    pub morphology: SparseFilter,
}

// ─────────────────────────────────────────────────────────────
//  Builder
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Weighting {
    /// (r − d), row-normalised.
    Cone,
    /// 1 for every hit.
    Indicator,
}

/// Builds filters for one mesh; holds the spreading operator `Q`.
#[derive(Debug)]
pub struct FilterBuilder<'a> {
    mesh: &'a PeriodicMesh,
    spreading: CsMat<f64>,
}

impl<'a> FilterBuilder<'a> {
    pub fn new(mesh: &'a PeriodicMesh) -> TopoptResult<Self> {
        mesh.validate()?;
        let owner = mesh.design_owner()?;
        let spreading = spreading_operator(&owner, mesh.num_design());
        Ok(Self { mesh, spreading })
    }

    /// `Q` (N_ext × N): `Q[c, owner(c)] = 1`.
    pub fn spreading(&self) -> &CsMat<f64> {
        &self.spreading
    }

    /// Weighted-average smoothing operator `Sf`.
    pub fn sensitivity_filter(&self, radius: f64) -> TopoptResult<SparseFilter> {
        self.build(radius, Weighting::Cone)
    }

    /// Unweighted neighbourhood operator `Mf`.
    pub fn morphology_filter(&self, radius: f64) -> TopoptResult<SparseFilter> {
        self.build(radius, Weighting::Indicator)
    }

    pub fn build_set(&self, sensitivity_radius: f64, morphology_radius: f64) -> TopoptResult<FilterSet> {
        Ok(FilterSet {
            sensitivity: self.sensitivity_filter(sensitivity_radius)?,
            morphology: self.morphology_filter(morphology_radius)?,
        })
    }

    fn build(&self, radius: f64, weighting: Weighting) -> TopoptResult<SparseFilter> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(TopoptError::Config(format!("filter radius must be positive, got {radius}")));
        }
        let n = self.mesh.num_design();
        let n_ext = self.mesh.num_extended();
        let centroids = &self.mesh.centroids;
        let r2 = radius * radius;

        let mut tri = TriMat::new((n, n_ext));
        let mut hits: Vec<(usize, f64)> = Vec::new();
        for (e, copies) in self.mesh.symmetry.iter().enumerate() {
            let p = centroids[copies[0]];
            hits.clear();
            for (c, q) in centroids.iter().enumerate() {
                let dx = q[0] - p[0];
                let dy = q[1] - p[1];
                let d2 = dx * dx + dy * dy;
                if d2 <= r2 {
                    hits.push((c, d2.sqrt()));
                }
            }
            match weighting {
                Weighting::Cone => {
                    let total: f64 = hits.iter().map(|&(_, d)| radius - d).sum();
                    // The representative itself sits at d = 0, so total ≥ radius > 0.
                    for &(c, d) in &hits {
                        tri.add_triplet(e, c, (radius - d) / total);
                    }
                }
                Weighting::Indicator => {
                    for &(c, _) in &hits {
                        tri.add_triplet(e, c, 1.0);
                    }
                }
            }
        }

        let s_ext: CsMat<f64> = tri.to_csr();
        let folded = &s_ext * &self.spreading;
        SparseFilter::new(folded)
    }
}

/// Build `Q` from the extended → design owner table.
pub fn spreading_operator(owner: &[usize], num_design: usize) -> CsMat<f64> {
    let mut tri = TriMat::new((owner.len(), num_design));
    for (c, &e) in owner.iter().enumerate() {
        tri.add_triplet(c, e, 1.0);
    }
    tri.to_csr()
}
