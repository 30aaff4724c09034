//! On-disk cache of the mesh-derived operators.
//!
//! Building `Sf`, `Mf` and the neighbour table costs a full distance search
//! over the extended mesh; for a fixed mesh and fixed radii the result never
//! changes, so it is stored as JSON next to the dataset and reused.

use crate::connectivity::{build_neighbour_table, ConnectivityAnalyzer, NeighbourTable};
use crate::filters::{FilterBuilder, FilterSet, FilterTriplets, SparseFilter};
use crate::types::{OptimizerSettings, PeriodicMesh, TopoptResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCache {
    pub num_design: usize,
    pub grid_side: usize,
    pub sensitivity_radius: f64,
    pub morphology_radius: f64,
    pub sensitivity: FilterTriplets,
    pub morphology: FilterTriplets,
    pub neighbours: NeighbourTable,
}

impl FilterCache {
    pub fn build(mesh: &PeriodicMesh, sensitivity_radius: f64, morphology_radius: f64) -> TopoptResult<Self> {
        let builder = FilterBuilder::new(mesh)?;
        let set = builder.build_set(sensitivity_radius, morphology_radius)?;
        let neighbours = build_neighbour_table(mesh)?;
        Ok(Self {
            num_design: mesh.num_design(),
            grid_side: mesh.grid_side,
            sensitivity_radius,
            morphology_radius,
            sensitivity: set.sensitivity.to_triplets(),
            morphology: set.morphology.to_triplets(),
            neighbours,
        })
    }

    /// Built for this mesh size and exactly these radii.
    pub fn matches(&self, mesh: &PeriodicMesh, sensitivity_radius: f64, morphology_radius: f64) -> bool {
        self.num_design == mesh.num_design()
            && self.grid_side == mesh.grid_side
            && self.sensitivity_radius == sensitivity_radius
            && self.morphology_radius == morphology_radius
    }

    pub fn read(path: &Path) -> TopoptResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn write(&self, path: &Path) -> TopoptResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn into_parts(self) -> TopoptResult<(FilterSet, ConnectivityAnalyzer)> {
        let filters = FilterSet {
            sensitivity: SparseFilter::from_triplets(&self.sensitivity)?,
            morphology: SparseFilter::from_triplets(&self.morphology)?,
        };
        let analyzer = ConnectivityAnalyzer::from_table(self.grid_side, self.neighbours)?;
        Ok((filters, analyzer))
    }
}

/// Reuse the cache at `path` when it fits `mesh` and the radii in
/// `settings`; otherwise rebuild and overwrite it.
pub fn load_or_build(
    path: &Path,
    mesh: &PeriodicMesh,
    settings: &OptimizerSettings,
) -> TopoptResult<(FilterSet, ConnectivityAnalyzer)> {
    let (rs, rm) = (settings.sensitivity_radius, settings.morphology_radius);
    if path.exists() {
        match FilterCache::read(path) {
            Ok(cache) if cache.matches(mesh, rs, rm) => {
                debug!(path = %path.display(), "filter cache hit");
                return cache.into_parts();
            }
            Ok(cache) => info!(
                path = %path.display(),
                cached_n = cache.num_design,
                cached_rsen = cache.sensitivity_radius,
                cached_rmor = cache.morphology_radius,
                "filter cache stale, rebuilding"
            ),
            Err(err) => warn!(path = %path.display(), %err, "unreadable filter cache, rebuilding"),
        }
    }

    let cache = FilterCache::build(mesh, rs, rm)?;
    cache.write(path)?;
    info!(path = %path.display(), n = cache.num_design, "filter cache written");
    cache.into_parts()
}
