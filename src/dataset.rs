//! Batch execution over many design targets and the on-disk run records.
//!
//! Runs are independent: every task clones the baseline physical model and
//! borrows the shared filters, analyzer, kernel and flip solver. Results come
//! back in input order regardless of scheduling.
//!
//! Topologies are stored bit-packed, most significant bit first, eight
//! elements per byte with the tail padded by zeros.

use crate::ilp::FlipSolver;
use crate::optimizer::Optimizer;
use crate::physics::{Baseline, PhysicalModel, SensitivityKernel};
use crate::types::{
    DesignTarget, IterationRecord, OptimizationResult, RunStatus, SensitivityMethod, StageTimings, TensorSensitivity,
    TopoptError, TopoptResult,
};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Runs grouped into one dataset file.
pub const DEFAULT_RUNS_PER_FILE: usize = 7;

// ─────────────────────────────────────────────────────────────
//  Bit packing
// ─────────────────────────────────────────────────────────────

pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| chunk.iter().enumerate().fold(0u8, |byte, (i, &b)| if b { byte | (0x80 >> i) } else { byte }))
        .collect()
}

/// Inverse of [`pack_bits`] for the first `len` bits.
pub fn unpack_bits(bytes: &[u8], len: usize) -> TopoptResult<Vec<bool>> {
    if bytes.len() * 8 < len {
        return Err(TopoptError::Shape(format!("{} packed bytes cannot hold {len} bits", bytes.len())));
    }
    Ok((0..len).map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0).collect())
}

// ─────────────────────────────────────────────────────────────
//  Records
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub iteration: usize,
    pub topology: Vec<u8>,
    pub poisson_ratio: f64,
    pub youngs_modulus: f64,
    pub volume: f64,
    pub flips: usize,
    pub changed: usize,
    pub rolled_back: bool,
    pub eroded: bool,
    pub accepted: bool,
    pub improved: bool,
    pub displacements: Option<Array2<f64>>,
    pub sensitivities: Vec<(SensitivityMethod, TensorSensitivity)>,
}

impl From<&IterationRecord> for HistoryRecord {
    fn from(r: &IterationRecord) -> Self {
        Self {
            iteration: r.iteration,
            topology: pack_bits(&r.topology),
            poisson_ratio: r.poisson_ratio,
            youngs_modulus: r.youngs_modulus,
            volume: r.volume,
            flips: r.flips,
            changed: r.changed,
            rolled_back: r.rolled_back,
            eroded: r.eroded,
            accepted: r.accepted,
            improved: r.improved,
            displacements: r.displacements.clone(),
            sensitivities: r.sensitivities.clone(),
        }
    }
}

/// One optimisation run as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub input_id: usize,
    pub target: DesignTarget,
    pub num_design: usize,
    pub topology: Vec<u8>,
    pub poisson_ratio: f64,
    pub youngs_modulus: f64,
    pub volume: f64,
    pub status: RunStatus,
    pub iterations: usize,
    pub history: Vec<HistoryRecord>,
    pub timings: StageTimings,
}

impl RunRecord {
    pub fn from_result(input_id: usize, result: &OptimizationResult) -> Self {
        Self {
            input_id,
            target: result.target,
            num_design: result.topology.len(),
            topology: pack_bits(&result.topology),
            poisson_ratio: result.poisson_ratio,
            youngs_modulus: result.youngs_modulus,
            volume: result.volume,
            status: result.status,
            iterations: result.iterations,
            history: result.history.iter().map(HistoryRecord::from).collect(),
            timings: result.timings.clone(),
        }
    }

    pub fn topology(&self) -> TopoptResult<Vec<bool>> {
        unpack_bits(&self.topology, self.num_design)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetFile {
    pub file_id: usize,
    pub runs: Vec<RunRecord>,
}

// ─────────────────────────────────────────────────────────────
//  Batch execution
// ─────────────────────────────────────────────────────────────

/// Optimise every target in parallel. Entry `i` belongs to `targets[i]`; a
/// failed run does not stop the others.
pub fn run_batch<P, K, S>(
    optimizer: &Optimizer<'_, K, S>,
    baseline: &Baseline<P>,
    targets: &[DesignTarget],
) -> Vec<TopoptResult<OptimizationResult>>
where
    P: PhysicalModel + Send + Sync,
    K: SensitivityKernel<P> + Sync + ?Sized,
    S: FlipSolver + Sync + ?Sized,
{
    info!(runs = targets.len(), threads = rayon::current_num_threads(), "batch started");
    targets
        .par_iter()
        .enumerate()
        .map(|(i, &target)| {
            let result = optimizer.optimize(baseline, target);
            match &result {
                Ok(r) => info!(
                    input = i,
                    nu_target = target.poisson_ratio,
                    ey_min = target.min_modulus,
                    nu_opt = r.poisson_ratio,
                    ey_opt = r.youngs_modulus,
                    iterations = r.iterations,
                    seconds = r.timings.total,
                    "run complete"
                ),
                Err(err) => warn!(input = i, %err, "run failed"),
            }
            result
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  Persistence
// ─────────────────────────────────────────────────────────────

pub fn dataset_file_name(file_id: usize) -> String {
    format!("file_{file_id:04}.json")
}

/// Write `results` as consecutive input ids starting at `first_input_id`,
/// `runs_per_file` runs per file. Returns the written paths in order.
pub fn write_dataset(
    dir: &Path,
    first_input_id: usize,
    results: &[OptimizationResult],
    runs_per_file: usize,
) -> TopoptResult<Vec<PathBuf>> {
    if runs_per_file == 0 {
        return Err(TopoptError::Config("runs_per_file must be at least 1".into()));
    }
    fs::create_dir_all(dir)?;

    let mut paths = Vec::with_capacity(results.len().div_ceil(runs_per_file));
    for (chunk_idx, chunk) in results.chunks(runs_per_file).enumerate() {
        let first = first_input_id + chunk_idx * runs_per_file;
        let file = DatasetFile {
            file_id: first / runs_per_file,
            runs: chunk
                .iter()
                .enumerate()
                .map(|(j, r)| RunRecord::from_result(first + j, r))
                .collect(),
        };
        let path = dir.join(dataset_file_name(file.file_id));
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;
        info!(path = %path.display(), runs = file.runs.len(), "dataset file written");
        paths.push(path);
    }
    Ok(paths)
}

pub fn read_dataset_file(path: &Path) -> TopoptResult<DatasetFile> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
