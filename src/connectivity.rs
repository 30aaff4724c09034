//! Face adjacency over the periodic mesh and island detection.
//!
//! The neighbour table is built once per mesh: face neighbours (elements
//! sharing exactly two nodes) are found for the representative copy of every
//! design element, with the ghost strips supplying the wrap-around faces,
//! and each hit is folded back to its design index.
//!
//! Island pruning seeds a flood fill from the first design row and then the
//! first design column, in index order. The first grown region holding more
//! than half of the material is the continent. When several large regions sit
//! near that threshold, the scan order alone decides which one wins.

use crate::types::{PeriodicMesh, TopoptError, TopoptResult, FACE_NEIGHBOURS};

/// Design element → up to four folded face neighbours.
pub type NeighbourTable = Vec<[Option<usize>; FACE_NEIGHBOURS]>;

/// Budget for a partial island removal.
#[derive(Debug, Clone, Copy)]
pub struct IslandBudget<'a> {
    /// Maximal number of island elements removed in one pass.
    pub max_removals: usize,
    /// Field ranking island elements; smallest |value| goes first.
    pub ranking: &'a [f64],
}

// ─────────────────────────────────────────────────────────────
//  Neighbour table construction
// ─────────────────────────────────────────────────────────────

fn shared_nodes(a: &[usize; 4], b: &[usize; 4]) -> usize {
    a.iter().filter(|n| b.contains(n)).count()
}

/// Build the folded neighbour table of a mesh.
pub fn build_neighbour_table(mesh: &PeriodicMesh) -> TopoptResult<NeighbourTable> {
    let owner = mesh.design_owner()?;
    let conn = &mesh.connectivity;
    let num_nodes = conn.iter().flat_map(|nodes| nodes.iter()).max().map_or(0, |&m| m + 1);

    // node → incident extended elements
    let mut incident: Vec<Vec<usize>> = vec![Vec::new(); num_nodes];
    for (e, nodes) in conn.iter().enumerate() {
        for &nd in nodes {
            incident[nd].push(e);
        }
    }

    let mut table = Vec::with_capacity(mesh.num_design());
    for (e, copies) in mesh.symmetry.iter().enumerate() {
        let rep = copies[0];
        let mut found: Vec<usize> = Vec::with_capacity(FACE_NEIGHBOURS);
        for &nd in &conn[rep] {
            for &other in &incident[nd] {
                if other != rep && !found.contains(&other) && shared_nodes(&conn[rep], &conn[other]) == 2 {
                    found.push(other);
                }
            }
        }
        if found.len() > FACE_NEIGHBOURS {
            return Err(TopoptError::Mesh(format!(
                "design element {e} (element {rep}) has {} face neighbours",
                found.len()
            )));
        }
        let mut row = [None; FACE_NEIGHBOURS];
        for (slot, &other) in row.iter_mut().zip(&found) {
            *slot = Some(owner[other]);
        }
        table.push(row);
    }
    Ok(table)
}

// ─────────────────────────────────────────────────────────────
//  Analyzer
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectivityAnalyzer {
    grid_side: usize,
    neighbours: NeighbourTable,
    seeds: Vec<usize>,
}

impl ConnectivityAnalyzer {
    pub fn new(mesh: &PeriodicMesh) -> TopoptResult<Self> {
        mesh.validate()?;
        let table = build_neighbour_table(mesh)?;
        Self::from_table(mesh.grid_side, table)
    }

    /// Wrap an existing (e.g. cached) neighbour table.
    pub fn from_table(grid_side: usize, neighbours: NeighbourTable) -> TopoptResult<Self> {
        let n = neighbours.len();
        if n == 0 {
            return Err(TopoptError::Config("neighbour table is empty".into()));
        }
        if grid_side * grid_side != n {
            return Err(TopoptError::Mesh(format!(
                "design grid side {grid_side} does not match {n} design elements"
            )));
        }
        if let Some(bad) = neighbours.iter().flatten().flatten().find(|&&j| j >= n) {
            return Err(TopoptError::Mesh(format!("neighbour index {bad} outside {n} design elements")));
        }
        let seeds = boundary_seeds(grid_side);
        if let Some(&lonely) = seeds.iter().find(|&&s| neighbours[s].iter().all(Option::is_none)) {
            return Err(TopoptError::Mesh(format!("boundary seed {lonely} has no face neighbour")));
        }
        Ok(Self { grid_side, neighbours, seeds })
    }

    pub fn grid_side(&self) -> usize {
        self.grid_side
    }

    pub fn num_design(&self) -> usize {
        self.neighbours.len()
    }

    pub fn neighbours(&self) -> &NeighbourTable {
        &self.neighbours
    }

    /// Scan order: first row, then first column below it.
    pub fn seeds(&self) -> &[usize] {
        &self.seeds
    }

    fn check(&self, topology: &[bool]) -> TopoptResult<()> {
        if topology.len() != self.num_design() {
            return Err(TopoptError::Shape(format!(
                "topology of length {} for {} design elements",
                topology.len(),
                self.num_design()
            )));
        }
        Ok(())
    }

    /// Mark every material element reachable from `seed` through material
    /// faces; returns the number of newly marked elements.
    ///
    /// A void or already marked seed marks nothing.
    pub fn flood_fill(&self, topology: &[bool], seed: usize, region: &mut [bool]) -> TopoptResult<usize> {
        self.check(topology)?;
        if region.len() != topology.len() {
            return Err(TopoptError::Shape(format!(
                "region of length {} for {} design elements",
                region.len(),
                topology.len()
            )));
        }
        if seed >= topology.len() {
            return Err(TopoptError::Shape(format!("seed {seed} out of range for {} design elements", topology.len())));
        }
        if !topology[seed] || region[seed] {
            return Ok(0);
        }
        Ok(self.fill(topology, seed, region))
    }

    fn fill(&self, topology: &[bool], seed: usize, region: &mut [bool]) -> usize {
        let mut stack = vec![seed];
        region[seed] = true;
        let mut count = 1;
        while let Some(e) = stack.pop() {
            for &nb in self.neighbours[e].iter().flatten() {
                if topology[nb] && !region[nb] {
                    region[nb] = true;
                    count += 1;
                    stack.push(nb);
                }
            }
        }
        count
    }

    /// The dominant connected material region, if one holds more than half
    /// of the material.
    pub fn find_continent(&self, topology: &[bool]) -> TopoptResult<Option<Vec<bool>>> {
        self.check(topology)?;
        let material = topology.iter().filter(|&&m| m).count();
        let mut region = vec![false; topology.len()];
        let mut region_size = 0;
        for &seed in &self.seeds {
            if topology[seed] && !region[seed] {
                region.fill(false);
                region_size = self.fill(topology, seed, &mut region);
            }
            if 2 * region_size > material {
                return Ok(Some(region));
            }
        }
        Ok(None)
    }

    /// Material elements outside the continent (empty without a continent).
    pub fn islands(&self, topology: &[bool]) -> TopoptResult<Vec<usize>> {
        Ok(match self.find_continent(topology)? {
            Some(continent) => (0..topology.len()).filter(|&e| topology[e] && !continent[e]).collect(),
            None => Vec::new(),
        })
    }

    /// Void island elements in place and return the removed indices.
    ///
    /// With a budget smaller than the island count only the least sensitive
    /// islands are removed.
    pub fn prune_islands(&self, topology: &mut [bool], budget: Option<IslandBudget<'_>>) -> TopoptResult<Vec<usize>> {
        let mut islands = self.islands(topology)?;
        if let Some(b) = budget {
            if b.ranking.len() != topology.len() {
                return Err(TopoptError::Shape(format!(
                    "island ranking of length {} for {} design elements",
                    b.ranking.len(),
                    topology.len()
                )));
            }
            if islands.len() > b.max_removals {
                islands.sort_by(|&a, &c| b.ranking[a].abs().total_cmp(&b.ranking[c].abs()));
                islands.truncate(b.max_removals);
                islands.sort_unstable();
            }
        }
        for &e in &islands {
            topology[e] = false;
        }
        Ok(islands)
    }

    /// True when all material forms a single face-connected region.
    pub fn is_fully_connected(&self, topology: &[bool]) -> TopoptResult<bool> {
        self.check(topology)?;
        let material = topology.iter().filter(|&&m| m).count();
        let Some(start) = topology.iter().position(|&m| m) else {
            return Ok(true);
        };
        let mut region = vec![false; topology.len()];
        Ok(self.fill(topology, start, &mut region) == material)
    }
}

/// Row 0 (`0..Ns`) followed by column 0 (`Ns, 2Ns, …`).
pub fn boundary_seeds(grid_side: usize) -> Vec<usize> {
    let n = grid_side * grid_side;
    (0..grid_side).chain((grid_side..n).step_by(grid_side.max(1))).collect()
}
