//! Region scheduling for parallelizable task batches.
//!
//! One class of worker describes its tasks as points in a low-dimensional
//! space. The engine partitions them, 4-colors the region adjacency graph
//! and dispatches each color class as one conflict-free parallel batch. If
//! no coloring exists (possible above two dimensions) the regions are run
//! serially instead.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cohort_core::error::{OrchestratorError, Result};
use cohort_geometric::{
    color_classes, GeometricError, Point, RegionColorer, RegionId, SpatialPartitioner,
};

/// How a set of regions should be dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegionSchedule {
    /// Batches of mutually non-conflicting regions; batches run in order,
    /// regions within a batch run in parallel.
    Parallel(Vec<Vec<RegionId>>),
    /// No valid coloring; run every region one at a time.
    Serial(Vec<RegionId>),
}

impl RegionSchedule {
    /// Number of dispatch rounds.
    pub fn rounds(&self) -> usize {
        match self {
            RegionSchedule::Parallel(batches) => batches.len(),
            RegionSchedule::Serial(regions) => regions.len(),
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, RegionSchedule::Parallel(_))
    }
}

/// Partition `points` and produce a conflict-free dispatch schedule.
pub fn plan_region_batches(
    points: Vec<Point>,
    dimensions: usize,
    max_depth: usize,
) -> Result<RegionSchedule> {
    let mut partitioner = SpatialPartitioner::new(dimensions, max_depth)
        .map_err(|e| OrchestratorError::InvalidDefinition(e.to_string()))?;
    for point in points {
        partitioner
            .add_point(point)
            .map_err(|e| OrchestratorError::InvalidDefinition(e.to_string()))?;
    }
    partitioner
        .build()
        .map_err(|e| OrchestratorError::InvalidDefinition(e.to_string()))?;

    let mut colorer = RegionColorer::new();
    colorer.set_regions(partitioner.regions());
    colorer.determine_adjacency();

    match colorer.assign_colors() {
        Ok(colored) => {
            if !colorer.verify(&colored) {
                return Err(OrchestratorError::InternalInvariant(
                    "region coloring failed verification".into(),
                ));
            }
            let batches: Vec<Vec<RegionId>> = color_classes(&colored)
                .into_iter()
                .filter(|class| !class.is_empty())
                .collect();
            debug!(
                regions = colored.len(),
                batches = batches.len(),
                "parallel region schedule planned"
            );
            Ok(RegionSchedule::Parallel(batches))
        }
        Err(GeometricError::Uncolorable) => {
            warn!("region graph not 4-colorable; falling back to serial execution");
            let regions = partitioner
                .regions()
                .iter()
                .map(|r| r.id.clone())
                .collect();
            Ok(RegionSchedule::Serial(regions))
        }
        Err(other) => Err(OrchestratorError::InvalidDefinition(other.to_string())),
    }
}
