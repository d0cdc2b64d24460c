//! # cohort-geometric
//!
//! Spatial partitioning for parallelizable task dispatch.
//!
//! Tasks are modelled as points in a low-dimensional space. A
//! [`SpatialPartitioner`] splits them into axis-aligned regions with a k-d
//! tree; a [`RegionColorer`] then builds the region adjacency graph and
//! assigns one of four colors so that no two touching regions share one.
//! Same-colored regions never conflict, so each color class can run as one
//! parallel batch.
//!
//! ## Quick Start
//!
//! ```rust
//! use cohort_geometric::{Point, RegionColorer, SpatialPartitioner};
//!
//! # fn main() -> Result<(), cohort_geometric::GeometricError> {
//! let mut partitioner = SpatialPartitioner::new(2, 4)?;
//! for (i, (x, y)) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)].iter().enumerate() {
//!     partitioner.add_point(Point::new(format!("task-{i}"), vec![*x, *y]))?;
//! }
//! partitioner.build()?;
//!
//! let mut colorer = RegionColorer::new();
//! colorer.set_regions(partitioner.regions());
//! colorer.determine_adjacency();
//! let colored = colorer.assign_colors()?;
//! assert!(colorer.verify(&colored));
//! # Ok(())
//! # }
//! ```

mod coloring;
mod error;
mod partitioner;
mod point;

pub use coloring::{color_classes, Color, ColoredRegion, RegionColorer};
pub use error::GeometricError;
pub use partitioner::{Region, RegionId, SpatialPartitioner};
pub use point::Point;
