//! k-d tree spatial partitioner.
//!
//! Points are split on dimension `depth % D` at the median of that
//! dimension's values. Recursion stops at the configured maximum depth, at
//! [`LEAF_CAPACITY`] points, or when a median split fails to separate the
//! set; each leaf becomes a region whose bounds are the inherited box
//! narrowed by the splits taken on the way down. The partition covers the
//! bounding box of the input and leaf interiors are pairwise disjoint.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GeometricError;
use crate::point::Point;

/// Leaves hold at most this many points unless the depth limit bites first.
pub const LEAF_CAPACITY: usize = 5;

/// Identifier of a leaf region (`R1`, `R2`, ... in tree-visit order).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RegionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An axis-aligned leaf region of the partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    /// Inclusive lower bound per dimension.
    pub min: Vec<f64>,
    /// Inclusive upper bound per dimension.
    pub max: Vec<f64>,
    pub points: Vec<Point>,
}

enum KdNode {
    Leaf(Region),
    Internal {
        split_dimension: usize,
        split_value: f64,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
}

/// Builds a k-d tree partition over a point set.
pub struct SpatialPartitioner {
    dimensions: usize,
    max_depth: usize,
    points: Vec<Point>,
    root: Option<Box<KdNode>>,
    regions: Vec<Region>,
}

impl SpatialPartitioner {
    pub fn new(dimensions: usize, max_depth: usize) -> Result<Self, GeometricError> {
        if dimensions == 0 {
            return Err(GeometricError::InvalidDimensions(dimensions));
        }
        Ok(Self {
            dimensions,
            max_depth: max_depth.max(1),
            points: Vec::new(),
            root: None,
            regions: Vec::new(),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Raise or lower the depth limit; takes effect on the next build.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth.max(1);
    }

    /// Add a point to the working set.
    pub fn add_point(&mut self, point: Point) -> Result<(), GeometricError> {
        if point.dimensions() != self.dimensions {
            return Err(GeometricError::DimensionMismatch {
                id: point.id.clone(),
                expected: self.dimensions,
                got: point.dimensions(),
            });
        }
        self.points.push(point);
        Ok(())
    }

    /// Build the tree and collect leaf regions.
    pub fn build(&mut self) -> Result<(), GeometricError> {
        if self.points.is_empty() {
            return Err(GeometricError::EmptyPointSet);
        }

        let mut min = vec![f64::MAX; self.dimensions];
        let mut max = vec![f64::MIN; self.dimensions];
        for point in &self.points {
            for d in 0..self.dimensions {
                min[d] = min[d].min(point.coordinates[d]);
                max[d] = max[d].max(point.coordinates[d]);
            }
        }

        let mut next_region = 1usize;
        let points = self.points.clone();
        let root = self.split(points, 0, min, max, &mut next_region);
        self.regions.clear();
        collect_regions(&root, &mut self.regions);
        self.root = Some(Box::new(root));

        debug!(
            points = self.points.len(),
            regions = self.regions.len(),
            "partition built"
        );
        Ok(())
    }

    /// Leaf regions of the last build.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Locate the leaf region containing `point` by walking the splits.
    pub fn find_region(&self, point: &Point) -> Result<&Region, GeometricError> {
        if point.dimensions() != self.dimensions {
            return Err(GeometricError::DimensionMismatch {
                id: point.id.clone(),
                expected: self.dimensions,
                got: point.dimensions(),
            });
        }
        let mut node = self.root.as_deref().ok_or(GeometricError::NotBuilt)?;
        loop {
            match node {
                KdNode::Leaf(region) => return Ok(region),
                KdNode::Internal {
                    split_dimension,
                    split_value,
                    left,
                    right,
                } => {
                    node = if point.coordinates[*split_dimension] <= *split_value {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }

    fn split(
        &self,
        points: Vec<Point>,
        depth: usize,
        min: Vec<f64>,
        max: Vec<f64>,
        next_region: &mut usize,
    ) -> KdNode {
        if depth >= self.max_depth || points.len() <= LEAF_CAPACITY {
            return self.leaf(points, min, max, next_region);
        }

        let split_dimension = depth % self.dimensions;
        let mut values: Vec<f64> = points
            .iter()
            .map(|p| p.coordinates[split_dimension])
            .collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let split_value = values[values.len() / 2];

        let (left_points, right_points): (Vec<Point>, Vec<Point>) = points
            .into_iter()
            .partition(|p| p.coordinates[split_dimension] <= split_value);

        // A degenerate median (all points on one side) cannot be split
        // further along this path.
        if left_points.is_empty() || right_points.is_empty() {
            let points = if left_points.is_empty() {
                right_points
            } else {
                left_points
            };
            return self.leaf(points, min, max, next_region);
        }

        let mut left_max = max.clone();
        left_max[split_dimension] = split_value;
        let mut right_min = min.clone();
        right_min[split_dimension] = split_value;

        let left = self.split(left_points, depth + 1, min, left_max, next_region);
        let right = self.split(right_points, depth + 1, right_min, max, next_region);

        KdNode::Internal {
            split_dimension,
            split_value,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn leaf(
        &self,
        points: Vec<Point>,
        min: Vec<f64>,
        max: Vec<f64>,
        next_region: &mut usize,
    ) -> KdNode {
        let n = *next_region;
        *next_region += 1;
        KdNode::Leaf(Region {
            id: RegionId::new(format!("R{n}")),
            name: format!("Region {n}"),
            min,
            max,
            points,
        })
    }
}

fn collect_regions(node: &KdNode, out: &mut Vec<Region>) {
    match node {
        KdNode::Leaf(region) => out.push(region.clone()),
        KdNode::Internal { left, right, .. } => {
            collect_regions(left, out);
            collect_regions(right, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points(n: usize) -> Vec<Point> {
        let mut points = Vec::new();
        for x in 0..n {
            for y in 0..n {
                points.push(Point::new(format!("p{x}-{y}"), vec![x as f64, y as f64]));
            }
        }
        points
    }

    fn built(points: Vec<Point>, max_depth: usize) -> SpatialPartitioner {
        let dims = points[0].dimensions();
        let mut partitioner = SpatialPartitioner::new(dims, max_depth).unwrap();
        for point in points {
            partitioner.add_point(point).unwrap();
        }
        partitioner.build().unwrap();
        partitioner
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert_eq!(
            SpatialPartitioner::new(0, 4).err(),
            Some(GeometricError::InvalidDimensions(0))
        );
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut partitioner = SpatialPartitioner::new(2, 4).unwrap();
        let err = partitioner
            .add_point(Point::new("p", vec![1.0, 2.0, 3.0]))
            .unwrap_err();
        assert!(matches!(err, GeometricError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_empty_build_rejected() {
        let mut partitioner = SpatialPartitioner::new(2, 4).unwrap();
        assert_eq!(partitioner.build().err(), Some(GeometricError::EmptyPointSet));
    }

    #[test]
    fn test_small_set_is_single_region() {
        let partitioner = built(grid_points(2), 8);
        // Four points fit in one leaf.
        assert_eq!(partitioner.regions().len(), 1);
        let region = &partitioner.regions()[0];
        assert_eq!(region.id, RegionId::new("R1"));
        assert_eq!(region.points.len(), 4);
    }

    #[test]
    fn test_regions_cover_all_points_exactly_once() {
        let partitioner = built(grid_points(5), 6);
        let total: usize = partitioner.regions().iter().map(|r| r.points.len()).sum();
        assert_eq!(total, 25);

        for region in partitioner.regions() {
            assert!(region.points.len() <= LEAF_CAPACITY || region.min == region.max);
            for point in &region.points {
                for d in 0..2 {
                    assert!(point.coordinates[d] >= region.min[d] - 1e-9);
                    assert!(point.coordinates[d] <= region.max[d] + 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_region_ids_are_sequential() {
        let partitioner = built(grid_points(4), 6);
        for (i, region) in partitioner.regions().iter().enumerate() {
            assert_eq!(region.id, RegionId::new(format!("R{}", i + 1)));
            assert_eq!(region.name, format!("Region {}", i + 1));
        }
    }

    #[test]
    fn test_find_region_follows_splits() {
        let partitioner = built(grid_points(5), 6);
        for region in partitioner.regions() {
            for point in &region.points {
                let found = partitioner.find_region(point).unwrap();
                assert_eq!(found.id, region.id, "point {} misrouted", point.id);
            }
        }
    }

    #[test]
    fn test_find_region_before_build() {
        let partitioner = SpatialPartitioner::new(2, 4).unwrap();
        let err = partitioner
            .find_region(&Point::new("p", vec![0.0, 0.0]))
            .unwrap_err();
        assert_eq!(err, GeometricError::NotBuilt);
    }

    #[test]
    fn test_identical_points_degenerate_split() {
        let points = (0..12)
            .map(|i| Point::new(format!("p{i}"), vec![1.0, 1.0]))
            .collect();
        let partitioner = built(points, 8);
        // Every coordinate equal: the median cannot separate, one leaf.
        assert_eq!(partitioner.regions().len(), 1);
        assert_eq!(partitioner.regions()[0].points.len(), 12);
    }

    #[test]
    fn test_max_depth_bounds_leaf_count() {
        let partitioner = built(grid_points(8), 2);
        // Depth 2 allows at most 4 leaves.
        assert!(partitioner.regions().len() <= 4);
    }
}
