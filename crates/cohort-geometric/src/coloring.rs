//! Region adjacency and 4-coloring.
//!
//! Two regions are adjacent iff their bounds touch along exactly one axis
//! (within [`ADJACENCY_EPSILON`]) and overlap along every other axis. Colors are
//! assigned depth-first in region id order, trying the four colors in order
//! and backtracking on conflict. For 2-D partitions the adjacency graph is
//! planar by construction, so a 4-coloring always exists; higher dimensions
//! may fail, which callers treat as a signal to fall back to serial
//! execution.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GeometricError;
use crate::partitioner::{Region, RegionId};

/// Bound-touch tolerance.
pub const ADJACENCY_EPSILON: f64 = 1e-6;

/// One of the four batch colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Red,
    Green,
    Blue,
    Yellow,
}

impl Color {
    /// All colors in assignment order.
    pub const ALL: [Color; 4] = [Color::Red, Color::Green, Color::Blue, Color::Yellow];

    /// Stable index 0-3.
    pub fn index(self) -> usize {
        match self {
            Color::Red => 0,
            Color::Green => 1,
            Color::Blue => 2,
            Color::Yellow => 3,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Color::Red => "red",
            Color::Green => "green",
            Color::Blue => "blue",
            Color::Yellow => "yellow",
        };
        write!(f, "{s}")
    }
}

/// A region with its assigned color and neighbours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColoredRegion {
    pub id: RegionId,
    pub name: String,
    pub color: Color,
    pub adjacent: Vec<RegionId>,
}

/// Bounds-only view of a region, enough for adjacency.
#[derive(Debug, Clone)]
struct RegionBounds {
    id: RegionId,
    name: String,
    min: Vec<f64>,
    max: Vec<f64>,
}

/// Builds the adjacency graph over a partition and 4-colors it.
#[derive(Default)]
pub struct RegionColorer {
    regions: Vec<RegionBounds>,
    /// Adjacency as index sets; symmetric by construction.
    adjacency: Vec<BTreeSet<usize>>,
}

impl RegionColorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a partition, clearing any previous graph.
    pub fn set_regions(&mut self, regions: &[Region]) {
        self.regions = regions
            .iter()
            .map(|r| RegionBounds {
                id: r.id.clone(),
                name: r.name.clone(),
                min: r.min.clone(),
                max: r.max.clone(),
            })
            .collect();
        self.adjacency = vec![BTreeSet::new(); self.regions.len()];
    }

    /// Build the symmetric adjacency relation.
    pub fn determine_adjacency(&mut self) {
        for i in 0..self.regions.len() {
            for j in (i + 1)..self.regions.len() {
                if regions_adjacent(&self.regions[i], &self.regions[j]) {
                    self.adjacency[i].insert(j);
                    self.adjacency[j].insert(i);
                }
            }
        }
        let edges: usize = self.adjacency.iter().map(BTreeSet::len).sum::<usize>() / 2;
        debug!(regions = self.regions.len(), edges, "adjacency graph built");
    }

    /// Neighbour ids of a region.
    pub fn adjacent_to(&self, id: &RegionId) -> Vec<RegionId> {
        let Some(index) = self.regions.iter().position(|r| r.id == *id) else {
            return Vec::new();
        };
        self.adjacency[index]
            .iter()
            .map(|&j| self.regions[j].id.clone())
            .collect()
    }

    /// Assign colors depth-first in id order, backtracking on conflict.
    pub fn assign_colors(&self) -> Result<Vec<ColoredRegion>, GeometricError> {
        let mut colors: Vec<Option<Color>> = vec![None; self.regions.len()];
        if !self.try_color(0, &mut colors) {
            return Err(GeometricError::Uncolorable);
        }

        Ok(self
            .regions
            .iter()
            .enumerate()
            .map(|(i, region)| ColoredRegion {
                id: region.id.clone(),
                name: region.name.clone(),
                // try_color filled every slot on success
                color: colors[i].unwrap_or(Color::Red),
                adjacent: self.adjacency[i]
                    .iter()
                    .map(|&j| self.regions[j].id.clone())
                    .collect(),
            })
            .collect())
    }

    fn try_color(&self, index: usize, colors: &mut Vec<Option<Color>>) -> bool {
        if index >= self.regions.len() {
            return true;
        }
        for color in Color::ALL {
            let conflicts = self.adjacency[index]
                .iter()
                .any(|&j| colors[j] == Some(color));
            if conflicts {
                continue;
            }
            colors[index] = Some(color);
            if self.try_color(index + 1, colors) {
                return true;
            }
            colors[index] = None;
        }
        false
    }

    /// Defensive post-check: no adjacency edge may connect same-colored
    /// regions, and every listed region must be known.
    pub fn verify(&self, colored: &[ColoredRegion]) -> bool {
        let by_id: HashMap<&RegionId, Color> =
            colored.iter().map(|r| (&r.id, r.color)).collect();
        for region in colored {
            for neighbour in &region.adjacent {
                match by_id.get(neighbour) {
                    Some(color) if *color == region.color => return false,
                    Some(_) => {}
                    None => return false,
                }
            }
        }
        true
    }
}

/// Touch along exactly one axis, overlap along all others.
///
/// Requiring exactly one touching axis rules out corner-only contact, where
/// the shared boundary has no extent.
fn regions_adjacent(a: &RegionBounds, b: &RegionBounds) -> bool {
    let dimensions = a.min.len();
    let mut touch_axis = None;
    for dim in 0..dimensions {
        let touching = (a.min[dim] - b.max[dim]).abs() < ADJACENCY_EPSILON
            || (a.max[dim] - b.min[dim]).abs() < ADJACENCY_EPSILON;
        if touching {
            if touch_axis.is_some() {
                return false;
            }
            touch_axis = Some(dim);
        }
    }
    let Some(axis) = touch_axis else {
        return false;
    };
    (0..dimensions)
        .filter(|d| *d != axis)
        .all(|d| a.max[d] >= b.min[d] && a.min[d] <= b.max[d])
}

/// Group a coloring into its color classes: index `i` holds every region
/// colored `Color::ALL[i]`. Same-class regions are mutually non-adjacent,
/// so each class is one conflict-free parallel batch.
pub fn color_classes(colored: &[ColoredRegion]) -> Vec<Vec<RegionId>> {
    let mut classes = vec![Vec::new(); Color::ALL.len()];
    for region in colored {
        classes[region.color.index()].push(region.id.clone());
    }
    classes
}
