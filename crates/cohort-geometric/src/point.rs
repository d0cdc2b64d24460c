//! Task points.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A task in conceptual coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub coordinates: Vec<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Point {
    pub fn new(id: impl Into<String>, coordinates: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            coordinates,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn dimensions(&self) -> usize {
        self.coordinates.len()
    }
}
