//! Global landmark table.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{Vector2, Vector3};

use triveni_core::FactorGraph;

/// A triangulated world-space landmark.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: u64,
    /// Position in the world frame.
    pub position: Vector3<f64>,
    /// Observing keyframe stamps with their pixel measurements.
    pub observations: BTreeMap<u64, Vector2<f64>>,
}

/// Id-keyed landmark table shared between the visual front-end and the
/// submap manager.
///
/// Single writer: the estimator refreshes positions after optimization;
/// everyone else reads.
#[derive(Debug, Clone, Default)]
pub struct VisualMap {
    landmarks: HashMap<u64, Landmark>,
}

impl VisualMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of landmarks.
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    /// Whether the map has no landmarks.
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    /// Whether a landmark id is triangulated.
    pub fn contains(&self, id: u64) -> bool {
        self.landmarks.contains_key(&id)
    }

    /// Look up a landmark.
    pub fn get(&self, id: u64) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    /// Insert a freshly triangulated landmark.
    pub fn insert(&mut self, landmark: Landmark) {
        self.landmarks.insert(landmark.id, landmark);
    }

    /// Record an observation of an existing landmark.
    pub fn add_observation(&mut self, id: u64, stamp_us: u64, pixel: Vector2<f64>) {
        if let Some(lm) = self.landmarks.get_mut(&id) {
            lm.observations.insert(stamp_us, pixel);
        }
    }

    /// Iterate over all landmarks.
    pub fn iter(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    /// Remove landmarks whose newest observation is older than `stamp_us`.
    ///
    /// Called once the window has advanced past all their observations.
    pub fn prune_unobserved_before(&mut self, stamp_us: u64) {
        self.landmarks.retain(|_, lm| {
            lm.observations
                .keys()
                .next_back()
                .is_some_and(|last| *last >= stamp_us)
        });
    }

    /// Refresh landmark positions from post-optimization graph values.
    pub fn update_from_graph(&mut self, graph: &FactorGraph) {
        for lm in self.landmarks.values_mut() {
            if let Some(position) = graph.landmark(lm.id) {
                lm.position = position;
            }
        }
    }
}
