//! Process-wide registry of sensor extrinsics.
//!
//! Rigid transforms between sensor frames and the common baselink frame.
//! Static by default; in dynamic mode every lookup first asks a transform
//! source and caches the answer. Callers always receive a copy, never a
//! reference into the registry.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Pose3D;

/// Canonical frame names used throughout a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameIds {
    pub world: String,
    pub baselink: String,
    pub imu: String,
    pub camera: String,
    pub lidar: String,
}

impl Default for FrameIds {
    fn default() -> Self {
        Self {
            world: "world".to_string(),
            baselink: "baselink".to_string(),
            imu: "imu".to_string(),
            camera: "camera".to_string(),
            lidar: "lidar".to_string(),
        }
    }
}

/// Extrinsics lookup failures.
#[derive(Debug, Clone, Error)]
pub enum ExtrinsicsError {
    /// No transform between the requested frames is known.
    #[error("no extrinsic registered between '{from}' and '{to}'")]
    Missing { from: String, to: String },
}

/// Provider of transforms for dynamic-extrinsics mode.
///
/// Implemented by whatever transform broadcaster the embedding application
/// uses; the registry only sees the lookup capability.
pub trait TransformSource: Send + Sync {
    /// Current `T_from_to`, if the source knows it.
    fn lookup(&self, from: &str, to: &str) -> Option<Pose3D>;
}

/// Registry of rigid transforms between sensor frames.
pub struct ExtrinsicsRegistry {
    transforms: RwLock<HashMap<(String, String), Pose3D>>,
    source: Option<Box<dyn TransformSource>>,
}

impl ExtrinsicsRegistry {
    /// Create an empty static registry.
    pub fn new_static() -> Self {
        Self {
            transforms: RwLock::new(HashMap::new()),
            source: None,
        }
    }

    /// Create a dynamic registry backed by a transform source.
    pub fn with_source(source: Box<dyn TransformSource>) -> Self {
        Self {
            transforms: RwLock::new(HashMap::new()),
            source: Some(source),
        }
    }

    /// Register (or replace) `T_from_to`.
    pub fn set(&self, from: &str, to: &str, transform: Pose3D) {
        self.transforms
            .write()
            .insert((from.to_string(), to.to_string()), transform);
    }

    /// Look up `T_from_to`, returning a copy.
    ///
    /// Identity for `from == to`; the reverse direction is served by
    /// inverting a registered forward transform. In dynamic mode the source
    /// is consulted first and a fresh answer replaces the cached one.
    pub fn get(&self, from: &str, to: &str) -> Result<Pose3D, ExtrinsicsError> {
        if from == to {
            return Ok(Pose3D::identity());
        }

        if let Some(source) = &self.source {
            if let Some(fresh) = source.lookup(from, to) {
                self.transforms
                    .write()
                    .insert((from.to_string(), to.to_string()), fresh);
                return Ok(fresh);
            }
        }

        let transforms = self.transforms.read();
        if let Some(t) = transforms.get(&(from.to_string(), to.to_string())) {
            return Ok(*t);
        }
        if let Some(t) = transforms.get(&(to.to_string(), from.to_string())) {
            return Ok(t.inverse());
        }

        Err(ExtrinsicsError::Missing {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// All registered transforms, copied out (for persistence).
    pub fn entries(&self) -> Vec<(String, String, Pose3D)> {
        self.transforms
            .read()
            .iter()
            .map(|((from, to), t)| (from.clone(), to.clone(), *t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn identity_for_same_frame() {
        let registry = ExtrinsicsRegistry::new_static();
        let t = registry.get("imu", "imu").unwrap();
        assert_relative_eq!(t.translation, Vector3::zeros());
    }

    #[test]
    fn reverse_lookup_inverts() {
        let registry = ExtrinsicsRegistry::new_static();
        let t = Pose3D::from_translation(Vector3::new(0.1, 0.0, 0.2));
        registry.set("baselink", "camera", t);

        let back = registry.get("camera", "baselink").unwrap();
        assert_relative_eq!(back.translation, -t.translation, epsilon = 1e-12);
    }

    #[test]
    fn missing_transform_is_an_error() {
        let registry = ExtrinsicsRegistry::new_static();
        assert!(registry.get("baselink", "lidar").is_err());
    }

    struct FixedSource(Pose3D);
    impl TransformSource for FixedSource {
        fn lookup(&self, from: &str, to: &str) -> Option<Pose3D> {
            (from == "baselink" && to == "lidar").then_some(self.0)
        }
    }

    #[test]
    fn dynamic_mode_refreshes_from_source() {
        let t = Pose3D::from_translation(Vector3::new(0.0, 0.5, 0.0));
        let registry = ExtrinsicsRegistry::with_source(Box::new(FixedSource(t)));
        let got = registry.get("baselink", "lidar").unwrap();
        assert_relative_eq!(got.translation, t.translation);
    }
}
