//! Rigid-body pose in 3D.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::timestamped::us_to_secs;
use super::Timestamped;

/// A rigid transform in 3D: unit-quaternion rotation plus translation.
///
/// Written `T_a_b`, the pose maps points from frame `b` into frame `a`:
/// `p_a = R * p_b + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose3D {
    /// Rotation component (unit quaternion).
    pub rotation: UnitQuaternion<f64>,
    /// Translation component in meters.
    pub translation: Vector3<f64>,
}

impl Pose3D {
    /// Create a pose from rotation and translation.
    #[inline]
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Identity transform.
    #[inline]
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create from a translation with identity rotation.
    #[inline]
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Create from a rotation-vector (axis * angle) and translation.
    #[inline]
    pub fn from_parts(rotation_vector: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rotation_vector),
            translation,
        }
    }

    /// Compose two poses: `self ∘ other`.
    ///
    /// If `self = T_a_b` and `other = T_b_c`, the result is `T_a_c`.
    #[inline]
    pub fn compose(&self, other: &Pose3D) -> Pose3D {
        Pose3D {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    /// Inverse of this pose.
    #[inline]
    pub fn inverse(&self) -> Pose3D {
        let inv_rot = self.rotation.inverse();
        Pose3D {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// Relative transform from `self` to `other`: `self⁻¹ ∘ other`.
    #[inline]
    pub fn between(&self, other: &Pose3D) -> Pose3D {
        self.inverse().compose(other)
    }

    /// Transform a point from the local frame to the parent frame.
    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Transform a point from the parent frame to the local frame.
    #[inline]
    pub fn inverse_transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * (point - self.translation)
    }

    /// Rotation angle of this transform in radians.
    #[inline]
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Translation norm of this transform in meters.
    #[inline]
    pub fn translation_norm(&self) -> f64 {
        self.translation.norm()
    }

    /// Convert to an `Isometry3`.
    #[inline]
    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    /// Convert from an `Isometry3`.
    #[inline]
    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self {
            rotation: iso.rotation,
            translation: iso.translation.vector,
        }
    }

    /// Interpolate between two timestamped poses.
    ///
    /// Linear interpolation for translation and slerp for rotation. Returns
    /// `None` if `target_time_us` lies outside `[start, end]`.
    pub fn interpolate(
        start: &Timestamped<Pose3D>,
        end: &Timestamped<Pose3D>,
        target_time_us: u64,
    ) -> Option<Pose3D> {
        if target_time_us < start.timestamp_us || target_time_us > end.timestamp_us {
            return None;
        }

        if start.timestamp_us == end.timestamp_us {
            return Some(start.data);
        }

        let t = (us_to_secs(target_time_us) - start.secs()) / (end.secs() - start.secs());

        let rotation = start.data.rotation.slerp(&end.data.rotation, t);
        let translation =
            start.data.translation + t * (end.data.translation - start.data.translation);

        Some(Pose3D {
            rotation,
            translation,
        })
    }
}

impl Default for Pose3D {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn compose_identity() {
        let p = Pose3D::from_parts(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 2.0, 3.0));
        let result = p.compose(&Pose3D::identity());
        assert_relative_eq!(result.translation, p.translation);
        assert_relative_eq!(result.rotation.angle_to(&p.rotation), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn inverse_roundtrip() {
        let p = Pose3D::from_parts(Vector3::new(0.4, -0.1, 0.2), Vector3::new(1.0, 2.0, 3.0));
        let result = p.compose(&p.inverse());
        assert_relative_eq!(result.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(result.rotation_angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn transform_point_quarter_turn() {
        let pose = Pose3D::from_parts(
            Vector3::new(0.0, 0.0, FRAC_PI_2),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let p = pose.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn between_recovers_relative() {
        let a = Pose3D::from_parts(Vector3::new(0.0, 0.0, 0.3), Vector3::new(1.0, 0.0, 0.0));
        let delta = Pose3D::from_parts(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.5, 0.2, 0.0));
        let b = a.compose(&delta);
        let recovered = a.between(&b);
        assert_relative_eq!(recovered.translation, delta.translation, epsilon = 1e-12);
        assert_relative_eq!(
            recovered.rotation.angle_to(&delta.rotation),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn interpolate_midpoint() {
        let start = Timestamped::new(Pose3D::identity(), 0);
        let end = Timestamped::new(
            Pose3D::from_parts(Vector3::new(0.0, 0.0, 1.0), Vector3::new(2.0, 4.0, 0.0)),
            1_000_000,
        );

        let mid = Pose3D::interpolate(&start, &end, 500_000).unwrap();
        assert_relative_eq!(mid.translation, Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(mid.rotation_angle(), 0.5, epsilon = 1e-9);

        assert!(Pose3D::interpolate(&start, &end, 1_000_001).is_none());
    }
}
