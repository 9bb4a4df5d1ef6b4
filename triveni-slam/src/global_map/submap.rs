//! Spatially bounded chunks of the trajectory.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use triveni_core::{FactorGraph, LoamFeatureClouds, PointCloud3D, Pose3D};

/// A visual keypoint stored in a submap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Landmark id in the global landmark table.
    pub landmark_id: u64,
    /// Position in the submap frame.
    pub position: Vector3<f64>,
    /// Optional vocabulary word id for descriptor-based matching.
    pub word_id: Option<u32>,
}

/// A spatially bounded chunk of the trajectory.
///
/// The anchor's initial pose is fixed at creation and never mutated; the
/// current pose moves with pose-graph refinement. All stored geometry lives
/// in the submap frame so refining the anchor re-poses the whole chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submap {
    /// Stamp of the anchor keyframe.
    pub anchor_stamp_us: u64,
    /// Anchor pose at creation. Never mutated.
    t_world_submap_initial: Pose3D,
    /// Current anchor pose, refined by the pose graph.
    t_world_submap: Pose3D,
    /// Keyframe trajectory inside this submap: stamp → `T_submap_baselink`.
    pub keyframe_trajectory: BTreeMap<u64, Pose3D>,
    /// Lidar points in the submap frame.
    pub lidar_points: PointCloud3D,
    /// LOAM feature clouds in the submap frame.
    pub loam: LoamFeatureClouds,
    /// Visual keypoints in the submap frame.
    pub keypoints: Vec<Keypoint>,
}

impl Submap {
    /// Create a submap anchored at the given baselink pose.
    pub fn new(anchor_stamp_us: u64, t_world_anchor: Pose3D) -> Self {
        Self {
            anchor_stamp_us,
            t_world_submap_initial: t_world_anchor,
            t_world_submap: t_world_anchor,
            keyframe_trajectory: BTreeMap::new(),
            lidar_points: PointCloud3D::new(),
            loam: LoamFeatureClouds::default(),
            keypoints: Vec::new(),
        }
    }

    /// Anchor pose at creation time.
    #[inline]
    pub fn t_world_submap_initial(&self) -> Pose3D {
        self.t_world_submap_initial
    }

    /// Current anchor pose.
    #[inline]
    pub fn t_world_submap(&self) -> Pose3D {
        self.t_world_submap
    }

    /// Distance from the initial anchor to a world position.
    pub fn distance_to_initial_anchor(&self, t_world_point: &Vector3<f64>) -> f64 {
        (t_world_point - self.t_world_submap_initial.translation).norm()
    }

    /// Record a keyframe pose inside the submap.
    pub fn add_keyframe_pose(&mut self, stamp_us: u64, t_world_baselink: &Pose3D) {
        let t_submap_baselink = self.t_world_submap.between(t_world_baselink);
        self.keyframe_trajectory.insert(stamp_us, t_submap_baselink);
    }

    /// Add a lidar measurement expressed in the baselink frame.
    pub fn add_lidar_measurement(
        &mut self,
        cloud: &PointCloud3D,
        loam: Option<&LoamFeatureClouds>,
        t_world_baselink: &Pose3D,
    ) {
        let t_submap_baselink = self.t_world_submap.between(t_world_baselink);
        self.lidar_points
            .extend(&cloud.transform(&t_submap_baselink));
        if let Some(loam) = loam {
            let transformed = loam.transform(&t_submap_baselink);
            self.loam.edges_strong.extend(&transformed.edges_strong);
            self.loam.edges_weak.extend(&transformed.edges_weak);
            self.loam
                .surfaces_strong
                .extend(&transformed.surfaces_strong);
            self.loam.surfaces_weak.extend(&transformed.surfaces_weak);
        }
    }

    /// Add a camera measurement: a landmark's world position with its id.
    pub fn add_camera_measurement(
        &mut self,
        landmark_id: u64,
        position_world: &Vector3<f64>,
        word_id: Option<u32>,
    ) {
        let position = self
            .t_world_submap
            .inverse_transform_point(position_world);
        self.keypoints.push(Keypoint {
            landmark_id,
            position,
            word_id,
        });
    }

    /// Lidar points in the world frame under the current anchor.
    pub fn lidar_points_in_world(&self) -> PointCloud3D {
        self.lidar_points.transform(&self.t_world_submap)
    }

    /// Keypoint positions in the world frame under the current anchor.
    pub fn keypoints_in_world(&self) -> Vec<(u64, Vector3<f64>)> {
        self.keypoints
            .iter()
            .map(|kp| (kp.landmark_id, self.t_world_submap.transform_point(&kp.position)))
            .collect()
    }

    /// Keyframe poses in the world frame under the current anchor.
    pub fn trajectory_in_world(&self) -> Vec<(u64, Pose3D)> {
        self.keyframe_trajectory
            .iter()
            .map(|(stamp, t)| (*stamp, self.t_world_submap.compose(t)))
            .collect()
    }

    /// Pull the refined anchor pose from the graph. The initial pose is
    /// untouched.
    pub fn update_from_graph(&mut self, graph: &FactorGraph) {
        if let Some(pose) = graph.pose(self.anchor_stamp_us) {
            self.t_world_submap = pose;
        }
    }

    /// Overwrite the current anchor pose (used by offline map loading).
    pub fn set_anchor_pose(&mut self, pose: Pose3D) {
        self.t_world_submap = pose;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn measurements_are_stored_in_submap_frame() {
        let anchor = Pose3D::from_translation(Vector3::new(10.0, 0.0, 0.0));
        let mut submap = Submap::new(0, anchor);

        let cloud = PointCloud3D::from_points(vec![Vector3::new(1.0, 0.0, 0.0)]);
        let t_world_baselink = Pose3D::from_translation(Vector3::new(12.0, 0.0, 0.0));
        submap.add_lidar_measurement(&cloud, None, &t_world_baselink);

        // Point at x=1 in baselink, baselink at x=12, anchor at x=10:
        // submap-frame x = 3.
        assert_relative_eq!(
            submap.lidar_points.points[0],
            Vector3::new(3.0, 0.0, 0.0),
            epsilon = 1e-12
        );
        // Back to world under the current anchor.
        assert_relative_eq!(
            submap.lidar_points_in_world().points[0],
            Vector3::new(13.0, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn initial_anchor_survives_refinement() {
        let anchor = Pose3D::from_translation(Vector3::new(1.0, 2.0, 3.0));
        let mut submap = Submap::new(0, anchor);
        submap.set_anchor_pose(Pose3D::from_translation(Vector3::new(1.5, 2.0, 3.0)));
        assert_relative_eq!(
            submap.t_world_submap_initial().translation,
            Vector3::new(1.0, 2.0, 3.0)
        );
        assert_relative_eq!(
            submap.t_world_submap().translation,
            Vector3::new(1.5, 2.0, 3.0)
        );
    }
}
