//! A lidar scan with its world-frame pose estimate.

use triveni_core::{FactorGraph, LoamFeatureClouds, PointCloud3D, Pose3D};

/// A scan together with the current estimate of its pose.
///
/// The pose starts as the front-end's prediction and is refreshed from the
/// estimator after each optimization; `updates` counts those refreshes.
#[derive(Debug, Clone)]
pub struct ScanPose {
    /// Scan timestamp in microseconds.
    pub timestamp_us: u64,
    /// Current estimate of `T_world_scan`.
    pub t_world_scan: Pose3D,
    /// Points used for registration (downsampled), scan frame.
    pub cloud: PointCloud3D,
    /// Full-resolution cloud, kept only when configured.
    pub full_cloud: Option<PointCloud3D>,
    /// Optional LOAM feature split, scan frame.
    pub loam: Option<LoamFeatureClouds>,
    /// Times the pose has been pulled from the estimator.
    pub updates: u64,
}

impl ScanPose {
    /// Create a scan pose from a raw cloud and an initial pose estimate.
    pub fn new(timestamp_us: u64, t_world_scan: Pose3D, cloud: PointCloud3D) -> Self {
        Self {
            timestamp_us,
            t_world_scan,
            cloud,
            full_cloud: None,
            loam: None,
            updates: 0,
        }
    }

    /// Attach LOAM feature clouds.
    pub fn with_loam(mut self, loam: LoamFeatureClouds) -> Self {
        self.loam = Some(loam);
        self
    }

    /// The raw cloud transformed into the world frame.
    pub fn cloud_in_world(&self) -> PointCloud3D {
        self.cloud.transform(&self.t_world_scan)
    }

    /// Pull the post-optimization pose from the graph, bumping the update
    /// counter when a value is found.
    pub fn update_from_graph(&mut self, graph: &FactorGraph) {
        if let Some(pose) = graph.pose(self.timestamp_us) {
            self.t_world_scan = pose;
            self.updates += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triveni_core::Transaction;

    #[test]
    fn update_counter_increments_only_on_hits() {
        let mut scan = ScanPose::new(100, Pose3D::identity(), PointCloud3D::new());

        let graph = FactorGraph::new();
        scan.update_from_graph(&graph);
        assert_eq!(scan.updates, 0);

        let mut tx = Transaction::new(100);
        tx.add_pose_variable(100, Pose3D::identity());
        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();
        scan.update_from_graph(&graph);
        assert_eq!(scan.updates, 1);
    }
}
