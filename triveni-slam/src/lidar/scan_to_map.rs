//! Scan-to-map registration.
//!
//! Keeps a rolling local map assembled from the most recent `map_size`
//! registered scans (transformed into the map frame). Each new scan is
//! registered against the whole map and constrained relative to the
//! previously kept scan pose.

use std::collections::VecDeque;

use triveni_core::{FactorGraph, Matrix6, PointCloud3D, Pose3D, Transaction};

use crate::config::{covariance_from_diagonal, LidarSection};
use crate::error::SlamError;

use super::{create_matcher, Matcher, ScanPose};

/// Source tag on scan-to-map constraints.
const SOURCE: &str = "LIDAR_SCANTOMAP";
/// Source tag on the seed prior.
const PRIOR_SOURCE: &str = "LIDAR_SCANTOMAP_PRIOR";

/// Rolling-map registration.
pub struct ScanToMapRegistration {
    params: LidarSection,
    matcher: Box<dyn Matcher>,
    /// Per-scan clouds already transformed into the map frame, newest last.
    map_scans: VecDeque<(u64, PointCloud3D)>,
    /// Pose of the previously kept scan (pose only, no cloud).
    previous: Option<(u64, Pose3D)>,
}

impl ScanToMapRegistration {
    /// Create a scan-to-map registrar with the configured matcher.
    pub fn new(params: LidarSection) -> Result<Self, SlamError> {
        let matcher = create_matcher(&params.matcher, &params.matcher_params_path)?;
        Ok(Self {
            params,
            matcher,
            map_scans: VecDeque::new(),
            previous: None,
        })
    }

    /// Number of scans currently in the rolling map.
    pub fn map_len(&self) -> usize {
        self.map_scans.len()
    }

    /// The current map as one cloud.
    pub fn map_cloud(&self) -> PointCloud3D {
        let mut map = PointCloud3D::new();
        for (_, cloud) in &self.map_scans {
            map.extend(cloud);
        }
        map
    }

    /// Register a new scan against the rolling map.
    ///
    /// The first scan seeds the map and receives a pose prior; later scans
    /// produce a relative constraint to the previously kept pose. Empty
    /// clouds and failed matches are refused with an empty transaction.
    pub fn register(&mut self, mut scan: ScanPose) -> Result<Transaction, SlamError> {
        let mut tx = Transaction::new(scan.timestamp_us);

        if self.params.store_full_cloud && self.params.downsample_size > 0.0 {
            scan.full_cloud = Some(scan.cloud.clone());
        }
        scan.cloud = scan.cloud.voxel_downsample(self.params.downsample_size);
        if scan.cloud.is_empty() {
            log::debug!("refusing empty scan at {} µs", scan.timestamp_us);
            return Ok(tx);
        }

        if self.map_scans.is_empty() {
            tx.add_pose_prior(
                scan.timestamp_us,
                scan.t_world_scan,
                self.constraint_covariance(),
                PRIOR_SOURCE,
            );
            tx.add_pose_variable(scan.timestamp_us, scan.t_world_scan);
            self.insert_scan(&scan, &scan.t_world_scan);
            self.previous = Some((scan.timestamp_us, scan.t_world_scan));
            return Ok(tx);
        }

        let (prev_stamp, t_map_prev) = self.previous.expect("map seeded implies previous");

        let map = self.map_cloud();
        self.matcher.set_ref(&map);
        self.matcher.set_target(&scan.cloud);
        let t_map_scan = match self.matcher.align(&scan.t_world_scan) {
            Ok(()) => self.matcher.result(),
            Err(err) => {
                log::debug!("scan-to-map match failed at {} µs: {}", scan.timestamp_us, err);
                return Ok(Transaction::new(scan.timestamp_us));
            }
        };

        let residual = scan.t_world_scan.between(&t_map_scan);
        if residual.translation_norm() > self.params.outlier_threshold_t
            || residual.rotation_angle() > self.params.outlier_threshold_r
        {
            log::debug!("rejecting outlier map match at {} µs", scan.timestamp_us);
            return Ok(Transaction::new(scan.timestamp_us));
        }

        let delta = t_map_prev.between(&t_map_scan);
        let cov = self
            .matcher
            .info()
            .map_or(self.constraint_covariance(), information_to_covariance);
        tx.add_relative_pose_constraint(prev_stamp, scan.timestamp_us, delta, cov, SOURCE);
        tx.add_pose_variable(scan.timestamp_us, t_map_scan);

        self.insert_scan(&scan, &t_map_scan);
        self.previous = Some((scan.timestamp_us, t_map_scan));
        Ok(tx)
    }

    /// Refresh the previous kept pose from post-optimization values.
    pub fn update_from_graph(&mut self, graph: &FactorGraph) {
        if let Some((stamp, pose)) = self.previous.as_mut() {
            if let Some(updated) = graph.pose(*stamp) {
                *pose = updated;
            }
        }
    }

    fn insert_scan(&mut self, scan: &ScanPose, t_map_scan: &Pose3D) {
        self.map_scans
            .push_back((scan.timestamp_us, scan.cloud.transform(t_map_scan)));
        while self.map_scans.len() > self.params.map_size {
            self.map_scans.pop_front();
        }
    }

    fn constraint_covariance(&self) -> Matrix6 {
        covariance_from_diagonal(&self.params.matcher_noise_diagonal)
            / self.params.lidar_information_weight
    }
}

fn information_to_covariance(info: Matrix6) -> Matrix6 {
    info.try_inverse().unwrap_or_else(Matrix6::identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lidar::matcher::tests::structured_cloud;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn params() -> LidarSection {
        LidarSection {
            downsample_size: 0.0,
            map_size: 3,
            ..LidarSection::default()
        }
    }

    fn scan_at(stamp_us: u64, pose: Pose3D) -> ScanPose {
        let world_cloud = structured_cloud();
        ScanPose::new(stamp_us, pose, world_cloud.transform(&pose.inverse()))
    }

    #[test]
    fn first_scan_seeds_map_with_prior() {
        let mut reg = ScanToMapRegistration::new(params()).unwrap();
        let tx = reg.register(scan_at(0, Pose3D::identity())).unwrap();
        assert_eq!(tx.constraints().len(), 1);
        assert_eq!(reg.map_len(), 1);
    }

    #[test]
    fn later_scans_constrain_to_previous_pose() {
        let mut reg = ScanToMapRegistration::new(params()).unwrap();
        reg.register(scan_at(0, Pose3D::identity())).unwrap();

        let pose = Pose3D::from_translation(Vector3::new(0.2, 0.0, 0.0));
        let tx = reg.register(scan_at(100_000, pose)).unwrap();
        assert_eq!(tx.constraints().len(), 1);
        let constraint = &tx.constraints()[0];
        assert_eq!(constraint.source, SOURCE);
        assert_eq!(reg.map_len(), 2);
    }

    #[test]
    fn map_is_trimmed_to_map_size() {
        let mut reg = ScanToMapRegistration::new(params()).unwrap();
        for k in 0..5u64 {
            let pose = Pose3D::from_translation(Vector3::new(k as f64 * 0.2, 0.0, 0.0));
            reg.register(scan_at(k * 100_000, pose)).unwrap();
        }
        assert_eq!(reg.map_len(), 3);
    }

    #[test]
    fn perturbed_initial_pose_is_corrected_by_the_map() {
        let mut reg = ScanToMapRegistration::new(params()).unwrap();
        reg.register(scan_at(0, Pose3D::identity())).unwrap();

        // True pose 0.2 m along x; the estimate is off by 3 cm.
        let truth = Pose3D::from_translation(Vector3::new(0.2, 0.0, 0.0));
        let mut scan = scan_at(100_000, truth);
        scan.t_world_scan = Pose3D::from_translation(Vector3::new(0.23, 0.01, -0.01));

        let tx = reg.register(scan).unwrap();
        assert_eq!(tx.constraints().len(), 1);

        // The kept pose is the refined map-frame pose, not the estimate.
        let (_, kept) = reg.previous.unwrap();
        assert_relative_eq!(kept.translation, truth.translation, epsilon = 1e-4);
    }
}
