//! Windowed multi-scan registration.
//!
//! Each accepted scan is registered against the most recent
//! `num_neighbors` scans in the window, producing one relative-pose
//! constraint per accepted match. Scans older than `lag_duration` fall out
//! of the window (0 keeps everything).

use std::collections::VecDeque;

use triveni_core::{Matrix6, Transaction};

use crate::config::{covariance_from_diagonal, LidarSection};
use crate::error::SlamError;

use super::{create_matcher, Matcher, ScanPose};

/// Source tag on multi-scan constraints.
const SOURCE: &str = "LIDAR_MULTISCAN";
/// Source tag on the seed prior.
const PRIOR_SOURCE: &str = "LIDAR_MULTISCAN_PRIOR";

/// Registration of each new scan against its N most recent neighbors.
pub struct MultiScanRegistration {
    params: LidarSection,
    matcher: Box<dyn Matcher>,
    window: VecDeque<ScanPose>,
    prior_emitted: bool,
    /// Matches rejected by the outlier thresholds.
    outlier_count: u64,
}

impl MultiScanRegistration {
    /// Create a multi-scan registrar with the configured matcher.
    pub fn new(params: LidarSection) -> Result<Self, SlamError> {
        let matcher = create_matcher(&params.matcher, &params.matcher_params_path)?;
        Ok(Self {
            params,
            matcher,
            window: VecDeque::new(),
            prior_emitted: false,
            outlier_count: 0,
        })
    }

    /// Scans currently in the window.
    pub fn window(&self) -> &VecDeque<ScanPose> {
        &self.window
    }

    /// Matches rejected as outliers so far.
    pub fn outlier_count(&self) -> u64 {
        self.outlier_count
    }

    /// Register a new scan.
    ///
    /// Returns an empty transaction (and drops the scan) when the cloud is
    /// empty, the motion since the previous scan is below both minimum-motion
    /// thresholds, or every neighbor match is rejected.
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

        if self.window.is_empty() {
            // Seed the window. A prior also lands here when fix_first_scan is
            // off: without one the graph would be gauge-free.
            if self.params.fix_first_scan || !self.prior_emitted {
                tx.add_pose_prior(
                    scan.timestamp_us,
                    scan.t_world_scan,
                    self.constraint_covariance(),
                    PRIOR_SOURCE,
                );
                self.prior_emitted = true;
            }
            tx.add_pose_variable(scan.timestamp_us, scan.t_world_scan);
            self.window.push_back(scan);
            return Ok(tx);
        }

        let previous = self.window.back().expect("window non-empty");
        let motion = previous.t_world_scan.between(&scan.t_world_scan);
        if motion.translation_norm() < self.params.min_motion_trans_m
            && motion.rotation_angle() < self.params.min_motion_rot_rad
        {
            log::debug!(
                "refusing scan at {} µs: motion below threshold",
                scan.timestamp_us
            );
            return Ok(tx);
        }

        let covariance = self.constraint_covariance();
        let neighbors = self.params.num_neighbors.min(self.window.len());
        let mut accepted = 0usize;

        for neighbor in self.window.iter().rev().take(neighbors) {
            let initial = neighbor.t_world_scan.between(&scan.t_world_scan);

            self.matcher.set_ref(&neighbor.cloud);
            self.matcher.set_target(&scan.cloud);
            match self.matcher.align(&initial) {
                Ok(()) => {
                    let refined = self.matcher.result();
                    let residual = initial.between(&refined);
                    if residual.translation_norm() > self.params.outlier_threshold_t
                        || residual.rotation_angle() > self.params.outlier_threshold_r
                    {
                        self.outlier_count += 1;
                        log::debug!(
                            "rejecting outlier match {} -> {} µs",
                            neighbor.timestamp_us,
                            scan.timestamp_us
                        );
                        continue;
                    }
                    let cov = self.matcher.info().map_or(covariance, information_to_covariance);
                    tx.add_relative_pose_constraint(
                        neighbor.timestamp_us,
                        scan.timestamp_us,
                        refined,
                        cov,
                        SOURCE,
                    );
                    accepted += 1;
                }
                Err(err) => {
                    log::debug!(
                        "matcher failed for neighbor {} µs: {}",
                        neighbor.timestamp_us,
                        err
                    );
                }
            }
        }

        if accepted == 0 {
            return Ok(Transaction::new(scan.timestamp_us));
        }

        tx.add_pose_variable(scan.timestamp_us, scan.t_world_scan);
        self.window.push_back(scan);
        self.trim_window();
        Ok(tx)
    }

    /// Refresh window poses from post-optimization values.
    pub fn update_from_graph(&mut self, graph: &triveni_core::FactorGraph) {
        for scan in self.window.iter_mut() {
            scan.update_from_graph(graph);
        }
    }

    fn trim_window(&mut self) {
        if self.params.lag_duration <= 0.0 {
            return;
        }
        let newest = match self.window.back() {
            Some(scan) => scan.timestamp_us,
            None => return,
        };
        let lag_us = (self.params.lag_duration * 1e6) as u64;
        while matches!(
            self.window.front(),
            Some(scan) if newest.saturating_sub(scan.timestamp_us) > lag_us
        ) {
            self.window.pop_front();
        }
    }

    fn constraint_covariance(&self) -> Matrix6 {
        covariance_from_diagonal(&self.params.matcher_noise_diagonal)
            / self.params.lidar_information_weight
    }
}

/// Invert a matcher-reported information matrix into a covariance.
fn information_to_covariance(info: Matrix6) -> Matrix6 {
    info.try_inverse().unwrap_or_else(Matrix6::identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lidar::matcher::tests::structured_cloud;
    use nalgebra::Vector3;
    use triveni_core::{PointCloud3D, Pose3D};

    fn params() -> LidarSection {
        LidarSection {
            downsample_size: 0.0,
            min_motion_trans_m: 0.01,
            min_motion_rot_rad: 0.005,
            ..LidarSection::default()
        }
    }

    fn scan_at(stamp_us: u64, pose: Pose3D) -> ScanPose {
        // Points fixed in the world, expressed in the scan frame.
        let world_cloud = structured_cloud();
        ScanPose::new(stamp_us, pose, world_cloud.transform(&pose.inverse()))
    }

    #[test]
    fn first_scan_emits_prior_only() {
        let mut reg = MultiScanRegistration::new(params()).unwrap();
        let tx = reg.register(scan_at(0, Pose3D::identity())).unwrap();
        assert_eq!(tx.constraints().len(), 1);
        assert_eq!(tx.variables().len(), 1);
        assert_eq!(reg.window().len(), 1);
    }

    #[test]
    fn empty_scan_is_refused() {
        let mut reg = MultiScanRegistration::new(params()).unwrap();
        let scan = ScanPose::new(0, Pose3D::identity(), PointCloud3D::new());
        let tx = reg.register(scan).unwrap();
        assert!(tx.is_empty());
        assert!(reg.window().is_empty());
    }

    #[test]
    fn small_motion_is_refused() {
        let mut reg = MultiScanRegistration::new(params()).unwrap();
        reg.register(scan_at(0, Pose3D::identity())).unwrap();

        let nudged = Pose3D::from_translation(Vector3::new(0.001, 0.0, 0.0));
        let tx = reg.register(scan_at(100_000, nudged)).unwrap();
        assert!(tx.is_empty());
        assert_eq!(reg.window().len(), 1);
    }

    #[test]
    fn constraint_count_is_min_of_neighbors_and_window() {
        let mut reg = MultiScanRegistration::new(params()).unwrap();

        let poses: Vec<Pose3D> = (0..5)
            .map(|k| Pose3D::from_translation(Vector3::new(k as f64 * 0.2, 0.0, 0.0)))
            .collect();

        for (k, pose) in poses.iter().enumerate() {
            let tx = reg.register(scan_at(k as u64 * 100_000, *pose)).unwrap();
            let relative_constraints = tx
                .constraints()
                .iter()
                .filter(|c| c.source == SOURCE)
                .count();
            let expected = if k == 0 { 0 } else { k.min(3) };
            assert_eq!(relative_constraints, expected, "scan {k}");
        }
    }

    #[test]
    fn lag_duration_drops_old_scans() {
        let mut p = params();
        p.lag_duration = 0.25;
        let mut reg = MultiScanRegistration::new(p).unwrap();

        for k in 0..5u64 {
            let pose = Pose3D::from_translation(Vector3::new(k as f64 * 0.2, 0.0, 0.0));
            reg.register(scan_at(k * 100_000, pose)).unwrap();
        }
        // Window of 250 ms around the newest stamp (400 ms): scans at 200,
        // 300, and 400 ms survive.
        assert_eq!(reg.window().len(), 3);
    }
}
