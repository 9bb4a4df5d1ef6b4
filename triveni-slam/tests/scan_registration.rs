//! End-to-end scan registration: register perturbed scans, optimize, and
//! recover ground truth.

use nalgebra::Vector3;

use triveni_core::{FactorGraph, OptimizerConfig, PointCloud3D, Pose3D};
use triveni_slam::{LidarSection, MultiScanRegistration, ScanPose};

/// Millimeter-level position tolerance.
const TOL_T: f64 = 1e-3;
/// 0.03 degrees in radians.
const TOL_R: f64 = 0.03 * std::f64::consts::PI / 180.0;

fn world_structure() -> PointCloud3D {
    let mut points = Vec::new();
    for i in 0..8 {
        for j in 0..8 {
            points.push(Vector3::new(i as f64 * 0.5, j as f64 * 0.5, 0.0));
            points.push(Vector3::new(i as f64 * 0.5, 0.0, 0.4 + j as f64 * 0.3));
            points.push(Vector3::new(0.0, 0.3 + i as f64 * 0.5, j as f64 * 0.35));
        }
    }
    PointCloud3D::from_points(points)
}

fn scan(stamp_us: u64, stored_pose: Pose3D, true_pose: Pose3D) -> ScanPose {
    // The cloud is what the sensor would see from the TRUE pose.
    ScanPose::new(
        stamp_us,
        stored_pose,
        world_structure().transform(&true_pose.inverse()),
    )
}

fn params() -> LidarSection {
    LidarSection {
        downsample_size: 0.0,
        ..LidarSection::default()
    }
}

#[test]
fn two_scan_registration_recovers_known_perturbation() {
    let truth_2 = Pose3D::from_parts(
        Vector3::new(0.0, 0.0, 0.12),
        Vector3::new(1.0, 0.3, 0.0),
    );
    // Stored estimate off by 5° / 5 cm.
    let five_deg = 5.0f64.to_radians();
    let perturbed_2 = Pose3D::from_parts(
        Vector3::new(0.0, 0.0, 0.12 + five_deg),
        Vector3::new(1.05, 0.3, 0.0),
    );

    let mut registration = MultiScanRegistration::new(params()).unwrap();
    let mut graph = FactorGraph::new();

    let tx1 = registration
        .register(scan(0, Pose3D::identity(), Pose3D::identity()))
        .unwrap();
    graph.apply(&tx1).unwrap();

    let tx2 = registration
        .register(scan(1_000_000, perturbed_2, truth_2))
        .unwrap();
    assert_eq!(tx2.constraints().len(), 1);
    graph.apply(&tx2).unwrap();

    let result = graph.optimize(&OptimizerConfig::default());
    assert!(result.converged);

    let recovered = graph.pose(1_000_000).unwrap();
    assert!((recovered.translation - truth_2.translation).norm() < TOL_T);
    assert!(recovered.rotation.angle_to(&truth_2.rotation) < TOL_R);
}

#[test]
fn three_scan_registration_with_three_neighbors() {
    let truths = [
        Pose3D::identity(),
        Pose3D::from_parts(Vector3::new(0.0, 0.0, 0.05), Vector3::new(1.0, 0.0, 0.0)),
        Pose3D::from_parts(Vector3::new(0.0, 0.0, 0.1), Vector3::new(2.0, 0.2, 0.0)),
    ];
    let perturbations = [
        Pose3D::identity(),
        Pose3D::from_parts(
            Vector3::new(0.0, 0.0, 0.03),
            Vector3::new(0.04, -0.03, 0.02),
        ),
        Pose3D::from_parts(
            Vector3::new(0.0, 0.0, -0.04),
            Vector3::new(-0.03, 0.04, -0.02),
        ),
    ];

    let mut registration = MultiScanRegistration::new(params()).unwrap();
    let mut graph = FactorGraph::new();
    let mut relative_constraints = 0;

    for (k, (truth, perturbation)) in truths.iter().zip(perturbations.iter()).enumerate() {
        let stored = truth.compose(perturbation);
        let tx = registration
            .register(scan(k as u64 * 1_000_000, stored, *truth))
            .unwrap();
        relative_constraints += tx
            .constraints()
            .iter()
            .filter(|c| c.source == "LIDAR_MULTISCAN")
            .count();
        graph.apply(&tx).unwrap();
    }

    // Scan 2 matched one neighbor, scan 3 matched two.
    assert_eq!(relative_constraints, 3);

    let result = graph.optimize(&OptimizerConfig::default());
    assert!(result.converged);

    for (k, truth) in truths.iter().enumerate() {
        let recovered = graph.pose(k as u64 * 1_000_000).unwrap();
        assert!(
            (recovered.translation - truth.translation).norm() < TOL_T,
            "scan {k} translation error {:.5}",
            (recovered.translation - truth.translation).norm()
        );
        assert!(
            recovered.rotation.angle_to(&truth.rotation) < TOL_R,
            "scan {k} rotation error {:.5}",
            recovered.rotation.angle_to(&truth.rotation)
        );
    }
}
