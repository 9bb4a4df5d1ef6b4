//! Verifies analytic constraint Jacobians against forward differences.

use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use triveni_core::{
    Constraint, ConstraintKind, FactorGraph, ImuBias, ImuState, Matrix15, Matrix6,
    PinholeIntrinsics, Pose3D, PreintegratedDelta, Transaction, VariableKey,
};

const EPS: f64 = 1e-8;
const TOL: f64 = 1e-6;

fn random_pose(rng: &mut StdRng) -> Pose3D {
    Pose3D::from_parts(
        Vector3::new(
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
        ),
        Vector3::new(
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
        ),
    )
}

fn random_vec3(rng: &mut StdRng, scale: f64) -> Vector3<f64> {
    Vector3::new(
        rng.gen_range(-scale..scale),
        rng.gen_range(-scale..scale),
        rng.gen_range(-scale..scale),
    )
}

fn random_matrix3(rng: &mut StdRng, scale: f64) -> Matrix3<f64> {
    Matrix3::from_fn(|_, _| rng.gen_range(-scale..scale))
}

/// Residual with one variable perturbed by `step` along local axis `col`.
fn perturbed_residual(
    constraint: &Constraint,
    graph: &FactorGraph,
    key: &VariableKey,
    col: usize,
    step: f64,
) -> DVector<f64> {
    let mut value = *graph.get(key).expect("variable present");
    let mut delta = vec![0.0; value.local_dim()];
    delta[col] = step;
    value.retract(&delta);

    let mut perturbed_graph = graph.clone();
    let mut tx = Transaction::new(0);
    tx.add_variable(*key, value);
    tx.set_overrides(false, true);
    perturbed_graph.apply(&tx).unwrap();

    constraint
        .linearize(&perturbed_graph)
        .expect("perturbed constraint must linearize")
        .residual
}

/// Central-difference Jacobian of the whitened residual w.r.t. one variable.
fn numeric_jacobian(
    constraint: &Constraint,
    graph: &FactorGraph,
    key: &VariableKey,
) -> DMatrix<f64> {
    let base = constraint
        .linearize(graph)
        .expect("constraint must linearize")
        .residual;
    let dim = graph.get(key).expect("variable present").local_dim();

    let mut jac = DMatrix::zeros(base.len(), dim);
    for col in 0..dim {
        let plus = perturbed_residual(constraint, graph, key, col, EPS);
        let minus = perturbed_residual(constraint, graph, key, col, -EPS);
        let column: DVector<f64> = (plus - minus) / (2.0 * EPS);
        jac.set_column(col, &column);
    }
    jac
}

fn check_all_jacobians(constraint: &Constraint, graph: &FactorGraph) {
    let block = constraint.linearize(graph).expect("linearize");
    for (key, analytic) in &block.jacobians {
        let numeric = numeric_jacobian(constraint, graph, key);
        let max_diff = (analytic - &numeric).abs().max();
        assert!(
            max_diff < TOL,
            "jacobian mismatch for {:?}: max diff {:.3e}",
            key,
            max_diff
        );
    }
}

#[test]
fn pose_prior_jacobians_match_numeric() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..5 {
        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, random_pose(&mut rng));
        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();

        let constraint = Constraint {
            source: "TEST".into(),
            kind: ConstraintKind::PosePrior {
                stamp_us: 0,
                mean: random_pose(&mut rng),
                covariance: Matrix6::identity() * 0.04,
            },
        };
        check_all_jacobians(&constraint, &graph);
    }
}

#[test]
fn relative_pose_jacobians_match_numeric() {
    let mut rng = StdRng::seed_from_u64(23);
    for _ in 0..5 {
        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, random_pose(&mut rng));
        tx.add_pose_variable(1, random_pose(&mut rng));
        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();

        let constraint = Constraint {
            source: "TEST".into(),
            kind: ConstraintKind::RelativePose {
                stamp_i_us: 0,
                stamp_j_us: 1,
                delta: random_pose(&mut rng),
                covariance: Matrix6::identity() * 0.01,
            },
        };
        check_all_jacobians(&constraint, &graph);
    }
}

#[test]
fn preintegrated_imu_jacobians_match_numeric() {
    let mut rng = StdRng::seed_from_u64(47);
    for _ in 0..3 {
        let state = |stamp: u64, rng: &mut StdRng| ImuState {
            timestamp_us: stamp,
            orientation: random_pose(rng).rotation,
            position: random_vec3(rng, 2.0),
            velocity: random_vec3(rng, 1.0),
            bias: ImuBias {
                gyro: random_vec3(rng, 0.01),
                accel: random_vec3(rng, 0.05),
            },
        };

        let mut tx = Transaction::new(0);
        tx.add_imu_state_variables(&state(0, &mut rng));
        tx.add_imu_state_variables(&state(1_000_000, &mut rng));
        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();

        let delta = PreintegratedDelta {
            dt: 0.5,
            delta_q: random_pose(&mut rng).rotation,
            delta_v: random_vec3(&mut rng, 1.0),
            delta_p: random_vec3(&mut rng, 1.0),
            covariance: Matrix15::identity() * 1e-2,
            j_r_bg: random_matrix3(&mut rng, 0.5),
            j_v_bg: random_matrix3(&mut rng, 0.5),
            j_v_ba: random_matrix3(&mut rng, 0.5),
            j_p_bg: random_matrix3(&mut rng, 0.5),
            j_p_ba: random_matrix3(&mut rng, 0.5),
            bias_lin: ImuBias {
                gyro: random_vec3(&mut rng, 0.01),
                accel: random_vec3(&mut rng, 0.05),
            },
        };

        let constraint = Constraint {
            source: "TEST".into(),
            kind: ConstraintKind::PreintegratedImu {
                stamp_i_us: 0,
                stamp_j_us: 1_000_000,
                delta,
            },
        };
        check_all_jacobians(&constraint, &graph);
    }
}

#[test]
fn reprojection_jacobians_match_numeric() {
    let mut rng = StdRng::seed_from_u64(71);
    for _ in 0..5 {
        let pose = Pose3D::from_parts(random_vec3(&mut rng, 0.2), random_vec3(&mut rng, 0.5));
        // Landmark well in front of the camera.
        let landmark = pose.transform_point(&Vector3::new(
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
            rng.gen_range(2.0..5.0),
        ));

        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, pose);
        tx.add_landmark_variable(9, landmark);
        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();

        let intrinsics = PinholeIntrinsics {
            fx: 458.0,
            fy: 457.0,
            cx: 320.0,
            cy: 240.0,
        };
        // Measurement near the true projection keeps the residual small.
        let projected = intrinsics
            .project(&pose.inverse_transform_point(&landmark))
            .unwrap();
        let noise = Vector2::new(rng.gen_range(-4.0..4.0), rng.gen_range(-4.0..4.0));

        let constraint = Constraint {
            source: "TEST".into(),
            kind: ConstraintKind::Reprojection {
                stamp_us: 0,
                landmark_id: 9,
                pixel: projected + noise,
                intrinsics,
                t_baselink_camera: Pose3D::identity(),
                weight: 2.0,
            },
        };
        check_all_jacobians(&constraint, &graph);
    }
}
