//! Constraint kinds and their residual/Jacobian callbacks.
//!
//! Every constraint carries a source tag and a covariance. Linearization
//! whitens the residual and Jacobians with the square-root information
//! (upper Cholesky factor of the inverse covariance), so the optimizer can
//! accumulate plain JᵀJ / Jᵀr blocks.
//!
//! Perturbation convention: right-multiplicative on rotations
//! (`R ← R·Exp(δφ)`) and additive in the world frame on translations,
//! velocities, and biases. Residual row ordering over full inertial states is
//! (δφ, δv, δp, δb_g, δb_a), matching the preintegration covariance.

use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, SMatrix, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::so3::{right_jacobian_so3, right_jacobian_so3_inv, skew};
use crate::types::{ImuState, Matrix15, Pose3D, PreintegratedDelta, GRAVITY_WORLD};

use super::{FactorGraph, VariableKey};

/// 6×6 covariance over (δφ, δp).
pub type Matrix6 = SMatrix<f64, 6, 6>;

/// Pinhole intrinsics carried by reprojection constraints.
///
/// The full camera model lives with the visual front-end; the constraint only
/// needs the projection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeIntrinsics {
    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the focal plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 1e-9 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }
}

/// A constraint in the factor graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Producer tag, e.g. `"LIDAR_MULTISCAN"` or `"IMU_PREINTEGRATION"`.
    pub source: String,
    /// The measurement model.
    pub kind: ConstraintKind,
}

/// Measurement models supported by the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Absolute prior on a pose variable.
    PosePrior {
        stamp_us: u64,
        mean: Pose3D,
        covariance: Matrix6,
    },
    /// Relative pose between two pose variables: `delta = T_i⁻¹ · T_j`.
    RelativePose {
        stamp_i_us: u64,
        stamp_j_us: u64,
        delta: Pose3D,
        covariance: Matrix6,
    },
    /// Absolute prior on a full inertial state.
    ImuStatePrior {
        state: ImuState,
        covariance: Matrix15,
    },
    /// Preintegrated inertial constraint between two full states.
    PreintegratedImu {
        stamp_i_us: u64,
        stamp_j_us: u64,
        delta: PreintegratedDelta,
    },
    /// Pixel observation of a landmark from a baselink pose.
    Reprojection {
        stamp_us: u64,
        landmark_id: u64,
        pixel: Vector2<f64>,
        intrinsics: PinholeIntrinsics,
        /// Extrinsic `T_baselink_camera`.
        t_baselink_camera: Pose3D,
        /// Square-root information applied to the pixel residual.
        weight: f64,
    },
}

/// Identity of a constraint for override and tombstone purposes.
///
/// Two constraints are "the same" when they share a kind tag, the same
/// involved variables, and the same source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstraintIdentity {
    pub kind: &'static str,
    pub involved: Vec<VariableKey>,
    pub source: String,
}

/// A whitened residual with its Jacobian blocks.
pub struct ResidualBlock {
    pub residual: DVector<f64>,
    /// One (variable, ∂r/∂δx) pair per involved variable, whitened.
    pub jacobians: Vec<(VariableKey, DMatrix<f64>)>,
}

impl Constraint {
    /// Variables this constraint touches, in a stable order.
    pub fn involved(&self) -> Vec<VariableKey> {
        match &self.kind {
            ConstraintKind::PosePrior { stamp_us, .. } => vec![VariableKey::Pose(*stamp_us)],
            ConstraintKind::RelativePose {
                stamp_i_us,
                stamp_j_us,
                ..
            } => vec![
                VariableKey::Pose(*stamp_i_us),
                VariableKey::Pose(*stamp_j_us),
            ],
            ConstraintKind::ImuStatePrior { state, .. } => imu_state_keys(state.timestamp_us),
            ConstraintKind::PreintegratedImu {
                stamp_i_us,
                stamp_j_us,
                ..
            } => {
                let mut keys = imu_state_keys(*stamp_i_us);
                keys.extend(imu_state_keys(*stamp_j_us));
                keys
            }
            ConstraintKind::Reprojection {
                stamp_us,
                landmark_id,
                ..
            } => vec![
                VariableKey::Pose(*stamp_us),
                VariableKey::Landmark(*landmark_id),
            ],
        }
    }

    /// Identity used for override/tombstone matching.
    pub fn identity(&self) -> ConstraintIdentity {
        let kind = match &self.kind {
            ConstraintKind::PosePrior { .. } => "pose_prior",
            ConstraintKind::RelativePose { .. } => "relative_pose",
            ConstraintKind::ImuStatePrior { .. } => "imu_state_prior",
            ConstraintKind::PreintegratedImu { .. } => "preintegrated_imu",
            ConstraintKind::Reprojection { .. } => "reprojection",
        };
        ConstraintIdentity {
            kind,
            involved: self.involved(),
            source: self.source.clone(),
        }
    }

    /// Whitened squared error of this constraint under the graph's values.
    pub fn chi2(&self, graph: &FactorGraph) -> f64 {
        self.linearize(graph)
            .map(|block| block.residual.norm_squared())
            .unwrap_or(0.0)
    }

    /// Evaluate the whitened residual and Jacobians at the graph's values.
    ///
    /// Returns `None` if any involved variable is missing or the projection
    /// is degenerate (landmark behind the camera).
    pub fn linearize(&self, graph: &FactorGraph) -> Option<ResidualBlock> {
        match &self.kind {
            ConstraintKind::PosePrior {
                stamp_us,
                mean,
                covariance,
            } => {
                let pose = graph.pose(*stamp_us)?;

                let r_phi = (mean.rotation.inverse() * pose.rotation).scaled_axis();
                let r_p = pose.translation - mean.translation;

                let mut jac = DMatrix::zeros(6, 6);
                set_block3(&mut jac, 0, 0, &right_jacobian_so3_inv(&r_phi));
                set_block3(&mut jac, 3, 3, &Matrix3::identity());

                let mut residual = DVector::zeros(6);
                residual.fixed_rows_mut::<3>(0).copy_from(&r_phi);
                residual.fixed_rows_mut::<3>(3).copy_from(&r_p);

                let white = sqrt_information(&to_dmatrix(covariance))?;
                Some(ResidualBlock {
                    residual: &white * residual,
                    jacobians: vec![(VariableKey::Pose(*stamp_us), &white * jac)],
                })
            }

            ConstraintKind::RelativePose {
                stamp_i_us,
                stamp_j_us,
                delta,
                covariance,
            } => {
                let pose_i = graph.pose(*stamp_i_us)?;
                let pose_j = graph.pose(*stamp_j_us)?;

                let r_i = pose_i.rotation.to_rotation_matrix().into_inner();
                let r_ij = pose_i.rotation.inverse() * pose_j.rotation;
                let p_ij = r_i.transpose() * (pose_j.translation - pose_i.translation);

                let r_phi = (delta.rotation.inverse() * r_ij).scaled_axis();
                let r_p = p_ij - delta.translation;

                let jr_inv = right_jacobian_so3_inv(&r_phi);
                let r_ij_mat = r_ij.to_rotation_matrix().into_inner();

                // d r / d (δφ_i, δp_i)
                let mut jac_i = DMatrix::zeros(6, 6);
                set_block3(&mut jac_i, 0, 0, &(-jr_inv * r_ij_mat.transpose()));
                set_block3(&mut jac_i, 3, 0, &skew(&p_ij));
                set_block3(&mut jac_i, 3, 3, &(-r_i.transpose()));

                // d r / d (δφ_j, δp_j)
                let mut jac_j = DMatrix::zeros(6, 6);
                set_block3(&mut jac_j, 0, 0, &jr_inv);
                set_block3(&mut jac_j, 3, 3, &r_i.transpose());

                let mut residual = DVector::zeros(6);
                residual.fixed_rows_mut::<3>(0).copy_from(&r_phi);
                residual.fixed_rows_mut::<3>(3).copy_from(&r_p);

                let white = sqrt_information(&to_dmatrix(covariance))?;
                Some(ResidualBlock {
                    residual: &white * residual,
                    jacobians: vec![
                        (VariableKey::Pose(*stamp_i_us), &white * jac_i),
                        (VariableKey::Pose(*stamp_j_us), &white * jac_j),
                    ],
                })
            }

            ConstraintKind::ImuStatePrior { state, covariance } => {
                let stamp = state.timestamp_us;
                let current = graph.imu_state(stamp)?;

                let r_phi = (state.orientation.inverse() * current.orientation).scaled_axis();

                let mut residual = DVector::zeros(15);
                residual.fixed_rows_mut::<3>(0).copy_from(&r_phi);
                residual
                    .fixed_rows_mut::<3>(3)
                    .copy_from(&(current.velocity - state.velocity));
                residual
                    .fixed_rows_mut::<3>(6)
                    .copy_from(&(current.position - state.position));
                residual
                    .fixed_rows_mut::<3>(9)
                    .copy_from(&(current.bias.gyro - state.bias.gyro));
                residual
                    .fixed_rows_mut::<3>(12)
                    .copy_from(&(current.bias.accel - state.bias.accel));

                let mut jac_pose = DMatrix::zeros(15, 6);
                set_block3(&mut jac_pose, 0, 0, &right_jacobian_so3_inv(&r_phi));
                set_block3(&mut jac_pose, 6, 3, &Matrix3::identity());
                let mut jac_vel = DMatrix::zeros(15, 3);
                set_block3(&mut jac_vel, 3, 0, &Matrix3::identity());
                let mut jac_bg = DMatrix::zeros(15, 3);
                set_block3(&mut jac_bg, 9, 0, &Matrix3::identity());
                let mut jac_ba = DMatrix::zeros(15, 3);
                set_block3(&mut jac_ba, 12, 0, &Matrix3::identity());

                let white = sqrt_information(&to_dmatrix(covariance))?;
                Some(ResidualBlock {
                    residual: &white * residual,
                    jacobians: vec![
                        (VariableKey::Pose(stamp), &white * jac_pose),
                        (VariableKey::Velocity(stamp), &white * jac_vel),
                        (VariableKey::GyroBias(stamp), &white * jac_bg),
                        (VariableKey::AccelBias(stamp), &white * jac_ba),
                    ],
                })
            }

            ConstraintKind::PreintegratedImu {
                stamp_i_us,
                stamp_j_us,
                delta,
            } => self.linearize_preintegrated(graph, *stamp_i_us, *stamp_j_us, delta),

            ConstraintKind::Reprojection {
                stamp_us,
                landmark_id,
                pixel,
                intrinsics,
                t_baselink_camera,
                weight,
            } => {
                let pose = graph.pose(*stamp_us)?;
                let landmark = graph.landmark(*landmark_id)?;

                let r_wb = pose.rotation.to_rotation_matrix().into_inner();
                let r_bc = t_baselink_camera.rotation.to_rotation_matrix().into_inner();

                let p_body = pose.inverse_transform_point(&landmark);
                let p_cam = t_baselink_camera.inverse_transform_point(&p_body);
                let projected = intrinsics.project(&p_cam)?;

                let residual_v = projected - pixel;

                // d pixel / d p_cam
                let z_inv = 1.0 / p_cam.z;
                let d_proj = nalgebra::Matrix2x3::new(
                    intrinsics.fx * z_inv,
                    0.0,
                    -intrinsics.fx * p_cam.x * z_inv * z_inv,
                    0.0,
                    intrinsics.fy * z_inv,
                    -intrinsics.fy * p_cam.y * z_inv * z_inv,
                );

                let r_cb = r_bc.transpose();
                let r_cw = r_cb * r_wb.transpose();

                let mut jac_pose = DMatrix::zeros(2, 6);
                jac_pose
                    .view_mut((0, 0), (2, 3))
                    .copy_from(&(d_proj * r_cb * skew(&p_body)));
                jac_pose
                    .view_mut((0, 3), (2, 3))
                    .copy_from(&(-(d_proj * r_cw)));

                let mut jac_lm = DMatrix::zeros(2, 3);
                jac_lm.view_mut((0, 0), (2, 3)).copy_from(&(d_proj * r_cw));

                let w = Matrix2::identity() * *weight;
                let mut residual = DVector::zeros(2);
                residual.fixed_rows_mut::<2>(0).copy_from(&(w * residual_v));

                Some(ResidualBlock {
                    residual,
                    jacobians: vec![
                        (VariableKey::Pose(*stamp_us), *weight * jac_pose),
                        (VariableKey::Landmark(*landmark_id), *weight * jac_lm),
                    ],
                })
            }
        }
    }

    fn linearize_preintegrated(
        &self,
        graph: &FactorGraph,
        stamp_i_us: u64,
        stamp_j_us: u64,
        delta: &PreintegratedDelta,
    ) -> Option<ResidualBlock> {
        let state_i = graph.imu_state(stamp_i_us)?;
        let state_j = graph.imu_state(stamp_j_us)?;

        let dt = delta.dt;
        let gravity = GRAVITY_WORLD;

        let (delta_q, delta_v, delta_p) = delta.corrected(&state_i.bias);

        let r_i = state_i.orientation.to_rotation_matrix().into_inner();
        let r_i_t = r_i.transpose();

        let v_term = state_j.velocity - state_i.velocity - gravity * dt;
        let p_term = state_j.position
            - state_i.position
            - state_i.velocity * dt
            - 0.5 * gravity * dt * dt;

        let r_phi =
            (delta_q.inverse() * (state_i.orientation.inverse() * state_j.orientation))
                .scaled_axis();
        let r_v = r_i_t * v_term - delta_v;
        let r_p = r_i_t * p_term - delta_p;
        let r_bg = state_j.bias.gyro - state_i.bias.gyro;
        let r_ba = state_j.bias.accel - state_i.bias.accel;

        let mut residual = DVector::zeros(15);
        residual.fixed_rows_mut::<3>(0).copy_from(&r_phi);
        residual.fixed_rows_mut::<3>(3).copy_from(&r_v);
        residual.fixed_rows_mut::<3>(6).copy_from(&r_p);
        residual.fixed_rows_mut::<3>(9).copy_from(&r_bg);
        residual.fixed_rows_mut::<3>(12).copy_from(&r_ba);

        let jr_inv = right_jacobian_so3_inv(&r_phi);
        let r_j_t_r_i = (state_j.orientation.inverse() * state_i.orientation)
            .to_rotation_matrix()
            .into_inner();

        // Pose(i): columns (δφ_i, δp_i)
        let mut jac_pose_i = DMatrix::zeros(15, 6);
        set_block3(&mut jac_pose_i, 0, 0, &(-jr_inv * r_j_t_r_i));
        set_block3(&mut jac_pose_i, 3, 0, &skew(&(r_i_t * v_term)));
        set_block3(&mut jac_pose_i, 6, 0, &skew(&(r_i_t * p_term)));
        set_block3(&mut jac_pose_i, 6, 3, &(-r_i_t));

        // Pose(j)
        let mut jac_pose_j = DMatrix::zeros(15, 6);
        set_block3(&mut jac_pose_j, 0, 0, &jr_inv);
        set_block3(&mut jac_pose_j, 6, 3, &r_i_t);

        // Velocities
        let mut jac_vel_i = DMatrix::zeros(15, 3);
        set_block3(&mut jac_vel_i, 3, 0, &(-r_i_t));
        set_block3(&mut jac_vel_i, 6, 0, &(-r_i_t * dt));
        let mut jac_vel_j = DMatrix::zeros(15, 3);
        set_block3(&mut jac_vel_j, 3, 0, &r_i_t);

        // Gyro bias at i enters the corrected delta.
        let delta_bg = state_i.bias.gyro - delta.bias_lin.gyro;
        let exp_neg_r = rotation_of(&-r_phi);
        let d_r_d_bg =
            -jr_inv * exp_neg_r * right_jacobian_so3(&(delta.j_r_bg * delta_bg)) * delta.j_r_bg;

        let mut jac_bg_i = DMatrix::zeros(15, 3);
        set_block3(&mut jac_bg_i, 0, 0, &d_r_d_bg);
        set_block3(&mut jac_bg_i, 3, 0, &(-delta.j_v_bg));
        set_block3(&mut jac_bg_i, 6, 0, &(-delta.j_p_bg));
        set_block3(&mut jac_bg_i, 9, 0, &(-Matrix3::identity()));

        let mut jac_ba_i = DMatrix::zeros(15, 3);
        set_block3(&mut jac_ba_i, 3, 0, &(-delta.j_v_ba));
        set_block3(&mut jac_ba_i, 6, 0, &(-delta.j_p_ba));
        set_block3(&mut jac_ba_i, 12, 0, &(-Matrix3::identity()));

        let mut jac_bg_j = DMatrix::zeros(15, 3);
        set_block3(&mut jac_bg_j, 9, 0, &Matrix3::identity());
        let mut jac_ba_j = DMatrix::zeros(15, 3);
        set_block3(&mut jac_ba_j, 12, 0, &Matrix3::identity());

        let white = sqrt_information(&to_dmatrix(&delta.covariance))?;
        Some(ResidualBlock {
            residual: &white * residual,
            jacobians: vec![
                (VariableKey::Pose(stamp_i_us), &white * jac_pose_i),
                (VariableKey::Velocity(stamp_i_us), &white * jac_vel_i),
                (VariableKey::GyroBias(stamp_i_us), &white * jac_bg_i),
                (VariableKey::AccelBias(stamp_i_us), &white * jac_ba_i),
                (VariableKey::Pose(stamp_j_us), &white * jac_pose_j),
                (VariableKey::Velocity(stamp_j_us), &white * jac_vel_j),
                (VariableKey::GyroBias(stamp_j_us), &white * jac_bg_j),
                (VariableKey::AccelBias(stamp_j_us), &white * jac_ba_j),
            ],
        })
    }
}

/// The four variable keys of a full inertial state at `stamp_us`.
fn imu_state_keys(stamp_us: u64) -> Vec<VariableKey> {
    vec![
        VariableKey::Pose(stamp_us),
        VariableKey::Velocity(stamp_us),
        VariableKey::GyroBias(stamp_us),
        VariableKey::AccelBias(stamp_us),
    ]
}

/// Copy a 3×3 block into a dynamic matrix.
#[inline]
fn set_block3(target: &mut DMatrix<f64>, row: usize, col: usize, block: &Matrix3<f64>) {
    target.view_mut((row, col), (3, 3)).copy_from(block);
}

/// Upper Cholesky factor of the inverse covariance.
///
/// Whitening matrix `W` such that `‖W r‖² = rᵀ Σ⁻¹ r`. A small diagonal
/// regularization keeps near-singular covariances factorizable.
fn sqrt_information(covariance: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = covariance.nrows();
    let regularized = covariance + DMatrix::identity(n, n) * 1e-12;
    let information = regularized.try_inverse()?;
    let chol = information.cholesky()?;
    Some(chol.l().transpose())
}

/// Exp(φ) as a rotation matrix.
fn rotation_of(phi: &Vector3<f64>) -> Matrix3<f64> {
    nalgebra::UnitQuaternion::from_scaled_axis(*phi)
        .to_rotation_matrix()
        .into_inner()
}

/// Copy a fixed-size square matrix into a dynamic one.
fn to_dmatrix<const N: usize>(m: &SMatrix<f64, N, N>) -> DMatrix<f64> {
    DMatrix::from_column_slice(N, N, m.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Transaction;
    use approx::assert_relative_eq;

    fn graph_with_two_poses() -> FactorGraph {
        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, Pose3D::identity());
        tx.add_pose_variable(
            1_000_000,
            Pose3D::from_parts(Vector3::new(0.0, 0.0, 0.2), Vector3::new(1.0, 0.5, 0.0)),
        );
        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();
        graph
    }

    #[test]
    fn relative_pose_residual_zero_at_measurement() {
        let graph = graph_with_two_poses();
        let delta = graph.pose(0).unwrap().between(&graph.pose(1_000_000).unwrap());
        let constraint = Constraint {
            source: "TEST".into(),
            kind: ConstraintKind::RelativePose {
                stamp_i_us: 0,
                stamp_j_us: 1_000_000,
                delta,
                covariance: Matrix6::identity(),
            },
        };
        assert_relative_eq!(constraint.chi2(&graph), 0.0, epsilon = 1e-18);
    }

    #[test]
    fn identity_is_stable_over_clone() {
        let constraint = Constraint {
            source: "TEST".into(),
            kind: ConstraintKind::PosePrior {
                stamp_us: 42,
                mean: Pose3D::identity(),
                covariance: Matrix6::identity(),
            },
        };
        assert_eq!(constraint.identity(), constraint.clone().identity());
    }
}
