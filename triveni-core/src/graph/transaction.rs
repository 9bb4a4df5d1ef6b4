//! Atomic batches of graph mutations.

use std::collections::BTreeSet;

use nalgebra::{Vector2, Vector3};

use crate::types::{ImuState, Matrix15, Pose3D, PreintegratedDelta};

use super::constraint::{Constraint, ConstraintIdentity, ConstraintKind, Matrix6, PinholeIntrinsics};
use super::{VariableKey, VariableValue};

/// An atomic batch of variable additions, constraint additions, and
/// tombstones, consumed by the estimator.
///
/// An empty transaction is equivalent to a no-op. The `override_*` flags
/// control collision behavior on application: when set, entries of identical
/// identity are replaced in place instead of kept.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    /// Stamp of the event that produced this transaction.
    pub stamp_us: u64,
    /// Stamps of all states this transaction touches.
    pub involved_stamps: BTreeSet<u64>,
    /// Replace existing constraints of identical identity.
    pub override_constraints: bool,
    /// Replace existing variables of identical key.
    pub override_variables: bool,

    variables: Vec<(VariableKey, VariableValue)>,
    constraints: Vec<Constraint>,
    removed_variables: Vec<VariableKey>,
    removed_constraints: Vec<ConstraintIdentity>,
}

impl Transaction {
    /// Create an empty transaction stamped with the producing event's time.
    pub fn new(stamp_us: u64) -> Self {
        Self {
            stamp_us,
            ..Default::default()
        }
    }

    /// Set both override flags.
    pub fn set_overrides(&mut self, constraints: bool, variables: bool) {
        self.override_constraints = constraints;
        self.override_variables = variables;
    }

    /// Whether the transaction carries no mutations at all.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
            && self.constraints.is_empty()
            && self.removed_variables.is_empty()
            && self.removed_constraints.is_empty()
    }

    /// Variables to add.
    pub fn variables(&self) -> &[(VariableKey, VariableValue)] {
        &self.variables
    }

    /// Constraints to add.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Variable tombstones.
    pub fn removed_variables(&self) -> &[VariableKey] {
        &self.removed_variables
    }

    /// Constraint tombstones.
    pub fn removed_constraints(&self) -> &[ConstraintIdentity] {
        &self.removed_constraints
    }

    /// Add a raw variable.
    pub fn add_variable(&mut self, key: VariableKey, value: VariableValue) {
        self.note_stamp(&key);
        self.variables.push((key, value));
    }

    /// Add a pose variable at a stamp.
    pub fn add_pose_variable(&mut self, stamp_us: u64, pose: Pose3D) {
        self.add_variable(VariableKey::Pose(stamp_us), VariableValue::Pose(pose));
    }

    /// Add a landmark variable.
    pub fn add_landmark_variable(&mut self, id: u64, position: Vector3<f64>) {
        self.add_variable(VariableKey::Landmark(id), VariableValue::Vec3(position));
    }

    /// Add all four variables of a full inertial state.
    pub fn add_imu_state_variables(&mut self, state: &ImuState) {
        let stamp = state.timestamp_us;
        self.add_variable(VariableKey::Pose(stamp), VariableValue::Pose(state.pose()));
        self.add_variable(
            VariableKey::Velocity(stamp),
            VariableValue::Vec3(state.velocity),
        );
        self.add_variable(
            VariableKey::GyroBias(stamp),
            VariableValue::Vec3(state.bias.gyro),
        );
        self.add_variable(
            VariableKey::AccelBias(stamp),
            VariableValue::Vec3(state.bias.accel),
        );
    }

    /// Add an absolute pose prior.
    pub fn add_pose_prior(
        &mut self,
        stamp_us: u64,
        mean: Pose3D,
        covariance: Matrix6,
        source: &str,
    ) {
        self.involved_stamps.insert(stamp_us);
        self.constraints.push(Constraint {
            source: source.to_string(),
            kind: ConstraintKind::PosePrior {
                stamp_us,
                mean,
                covariance,
            },
        });
    }

    /// Add a relative pose constraint `delta = T_i⁻¹ · T_j`.
    pub fn add_relative_pose_constraint(
        &mut self,
        stamp_i_us: u64,
        stamp_j_us: u64,
        delta: Pose3D,
        covariance: Matrix6,
        source: &str,
    ) {
        self.involved_stamps.insert(stamp_i_us);
        self.involved_stamps.insert(stamp_j_us);
        self.constraints.push(Constraint {
            source: source.to_string(),
            kind: ConstraintKind::RelativePose {
                stamp_i_us,
                stamp_j_us,
                delta,
                covariance,
            },
        });
    }

    /// Add a prior over a full inertial state.
    pub fn add_imu_state_prior(&mut self, state: ImuState, covariance: Matrix15, source: &str) {
        self.involved_stamps.insert(state.timestamp_us);
        self.constraints.push(Constraint {
            source: source.to_string(),
            kind: ConstraintKind::ImuStatePrior { state, covariance },
        });
    }

    /// Add a preintegrated inertial constraint between two states.
    pub fn add_preintegrated_imu_constraint(
        &mut self,
        stamp_i_us: u64,
        stamp_j_us: u64,
        delta: PreintegratedDelta,
        source: &str,
    ) {
        self.involved_stamps.insert(stamp_i_us);
        self.involved_stamps.insert(stamp_j_us);
        self.constraints.push(Constraint {
            source: source.to_string(),
            kind: ConstraintKind::PreintegratedImu {
                stamp_i_us,
                stamp_j_us,
                delta,
            },
        });
    }

    /// Add a reprojection constraint on a landmark observation.
    #[allow(clippy::too_many_arguments)]
    pub fn add_reprojection_constraint(
        &mut self,
        stamp_us: u64,
        landmark_id: u64,
        pixel: Vector2<f64>,
        intrinsics: PinholeIntrinsics,
        t_baselink_camera: Pose3D,
        weight: f64,
        source: &str,
    ) {
        self.involved_stamps.insert(stamp_us);
        self.constraints.push(Constraint {
            source: source.to_string(),
            kind: ConstraintKind::Reprojection {
                stamp_us,
                landmark_id,
                pixel,
                intrinsics,
                t_baselink_camera,
                weight,
            },
        });
    }

    /// Add an already-built constraint (used when copying graphs).
    pub fn add_raw_constraint(&mut self, constraint: Constraint) {
        for key in constraint.involved() {
            self.note_stamp(&key);
        }
        self.constraints.push(constraint);
    }

    /// Tombstone a variable.
    pub fn remove_variable(&mut self, key: VariableKey) {
        self.removed_variables.push(key);
    }

    /// Tombstone a constraint by identity.
    pub fn remove_constraint(&mut self, identity: ConstraintIdentity) {
        self.removed_constraints.push(identity);
    }

    /// Merge another transaction into this one.
    ///
    /// Override flags are OR-combined.
    pub fn merge(&mut self, other: Transaction) {
        self.involved_stamps.extend(other.involved_stamps);
        self.override_constraints |= other.override_constraints;
        self.override_variables |= other.override_variables;
        self.variables.extend(other.variables);
        self.constraints.extend(other.constraints);
        self.removed_variables.extend(other.removed_variables);
        self.removed_constraints.extend(other.removed_constraints);
    }

    fn note_stamp(&mut self, key: &VariableKey) {
        match key {
            VariableKey::Pose(s)
            | VariableKey::Velocity(s)
            | VariableKey::GyroBias(s)
            | VariableKey::AccelBias(s) => {
                self.involved_stamps.insert(*s);
            }
            VariableKey::Landmark(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transaction_is_noop() {
        let tx = Transaction::new(0);
        assert!(tx.is_empty());
    }

    #[test]
    fn involved_stamps_collected_from_variables_and_constraints() {
        let mut tx = Transaction::new(5);
        tx.add_pose_variable(10, Pose3D::identity());
        tx.add_relative_pose_constraint(10, 20, Pose3D::identity(), Matrix6::identity(), "T");
        assert_eq!(
            tx.involved_stamps.iter().copied().collect::<Vec<_>>(),
            vec![10, 20]
        );
    }

    #[test]
    fn merge_combines_mutations() {
        let mut a = Transaction::new(0);
        a.add_pose_variable(1, Pose3D::identity());
        let mut b = Transaction::new(1);
        b.add_pose_variable(2, Pose3D::identity());
        b.set_overrides(true, false);
        a.merge(b);
        assert_eq!(a.variables().len(), 2);
        assert!(a.override_constraints);
    }
}
