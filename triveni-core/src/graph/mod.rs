//! Transactional factor graph.
//!
//! Variables are keyed by `(kind, stamp)`, landmarks by `(kind, id)`, so
//! that submaps, keyframes, and the landmark table can refer to each other by
//! index instead of by reference. All mutation goes through [`Transaction`]s,
//! which are applied atomically; producers never touch the graph directly.

mod constraint;
mod optimizer;
mod transaction;

pub use constraint::{
    Constraint, ConstraintIdentity, ConstraintKind, Matrix6, PinholeIntrinsics, ResidualBlock,
};
pub use optimizer::{OptimizationResult, OptimizerConfig, TerminationReason};
pub use transaction::Transaction;

use std::collections::{BTreeMap, HashMap};

use nalgebra::{UnitQuaternion, Vector3};
use thiserror::Error;

use crate::types::{ImuState, Pose3D};

/// Key of a variable in the graph.
///
/// The payload is a microsecond stamp for all state variables and a landmark
/// id for landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableKey {
    /// Baselink pose `T_world_baselink` at a stamp.
    Pose(u64),
    /// World-frame linear velocity at a stamp.
    Velocity(u64),
    /// Gyroscope bias at a stamp.
    GyroBias(u64),
    /// Accelerometer bias at a stamp.
    AccelBias(u64),
    /// World-space landmark position, keyed by landmark id.
    Landmark(u64),
}

/// Value of a variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VariableValue {
    Pose(Pose3D),
    Vec3(Vector3<f64>),
}

impl VariableValue {
    /// Dimension of the local (tangent) parameterization.
    #[inline]
    pub fn local_dim(&self) -> usize {
        match self {
            VariableValue::Pose(_) => 6,
            VariableValue::Vec3(_) => 3,
        }
    }

    /// Apply a tangent-space update: `x ← x ⊞ δ`.
    ///
    /// Poses use a right-multiplicative rotation update and an additive
    /// world-frame translation update, ordered (δφ, δp).
    pub fn retract(&mut self, delta: &[f64]) {
        match self {
            VariableValue::Pose(pose) => {
                let phi = Vector3::new(delta[0], delta[1], delta[2]);
                pose.rotation *= UnitQuaternion::from_scaled_axis(phi);
                pose.translation += Vector3::new(delta[3], delta[4], delta[5]);
            }
            VariableValue::Vec3(v) => {
                *v += Vector3::new(delta[0], delta[1], delta[2]);
            }
        }
    }

    /// The pose payload, if this is a pose variable.
    pub fn as_pose(&self) -> Option<Pose3D> {
        match self {
            VariableValue::Pose(p) => Some(*p),
            _ => None,
        }
    }

    /// The vector payload, if this is a vector variable.
    pub fn as_vec3(&self) -> Option<Vector3<f64>> {
        match self {
            VariableValue::Vec3(v) => Some(*v),
            _ => None,
        }
    }
}

/// Errors from transaction application.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// A constraint references a variable the graph does not hold.
    #[error("constraint from source '{constraint_source}' references missing variable {key:?}")]
    MissingVariable {
        key: VariableKey,
        constraint_source: String,
    },
    /// A variable value has the wrong payload type for its key.
    #[error("variable {key:?} carries a mismatched value type")]
    TypeMismatch { key: VariableKey },
}

/// The factor graph: variables plus constraints, mutated via transactions.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    variables: BTreeMap<VariableKey, VariableValue>,
    constraints: Vec<Constraint>,
    by_identity: HashMap<ConstraintIdentity, usize>,
}

impl FactorGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables.
    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    /// Number of constraints.
    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Iterate over all variables in key order.
    pub fn variables(&self) -> impl Iterator<Item = (&VariableKey, &VariableValue)> {
        self.variables.iter()
    }

    /// Iterate over all constraints.
    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    /// Look up a variable.
    pub fn get(&self, key: &VariableKey) -> Option<&VariableValue> {
        self.variables.get(key)
    }

    /// Whether the graph holds a variable.
    pub fn contains(&self, key: &VariableKey) -> bool {
        self.variables.contains_key(key)
    }

    /// Pose variable at a stamp.
    pub fn pose(&self, stamp_us: u64) -> Option<Pose3D> {
        self.variables
            .get(&VariableKey::Pose(stamp_us))
            .and_then(|v| v.as_pose())
    }

    /// Velocity variable at a stamp.
    pub fn velocity(&self, stamp_us: u64) -> Option<Vector3<f64>> {
        self.variables
            .get(&VariableKey::Velocity(stamp_us))
            .and_then(|v| v.as_vec3())
    }

    /// Gyro bias variable at a stamp.
    pub fn gyro_bias(&self, stamp_us: u64) -> Option<Vector3<f64>> {
        self.variables
            .get(&VariableKey::GyroBias(stamp_us))
            .and_then(|v| v.as_vec3())
    }

    /// Accel bias variable at a stamp.
    pub fn accel_bias(&self, stamp_us: u64) -> Option<Vector3<f64>> {
        self.variables
            .get(&VariableKey::AccelBias(stamp_us))
            .and_then(|v| v.as_vec3())
    }

    /// Landmark position by id.
    pub fn landmark(&self, id: u64) -> Option<Vector3<f64>> {
        self.variables
            .get(&VariableKey::Landmark(id))
            .and_then(|v| v.as_vec3())
    }

    /// Assemble the full inertial state at a stamp, if all four variables
    /// are present.
    pub fn imu_state(&self, stamp_us: u64) -> Option<ImuState> {
        let pose = self.pose(stamp_us)?;
        Some(ImuState {
            timestamp_us: stamp_us,
            orientation: pose.rotation,
            position: pose.translation,
            velocity: self.velocity(stamp_us)?,
            bias: crate::types::ImuBias {
                gyro: self.gyro_bias(stamp_us)?,
                accel: self.accel_bias(stamp_us)?,
            },
        })
    }

    /// All pose stamps currently in the graph, ascending.
    pub fn pose_stamps(&self) -> Vec<u64> {
        self.variables
            .keys()
            .filter_map(|k| match k {
                VariableKey::Pose(stamp) => Some(*stamp),
                _ => None,
            })
            .collect()
    }

    /// Apply a transaction atomically.
    ///
    /// Tombstones are processed first, then variables, then constraints.
    /// Without the override flags, additions that collide with existing
    /// variables or constraint identities keep the existing entry; with the
    /// flags set they replace it in place, never duplicating.
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), GraphError> {
        for key in tx.removed_variables() {
            self.variables.remove(key);
        }
        for identity in tx.removed_constraints() {
            self.remove_constraint(identity);
        }

        for (key, value) in tx.variables() {
            if !key_matches_value(key, value) {
                return Err(GraphError::TypeMismatch { key: *key });
            }
            match self.variables.entry(*key) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(*value);
                }
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    if tx.override_variables {
                        e.insert(*value);
                    } else {
                        log::debug!("variable {:?} already in graph, keeping existing", key);
                    }
                }
            }
        }

        for constraint in tx.constraints() {
            let identity = constraint.identity();
            match self.by_identity.get(&identity) {
                Some(&idx) => {
                    if tx.override_constraints {
                        self.constraints[idx] = constraint.clone();
                    } else {
                        log::debug!(
                            "constraint {:?} from '{}' already in graph, keeping existing",
                            identity.kind,
                            identity.source
                        );
                    }
                }
                None => {
                    self.by_identity.insert(identity, self.constraints.len());
                    self.constraints.push(constraint.clone());
                }
            }
        }

        // Validate after all additions so intra-transaction ordering is free.
        for constraint in self.constraints.iter() {
            for key in constraint.involved() {
                if !self.variables.contains_key(&key) {
                    return Err(GraphError::MissingVariable {
                        key,
                        constraint_source: constraint.source.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn remove_constraint(&mut self, identity: &ConstraintIdentity) {
        if let Some(idx) = self.by_identity.remove(identity) {
            self.constraints.swap_remove(idx);
            if idx < self.constraints.len() {
                let moved = self.constraints[idx].identity();
                self.by_identity.insert(moved, idx);
            }
        }
    }

    /// Run the optimizer over the current graph.
    pub fn optimize(&mut self, config: &OptimizerConfig) -> OptimizationResult {
        optimizer::optimize(self, config)
    }

    pub(crate) fn set_value(&mut self, key: VariableKey, value: VariableValue) {
        self.variables.insert(key, value);
    }

    pub(crate) fn values_snapshot(&self) -> BTreeMap<VariableKey, VariableValue> {
        self.variables.clone()
    }

    pub(crate) fn restore_values(&mut self, snapshot: BTreeMap<VariableKey, VariableValue>) {
        self.variables = snapshot;
    }
}

fn key_matches_value(key: &VariableKey, value: &VariableValue) -> bool {
    matches!(
        (key, value),
        (VariableKey::Pose(_), VariableValue::Pose(_))
            | (VariableKey::Velocity(_), VariableValue::Vec3(_))
            | (VariableKey::GyroBias(_), VariableValue::Vec3(_))
            | (VariableKey::AccelBias(_), VariableValue::Vec3(_))
            | (VariableKey::Landmark(_), VariableValue::Vec3(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_rejects_dangling_constraint() {
        let mut tx = Transaction::new(0);
        tx.add_pose_prior(7, Pose3D::identity(), Matrix6::identity(), "TEST");
        let mut graph = FactorGraph::new();
        assert!(matches!(
            graph.apply(&tx),
            Err(GraphError::MissingVariable { .. })
        ));
    }

    #[test]
    fn apply_twice_with_override_is_idempotent() {
        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, Pose3D::identity());
        tx.add_pose_prior(0, Pose3D::identity(), Matrix6::identity(), "TEST");
        tx.set_overrides(true, true);

        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();
        let first = format!("{:?}", graph);
        graph.apply(&tx).unwrap();
        let second = format!("{:?}", graph);

        assert_eq!(first, second);
        assert_eq!(graph.num_constraints(), 1);
        assert_eq!(graph.num_variables(), 1);
    }

    #[test]
    fn tombstone_removes_constraint() {
        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, Pose3D::identity());
        tx.add_pose_prior(0, Pose3D::identity(), Matrix6::identity(), "TEST");

        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();
        assert_eq!(graph.num_constraints(), 1);

        let identity = graph.constraints().next().unwrap().identity();
        let mut removal = Transaction::new(1);
        removal.remove_constraint(identity);
        graph.apply(&removal).unwrap();
        assert_eq!(graph.num_constraints(), 0);
    }
}
