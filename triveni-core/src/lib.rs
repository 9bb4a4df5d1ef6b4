//! TriveniCore - Foundation layer for the TriveniSLAM back-end
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    graph/                           │  ← Factor graph
//! │       (variables, transactions, optimizer)          │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                 extrinsics                          │  ← Frame registry
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                types/ + so3                         │  ← Foundation
//! │        (poses, clouds, IMU, Lie algebra)            │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The crate holds everything the sensor front-ends and the estimator share:
//! 3D pose and point-cloud types, IMU sample/state/delta containers, SO(3)
//! Jacobians, the transactional factor graph with its Levenberg-Marquardt
//! optimizer, and the process-wide extrinsics registry.

// ============================================================================
// Layer 1: Foundation (no internal deps)
// ============================================================================
pub mod so3;
pub mod types;

// ============================================================================
// Layer 2: Shared services (depends on types)
// ============================================================================
pub mod extrinsics;

// ============================================================================
// Layer 3: Factor graph (depends on types, so3)
// ============================================================================
pub mod graph;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

pub use so3::{right_jacobian_so3, right_jacobian_so3_inv, skew};
pub use types::{
    ImuBias, ImuNoise, ImuSample, ImuState, LoamFeatureClouds, Matrix15, PointCloud3D, Pose3D,
    PreintegratedDelta, Timestamped, GRAVITY_WORLD,
};

pub use extrinsics::{ExtrinsicsError, ExtrinsicsRegistry, FrameIds, TransformSource};

pub use graph::{
    Constraint, ConstraintIdentity, ConstraintKind, FactorGraph, GraphError, Matrix6,
    OptimizationResult, OptimizerConfig, PinholeIntrinsics, TerminationReason, Transaction,
    VariableKey, VariableValue,
};
