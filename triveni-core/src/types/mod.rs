//! Core types for the TriveniSLAM back-end.
//!
//! All poses follow the ROS REP-103 convention (X forward, Y left, Z up) and
//! are expressed as `T_world_frame` transforms unless a name says otherwise.
//! Timestamps are `u64` microseconds since an arbitrary epoch and are strictly
//! monotonic per sensor stream.

mod cloud;
mod imu;
mod pose;
mod timestamped;

pub use cloud::{LoamFeatureClouds, PointCloud3D};
pub use imu::{
    ImuBias, ImuNoise, ImuSample, ImuState, Matrix15, PreintegratedDelta, GRAVITY_WORLD,
};
pub use pose::Pose3D;
pub use timestamped::Timestamped;
