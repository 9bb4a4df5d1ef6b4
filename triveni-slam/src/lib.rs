//! TriveniSLAM - Multi-sensor SLAM back-end
//!
//! Fuses asynchronous camera, IMU, and lidar streams into a globally
//! consistent trajectory and map: a sliding-window factor-graph estimator
//! fed by three sensor front-ends, with the optimized trajectory
//! consolidated into submaps that participate in loop closure and
//! relocalization.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  global_map/                        │  ← Submaps, loops
//! │           (submaps, loop closure, reloc)            │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              estimator + init/                      │  ← Orchestration
//! │       (transaction queue, trajectory bootstrap)     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │           imu/ + vision/ + lidar/                   │  ← Front-ends
//! │   (preintegration, tracking, scan registration)     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              config/ + error + io/                  │  ← Infrastructure
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Shared foundation types and the factor graph itself live in
//! [`triveni_core`].
//!
//! # Data flow
//!
//! Front-ends never mutate the graph: they produce
//! [`Transaction`](triveni_core::Transaction)s consumed by the
//! [`Estimator`], and read back immutable snapshots after each
//! optimization through their `update_from_graph` methods.

pub mod config;
pub mod error;

pub mod imu;
pub mod lidar;
pub mod vision;

pub mod estimator;
pub mod init;

pub mod global_map;

pub mod io;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

pub use config::{
    CandidateSearchType, ConfigLoadError, CoreParams, GlobalMapSection, ImuSection, InitMode,
    InitSection, LidarSection, RefinementType, RegistrationType, VisionSection,
};
pub use error::{ErrorKind, SlamError, WarnThrottle};

pub use imu::{ImuPreintegration, Preintegrator};
pub use lidar::{
    IcpConfig, Matcher, MultiScanRegistration, PointToPointIcp3D, ScanPose, ScanToMapRegistration,
};
pub use vision::{
    FeatureTracker, ImageFrame, Landmark, Localization, PinholeCamera, TrackTable, VisualFrontend,
    VisualMap,
};

pub use estimator::{Estimator, EstimatorHandle};
pub use init::{InitializationResult, InitializedPath, SlamInitializer};

pub use global_map::{
    CandidateSearcher, GlobalMap, Keypoint, Refiner, RelocRequest, RelocResult, Submap,
    SubmapMessage,
};
