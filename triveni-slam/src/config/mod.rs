//! Configuration for the SLAM back-end.
//!
//! Sections mirror the subsystem split: IMU, vision, lidar, initializer, and
//! global map. Every field has a serde default so a partial `params.json`
//! parses; unknown top-level keys are rejected. Validation failures are fatal
//! at startup.

mod error;

pub use error::ConfigLoadError;

use std::path::Path;

use serde::{Deserialize, Serialize};

use triveni_core::Matrix6;

/// Top-level configuration recognized by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreParams {
    #[serde(default)]
    pub imu: ImuSection,
    #[serde(default)]
    pub vision: VisionSection,
    #[serde(default)]
    pub lidar: LidarSection,
    #[serde(default)]
    pub init: InitSection,
    #[serde(default)]
    pub global_map: GlobalMapSection,
}

/// IMU noise densities and the first-state prior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuSection {
    /// Gyroscope measurement noise (rad/s/√Hz).
    pub sigma_gyro: f64,
    /// Accelerometer measurement noise (m/s²/√Hz).
    pub sigma_accel: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub sigma_gyro_walk: f64,
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub sigma_accel_walk: f64,
    /// Diagonal covariance of the prior placed on the first IMU state.
    /// Must be positive.
    pub cov_prior_noise: f64,
    /// Maximum tolerated gap between consecutive samples (seconds).
    pub max_sample_gap_s: f64,
}

impl Default for ImuSection {
    fn default() -> Self {
        Self {
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
            sigma_gyro_walk: 1.9e-5,
            sigma_accel_walk: 3.0e-3,
            cov_prior_noise: 1e-4,
            max_sample_gap_s: 0.1,
        }
    }
}

/// Visual front-end tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionSection {
    /// Minimum time between keyframes (seconds).
    pub keyframe_min_time_in_seconds: f64,
    /// Mean pixel parallax that forces a keyframe.
    pub keyframe_parallax: f64,
    /// Keyframe is forced when the triangulated track count drops below this.
    pub keyframe_tracks_drop: usize,
    /// Sliding-window size in keyframes.
    pub window_size: usize,
    /// Number of features the external tracker is asked to maintain.
    pub num_features_to_track: usize,
    /// Descriptor family name, e.g. "ORB". Consumed by the embedding
    /// application's tracker factory; the core records it with the run.
    pub descriptor: String,
    /// Square-root information applied to reprojection residuals.
    pub reprojection_information_weight: f64,
    /// Landmarks triangulated farther than this are rejected (meters).
    pub max_triangulation_distance: f64,
    /// RANSAC iterations for PnP localization.
    pub pnp_ransac_iterations: usize,
    /// Inlier threshold for PnP RANSAC (pixels).
    pub pnp_inlier_threshold_px: f64,
    /// Wall-clock budget for motion-only refinement (seconds).
    pub refinement_time_budget_s: f64,
}

impl Default for VisionSection {
    fn default() -> Self {
        Self {
            keyframe_min_time_in_seconds: 0.2,
            keyframe_parallax: 20.0,
            keyframe_tracks_drop: 40,
            window_size: 10,
            num_features_to_track: 300,
            descriptor: "ORB".to_string(),
            reprojection_information_weight: 1.0,
            max_triangulation_distance: 40.0,
            pnp_ransac_iterations: 100,
            pnp_inlier_threshold_px: 4.0,
            refinement_time_budget_s: 0.01,
        }
    }
}

/// Which lidar registration flavor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationType {
    #[serde(rename = "MULTISCAN")]
    MultiScan,
    #[serde(rename = "SCANTOMAP")]
    ScanToMap,
}

/// Lidar registration tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LidarSection {
    /// Registration flavor, decided at startup.
    pub registration_type: RegistrationType,
    /// Window duration for multi-scan registration (seconds, 0 = never drop).
    pub lag_duration: f64,
    /// Neighbors each new scan is registered against.
    pub num_neighbors: usize,
    /// Reject a match whose translation residual exceeds this (meters).
    pub outlier_threshold_t: f64,
    /// Reject a match whose rotation residual exceeds this (radians).
    pub outlier_threshold_r: f64,
    /// Minimum translation since the previous scan (meters).
    pub min_motion_trans_m: f64,
    /// Minimum rotation since the previous scan (radians).
    pub min_motion_rot_rad: f64,
    /// Place a pose prior on the first scan.
    pub fix_first_scan: bool,
    /// Voxel leaf size applied to incoming scans (meters, 0 = off).
    pub downsample_size: f64,
    /// Scans kept in the rolling map for scan-to-map registration.
    pub map_size: usize,
    /// Keep full-resolution clouds in scan poses.
    pub store_full_cloud: bool,
    /// Matcher tag, e.g. "ICP".
    pub matcher: String,
    /// Optional matcher parameter file.
    pub matcher_params_path: String,
    /// Six-value diagonal used when the matcher reports no covariance,
    /// ordered (rotation xyz, translation xyz).
    pub matcher_noise_diagonal: [f64; 6],
    /// Scale applied to lidar constraint information.
    pub lidar_information_weight: f64,
}

impl Default for LidarSection {
    fn default() -> Self {
        Self {
            registration_type: RegistrationType::MultiScan,
            lag_duration: 0.0,
            num_neighbors: 3,
            outlier_threshold_t: 0.3,
            outlier_threshold_r: 0.3,
            min_motion_trans_m: 0.05,
            min_motion_rot_rad: 0.02,
            fix_first_scan: true,
            downsample_size: 0.1,
            map_size: 10,
            store_full_cloud: true,
            matcher: "ICP".to_string(),
            matcher_params_path: String::new(),
            matcher_noise_diagonal: [1e-4; 6],
            lidar_information_weight: 1.0,
        }
    }
}

/// How the trajectory initializer bootstraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitMode {
    #[serde(rename = "VISUAL")]
    Visual,
    #[serde(rename = "LIDAR")]
    Lidar,
    #[serde(rename = "FRAMEINIT")]
    FrameInit,
}

/// Trajectory initializer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitSection {
    pub init_mode: InitMode,
    /// Wall-clock budget for the local optimization (seconds).
    pub max_optimization_s: f64,
    /// Minimum trajectory length before attempting initialization (meters).
    pub min_trajectory_length_m: f64,
    /// Minimum mean parallax for the pure visual mode (pixels).
    pub min_visual_parallax: f64,
    /// Length of the accumulation window (seconds).
    pub initialization_window_s: f64,
    /// Scale applied to inertial constraint information during init.
    pub inertial_info_weight: f64,
}

impl Default for InitSection {
    fn default() -> Self {
        Self {
            init_mode: InitMode::Visual,
            max_optimization_s: 5.0,
            min_trajectory_length_m: 2.0,
            min_visual_parallax: 15.0,
            initialization_window_s: 10.0,
            inertial_info_weight: 1.0,
        }
    }
}

/// Candidate search strategy for loop closure and relocalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateSearchType {
    #[serde(rename = "EUCDIST")]
    EuclideanDistance,
}

/// Refinement strategy for loop closure and relocalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefinementType {
    #[serde(rename = "ICP")]
    Icp,
    #[serde(rename = "GICP")]
    Gicp,
    #[serde(rename = "NDT")]
    Ndt,
    #[serde(rename = "LOAM")]
    Loam,
}

/// Submap and loop-closure tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalMapSection {
    /// Submap radius (meters). A new submap starts when the baselink leaves
    /// this radius around both the previous and current anchors.
    pub submap_size: f64,
    /// Covariance diagonal of anchor-to-anchor constraints,
    /// ordered (rotation xyz, translation xyz).
    pub local_mapper_covariance_diag: [f64; 6],
    /// Covariance diagonal of loop-closure and reloc constraints.
    pub reloc_covariance_diag: [f64; 6],
    pub reloc_candidate_search_type: CandidateSearchType,
    pub reloc_refinement_type: RefinementType,
    /// Anchor distance below which submaps become loop candidates (meters).
    pub candidate_search_distance_m: f64,
    /// Refinement is discarded when it moves the estimate further than this
    /// (meters).
    pub refinement_max_correction_m: f64,
}

impl Default for GlobalMapSection {
    fn default() -> Self {
        Self {
            submap_size: 10.0,
            local_mapper_covariance_diag: [1e-4; 6],
            reloc_covariance_diag: [1e-3; 6],
            reloc_candidate_search_type: CandidateSearchType::EuclideanDistance,
            reloc_refinement_type: RefinementType::Icp,
            candidate_search_distance_m: 5.0,
            refinement_max_correction_m: 2.0,
        }
    }
}

impl CoreParams {
    /// Load and validate a params file.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read_to_string(path)?;
        let params: CoreParams = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.imu.cov_prior_noise <= 0.0 {
            return Err(ConfigLoadError::Validation(
                "imu.cov_prior_noise must be positive".to_string(),
            ));
        }
        if self.imu.max_sample_gap_s <= 0.0 {
            return Err(ConfigLoadError::Validation(
                "imu.max_sample_gap_s must be positive".to_string(),
            ));
        }
        if self.vision.window_size < 2 {
            return Err(ConfigLoadError::Validation(
                "vision.window_size must be at least 2".to_string(),
            ));
        }
        if self.lidar.num_neighbors == 0 {
            return Err(ConfigLoadError::Validation(
                "lidar.num_neighbors must be at least 1".to_string(),
            ));
        }
        if self.lidar.map_size == 0 {
            return Err(ConfigLoadError::Validation(
                "lidar.map_size must be at least 1".to_string(),
            ));
        }
        if self.global_map.submap_size <= 0.0 {
            return Err(ConfigLoadError::Validation(
                "global_map.submap_size must be positive".to_string(),
            ));
        }
        if self.init.max_optimization_s <= 0.0 {
            return Err(ConfigLoadError::Validation(
                "init.max_optimization_s must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Build a 6×6 covariance from a (rotation xyz, translation xyz) diagonal.
pub fn covariance_from_diagonal(diag: &[f64; 6]) -> Matrix6 {
    let mut cov = Matrix6::zeros();
    for (i, v) in diag.iter().enumerate() {
        cov[(i, i)] = *v;
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        CoreParams::default().validate().unwrap();
    }

    #[test]
    fn empty_json_parses_to_defaults() {
        let params: CoreParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.lidar.num_neighbors, 3);
        assert_eq!(params.global_map.submap_size, 10.0);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        assert!(serde_json::from_str::<CoreParams>(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn enum_tags_parse() {
        let params: CoreParams = serde_json::from_str(
            r#"{"lidar": {"registration_type": "SCANTOMAP"},
                "global_map": {"reloc_refinement_type": "GICP"}}"#,
        )
        .unwrap();
        assert_eq!(params.lidar.registration_type, RegistrationType::ScanToMap);
        assert_eq!(
            params.global_map.reloc_refinement_type,
            RefinementType::Gicp
        );
    }

    #[test]
    fn nonpositive_prior_noise_fails_validation() {
        let mut params = CoreParams::default();
        params.imu.cov_prior_noise = 0.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn covariance_diagonal_roundtrip() {
        let cov = covariance_from_diagonal(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(cov[(0, 0)], 1.0);
        assert_eq!(cov[(5, 5)], 6.0);
        assert_eq!(cov[(0, 1)], 0.0);
    }
}
