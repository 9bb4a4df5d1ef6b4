//! Run persistence.
//!
//! Layout per run directory:
//!
//! ```text
//! params.json  camera_model.json  extrinsics.json  frame_ids.json
//! submap_0/
//!   anchor.json  lidar.pcd  edges_strong.pcd  edges_weak.pcd
//!   surfaces_strong.pcd  surfaces_weak.pcd  keypoints.pcd  trajectory.json
//! submap_1/ ...
//! global_map_trajectory_optimized.json  global_map_trajectory_optimized.pcd
//! global_map_trajectory_initial.json    global_map_trajectory_initial.pcd
//! ```
//!
//! All JSON is pretty-printed with stable field order and all PCD output is
//! fixed-precision, so saving, loading, and saving again reproduces the
//! files byte for byte.

pub mod pcd;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use triveni_core::{FrameIds, PointCloud3D, Pose3D};

use crate::config::CoreParams;
use crate::global_map::{Keypoint, Submap};
use crate::vision::PinholeCamera;

pub use pcd::{load_pcd, save_pcd};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("format error: {0}")]
    Format(String),
}

/// Contents of `anchor.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnchorFile {
    anchor_stamp_us: u64,
    t_world_submap_initial: Pose3D,
    t_world_submap: Pose3D,
    keypoint_landmark_ids: Vec<u64>,
    keypoint_word_ids: Vec<Option<u32>>,
}

/// Contents of the extrinsics file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtrinsicsFile {
    transforms: Vec<ExtrinsicEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtrinsicEntry {
    from: String,
    to: String,
    transform: Pose3D,
}

/// A world-frame trajectory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrajectoryFile {
    poses: BTreeMap<u64, Pose3D>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IoError> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, IoError> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

/// Persist the run's static context.
pub fn save_run_info(
    dir: &Path,
    params: &CoreParams,
    camera: &PinholeCamera,
    extrinsics: &[(String, String, Pose3D)],
    frame_ids: &FrameIds,
) -> Result<(), IoError> {
    std::fs::create_dir_all(dir)?;
    write_json(&dir.join("params.json"), params)?;
    write_json(&dir.join("camera_model.json"), camera)?;

    let mut transforms: Vec<ExtrinsicEntry> = extrinsics
        .iter()
        .map(|(from, to, transform)| ExtrinsicEntry {
            from: from.clone(),
            to: to.clone(),
            transform: *transform,
        })
        .collect();
    transforms.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
    write_json(&dir.join("extrinsics.json"), &ExtrinsicsFile { transforms })?;

    write_json(&dir.join("frame_ids.json"), frame_ids)?;
    Ok(())
}

/// Load the run's configuration back.
pub fn load_run_info(dir: &Path) -> Result<(CoreParams, PinholeCamera, FrameIds), IoError> {
    let params = read_json(&dir.join("params.json"))?;
    let camera = read_json(&dir.join("camera_model.json"))?;
    let frame_ids = read_json(&dir.join("frame_ids.json"))?;
    Ok((params, camera, frame_ids))
}

/// Persist all submaps plus the global trajectories.
pub fn save_global_map(dir: &Path, submaps: &[Submap]) -> Result<(), IoError> {
    std::fs::create_dir_all(dir)?;

    for (k, submap) in submaps.iter().enumerate() {
        let submap_dir = dir.join(format!("submap_{k}"));
        std::fs::create_dir_all(&submap_dir)?;

        write_json(
            &submap_dir.join("anchor.json"),
            &AnchorFile {
                anchor_stamp_us: submap.anchor_stamp_us,
                t_world_submap_initial: submap.t_world_submap_initial(),
                t_world_submap: submap.t_world_submap(),
                keypoint_landmark_ids: submap.keypoints.iter().map(|kp| kp.landmark_id).collect(),
                keypoint_word_ids: submap.keypoints.iter().map(|kp| kp.word_id).collect(),
            },
        )?;

        save_pcd(&submap.lidar_points, &submap_dir.join("lidar.pcd"))?;
        save_pcd(&submap.loam.edges_strong, &submap_dir.join("edges_strong.pcd"))?;
        save_pcd(&submap.loam.edges_weak, &submap_dir.join("edges_weak.pcd"))?;
        save_pcd(
            &submap.loam.surfaces_strong,
            &submap_dir.join("surfaces_strong.pcd"),
        )?;
        save_pcd(
            &submap.loam.surfaces_weak,
            &submap_dir.join("surfaces_weak.pcd"),
        )?;

        let keypoint_cloud = PointCloud3D::from_points(
            submap.keypoints.iter().map(|kp| kp.position).collect(),
        );
        save_pcd(&keypoint_cloud, &submap_dir.join("keypoints.pcd"))?;

        write_json(
            &submap_dir.join("trajectory.json"),
            &TrajectoryFile {
                poses: submap.keyframe_trajectory.clone(),
            },
        )?;
    }

    save_trajectory(dir, submaps, false)?;
    save_trajectory(dir, submaps, true)?;
    Ok(())
}

fn save_trajectory(dir: &Path, submaps: &[Submap], initial: bool) -> Result<(), IoError> {
    let suffix = if initial { "initial" } else { "optimized" };

    let mut poses = BTreeMap::new();
    let mut cloud = PointCloud3D::new();
    for submap in submaps {
        let anchor = if initial {
            submap.t_world_submap_initial()
        } else {
            submap.t_world_submap()
        };
        for (stamp, t_submap_baselink) in &submap.keyframe_trajectory {
            poses.insert(*stamp, anchor.compose(t_submap_baselink));
        }
        // Quantize to the submap files' precision first so the derived
        // global cloud is identical whether built from live or reloaded
        // submaps.
        cloud.extend(&quantize(&submap.lidar_points).transform(&anchor));
    }

    write_json(
        &dir.join(format!("global_map_trajectory_{suffix}.json")),
        &TrajectoryFile { poses },
    )?;
    save_pcd(
        &cloud,
        &dir.join(format!("global_map_trajectory_{suffix}.pcd")),
    )?;
    Ok(())
}

/// Round coordinates to the PCD writer's fixed precision.
fn quantize(cloud: &PointCloud3D) -> PointCloud3D {
    PointCloud3D::from_points(
        cloud
            .points
            .iter()
            .map(|p| p.map(|v| (v * 1e6).round() / 1e6))
            .collect(),
    )
}

/// Load submaps saved by [`save_global_map`].
pub fn load_global_map(dir: &Path) -> Result<Vec<Submap>, IoError> {
    let mut submaps = Vec::new();
    for k in 0.. {
        let submap_dir = dir.join(format!("submap_{k}"));
        if !submap_dir.is_dir() {
            break;
        }

        let anchor: AnchorFile = read_json(&submap_dir.join("anchor.json"))?;
        let mut submap = Submap::new(anchor.anchor_stamp_us, anchor.t_world_submap_initial);
        submap.set_anchor_pose(anchor.t_world_submap);

        submap.lidar_points = load_pcd(&submap_dir.join("lidar.pcd"))?;
        submap.loam.edges_strong = load_pcd(&submap_dir.join("edges_strong.pcd"))?;
        submap.loam.edges_weak = load_pcd(&submap_dir.join("edges_weak.pcd"))?;
        submap.loam.surfaces_strong = load_pcd(&submap_dir.join("surfaces_strong.pcd"))?;
        submap.loam.surfaces_weak = load_pcd(&submap_dir.join("surfaces_weak.pcd"))?;

        let keypoint_cloud = load_pcd(&submap_dir.join("keypoints.pcd"))?;
        if keypoint_cloud.len() != anchor.keypoint_landmark_ids.len() {
            return Err(IoError::Format(format!(
                "submap_{k}: {} keypoints but {} landmark ids",
                keypoint_cloud.len(),
                anchor.keypoint_landmark_ids.len()
            )));
        }
        submap.keypoints = keypoint_cloud
            .points
            .iter()
            .zip(&anchor.keypoint_landmark_ids)
            .zip(&anchor.keypoint_word_ids)
            .map(|((position, landmark_id), word_id)| Keypoint {
                landmark_id: *landmark_id,
                position: *position,
                word_id: *word_id,
            })
            .collect();

        let trajectory: TrajectoryFile = read_json(&submap_dir.join("trajectory.json"))?;
        submap.keyframe_trajectory = trajectory.poses;

        submaps.push(submap);
    }
    Ok(submaps)
}
