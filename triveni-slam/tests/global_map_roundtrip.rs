//! Global map persistence: save → load → save reproduces every file.

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::Vector3;

use triveni_core::{FrameIds, PointCloud3D, Pose3D};
use triveni_slam::io::{load_global_map, save_global_map, save_run_info};
use triveni_slam::{CoreParams, GlobalMap, GlobalMapSection, PinholeCamera};

fn structure() -> PointCloud3D {
    PointCloud3D::from_points(vec![
        Vector3::new(1.0, 2.0, 3.0),
        Vector3::new(-0.5, 0.25, 1.125),
        Vector3::new(0.333333, -0.666667, 9.81),
    ])
}

fn populated_map() -> GlobalMap {
    let mut map = GlobalMap::new(GlobalMapSection::default()).unwrap();
    let cloud = structure();
    for k in 0..25u64 {
        let pose = Pose3D::from_parts(
            Vector3::new(0.0, 0.0, k as f64 * 0.01),
            Vector3::new(k as f64, 0.2, 0.0),
        );
        map.add_measurement(
            &[(k, Vector3::new(k as f64, 1.0, 2.0), Some(k as u32))],
            Some(&cloud),
            None,
            pose,
            k * 250_000,
        );
    }
    map
}

fn read_tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(dir).unwrap().to_string_lossy().to_string();
                files.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    files
}

#[test]
fn save_load_save_is_byte_identical() {
    let map = populated_map();
    assert!(map.submaps().len() > 1);

    let first_dir = tempfile::tempdir().unwrap();
    save_global_map(first_dir.path(), map.submaps()).unwrap();

    let reloaded = load_global_map(first_dir.path()).unwrap();
    assert_eq!(reloaded.len(), map.submaps().len());

    let second_dir = tempfile::tempdir().unwrap();
    save_global_map(second_dir.path(), &reloaded).unwrap();

    let first = read_tree(first_dir.path());
    let second = read_tree(second_dir.path());
    assert_eq!(
        first.keys().collect::<Vec<_>>(),
        second.keys().collect::<Vec<_>>()
    );
    for (name, contents) in &first {
        assert_eq!(contents, &second[name], "file {name} differs");
    }
}

#[test]
fn loaded_submaps_preserve_geometry_and_ids() {
    let map = populated_map();
    let dir = tempfile::tempdir().unwrap();
    save_global_map(dir.path(), map.submaps()).unwrap();
    let reloaded = load_global_map(dir.path()).unwrap();

    for (original, loaded) in map.submaps().iter().zip(reloaded.iter()) {
        assert_eq!(original.anchor_stamp_us, loaded.anchor_stamp_us);
        assert_eq!(
            original.keyframe_trajectory.len(),
            loaded.keyframe_trajectory.len()
        );
        assert_eq!(original.keypoints.len(), loaded.keypoints.len());
        for (a, b) in original.keypoints.iter().zip(loaded.keypoints.iter()) {
            assert_eq!(a.landmark_id, b.landmark_id);
            assert_eq!(a.word_id, b.word_id);
            assert!((a.position - b.position).norm() < 1e-5);
        }
        assert_eq!(original.lidar_points.len(), loaded.lidar_points.len());
    }
}

#[test]
fn run_info_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let params = CoreParams::default();
    let camera = PinholeCamera {
        fx: 458.0,
        fy: 457.0,
        cx: 320.0,
        cy: 240.0,
        width: 640,
        height: 480,
    };
    let frame_ids = FrameIds::default();
    let extrinsics = vec![(
        "baselink".to_string(),
        "camera".to_string(),
        Pose3D::from_translation(Vector3::new(0.1, 0.0, 0.05)),
    )];

    save_run_info(dir.path(), &params, &camera, &extrinsics, &frame_ids).unwrap();
    let (loaded_params, loaded_camera, loaded_frame_ids) =
        triveni_slam::io::load_run_info(dir.path()).unwrap();

    assert_eq!(loaded_params.global_map.submap_size, params.global_map.submap_size);
    assert_eq!(loaded_camera, camera);
    assert_eq!(loaded_frame_ids, frame_ids);
}
