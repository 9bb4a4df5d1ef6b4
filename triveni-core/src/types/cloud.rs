//! 3D point clouds and LOAM feature clouds.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::Pose3D;

/// A 3D point cloud in a single frame of reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud3D {
    /// Points in meters.
    pub points: Vec<Vector3<f64>>,
}

impl PointCloud3D {
    /// Create an empty cloud.
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Create from a vector of points.
    pub fn from_points(points: Vec<Vector3<f64>>) -> Self {
        Self { points }
    }

    /// Number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the cloud has no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Transform every point by `pose`, returning a new cloud.
    pub fn transform(&self, pose: &Pose3D) -> PointCloud3D {
        PointCloud3D {
            points: self
                .points
                .iter()
                .map(|p| pose.transform_point(p))
                .collect(),
        }
    }

    /// Append all points of `other`.
    pub fn extend(&mut self, other: &PointCloud3D) {
        self.points.extend_from_slice(&other.points);
    }

    /// Voxel-grid downsample with the given leaf size in meters.
    ///
    /// Keeps the centroid of each occupied voxel. A non-positive leaf size
    /// returns the cloud unchanged.
    pub fn voxel_downsample(&self, leaf_size: f64) -> PointCloud3D {
        if leaf_size <= 0.0 || self.points.is_empty() {
            return self.clone();
        }

        let mut voxels: HashMap<(i64, i64, i64), (Vector3<f64>, usize)> = HashMap::new();
        for p in &self.points {
            let key = (
                (p.x / leaf_size).floor() as i64,
                (p.y / leaf_size).floor() as i64,
                (p.z / leaf_size).floor() as i64,
            );
            let entry = voxels.entry(key).or_insert((Vector3::zeros(), 0));
            entry.0 += p;
            entry.1 += 1;
        }

        let mut points: Vec<Vector3<f64>> = voxels
            .into_values()
            .map(|(sum, n)| sum / n as f64)
            .collect();
        // HashMap iteration order is unstable; sort for reproducible output.
        points.sort_by(|a, b| {
            (a.x, a.y, a.z)
                .partial_cmp(&(b.x, b.y, b.z))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        PointCloud3D { points }
    }

    /// Centroid of the cloud, or `None` if empty.
    pub fn centroid(&self) -> Option<Vector3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = self.points.iter().sum();
        Some(sum / self.points.len() as f64)
    }
}

/// Point cloud split into the four LOAM feature categories.
///
/// Feature-based lidar matchers operate on sharp edges and planar surfaces
/// rather than raw points; each category is further divided into a strong and
/// a weak set by curvature score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoamFeatureClouds {
    pub edges_strong: PointCloud3D,
    pub edges_weak: PointCloud3D,
    pub surfaces_strong: PointCloud3D,
    pub surfaces_weak: PointCloud3D,
}

impl LoamFeatureClouds {
    /// Whether all four categories are empty.
    pub fn is_empty(&self) -> bool {
        self.edges_strong.is_empty()
            && self.edges_weak.is_empty()
            && self.surfaces_strong.is_empty()
            && self.surfaces_weak.is_empty()
    }

    /// Total number of feature points.
    pub fn len(&self) -> usize {
        self.edges_strong.len()
            + self.edges_weak.len()
            + self.surfaces_strong.len()
            + self.surfaces_weak.len()
    }

    /// Transform all four clouds by `pose`.
    pub fn transform(&self, pose: &Pose3D) -> LoamFeatureClouds {
        LoamFeatureClouds {
            edges_strong: self.edges_strong.transform(pose),
            edges_weak: self.edges_weak.transform(pose),
            surfaces_strong: self.surfaces_strong.transform(pose),
            surfaces_weak: self.surfaces_weak.transform(pose),
        }
    }

    /// Merge all categories into one raw cloud.
    pub fn merged(&self) -> PointCloud3D {
        let mut out = self.edges_strong.clone();
        out.extend(&self.edges_weak);
        out.extend(&self.surfaces_strong);
        out.extend(&self.surfaces_weak);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn transform_rotates_points() {
        let cloud = PointCloud3D::from_points(vec![Vector3::new(1.0, 0.0, 0.0)]);
        let pose = Pose3D::from_parts(Vector3::new(0.0, 0.0, FRAC_PI_2), Vector3::zeros());
        let out = cloud.transform(&pose);
        assert_relative_eq!(out.points[0], Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn voxel_downsample_merges_close_points() {
        let cloud = PointCloud3D::from_points(vec![
            Vector3::new(0.01, 0.01, 0.0),
            Vector3::new(0.02, 0.02, 0.0),
            Vector3::new(5.0, 5.0, 5.0),
        ]);
        let down = cloud.voxel_downsample(0.1);
        assert_eq!(down.len(), 2);
    }

    #[test]
    fn voxel_downsample_zero_leaf_is_noop() {
        let cloud = PointCloud3D::from_points(vec![Vector3::new(1.0, 2.0, 3.0)]);
        assert_eq!(cloud.voxel_downsample(0.0), cloud);
    }

    #[test]
    fn loam_merged_counts() {
        let mut loam = LoamFeatureClouds::default();
        loam.edges_strong.points.push(Vector3::zeros());
        loam.surfaces_weak.points.push(Vector3::zeros());
        assert_eq!(loam.len(), 2);
        assert_eq!(loam.merged().len(), 2);
    }
}
