//! Point-cloud matcher capability and the point-to-point ICP implementation.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use triveni_core::{Matrix6, PointCloud3D, Pose3D};

use crate::error::SlamError;

/// Capability set of a rigid point-cloud matcher.
///
/// Usage: set the reference and target clouds, call [`Matcher::align`] with
/// an initial guess, then read [`Matcher::result`]. `result` is
/// `T_ref_target`: it maps target-frame points into the reference frame.
pub trait Matcher: Send {
    /// Set the reference (fixed) cloud.
    fn set_ref(&mut self, cloud: &PointCloud3D);
    /// Set the target (moving) cloud.
    fn set_target(&mut self, cloud: &PointCloud3D);
    /// Align target to reference starting from `initial`.
    fn align(&mut self, initial: &Pose3D) -> Result<(), SlamError>;
    /// The refined `T_ref_target` of the last successful alignment.
    fn result(&self) -> Pose3D;
    /// Information matrix of the last alignment, if the matcher estimates
    /// one.
    fn info(&self) -> Option<Matrix6>;
}

/// Configuration for point-to-point ICP.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Maximum number of iterations.
    pub max_iterations: u32,
    /// Convergence threshold on the incremental translation (meters).
    pub translation_epsilon: f64,
    /// Convergence threshold on the incremental rotation (radians).
    pub rotation_epsilon: f64,
    /// Correspondences farther apart than this are rejected (meters).
    pub max_correspondence_distance: f64,
    /// Minimum valid correspondences for a usable alignment.
    pub min_correspondences: usize,
    /// Fraction of the worst correspondences rejected each iteration.
    pub outlier_ratio: f64,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            translation_epsilon: 1e-5,
            rotation_epsilon: 1e-5,
            max_correspondence_distance: 1.0,
            min_correspondences: 10,
            outlier_ratio: 0.1,
        }
    }
}

/// Point-to-point ICP with a k-d tree for correspondence search.
pub struct PointToPointIcp3D {
    config: IcpConfig,
    reference: PointCloud3D,
    target: PointCloud3D,
    tree: Option<KdTree<f64, 3>>,
    result: Pose3D,
}

impl PointToPointIcp3D {
    /// Create an ICP matcher.
    pub fn new(config: IcpConfig) -> Self {
        Self {
            config,
            reference: PointCloud3D::new(),
            target: PointCloud3D::new(),
            tree: None,
            result: Pose3D::identity(),
        }
    }

    fn build_tree(cloud: &PointCloud3D) -> KdTree<f64, 3> {
        let mut tree: KdTree<f64, 3> = KdTree::new();
        for (i, p) in cloud.points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        tree
    }

    /// Correspondences (target idx, ref idx, squared distance) under the
    /// current transform, worst `outlier_ratio` trimmed.
    fn find_correspondences(
        &self,
        tree: &KdTree<f64, 3>,
        transform: &Pose3D,
    ) -> Vec<(usize, usize, f64)> {
        let max_dist_sq =
            self.config.max_correspondence_distance * self.config.max_correspondence_distance;
        let mut correspondences = Vec::with_capacity(self.target.len());

        for (i, p) in self.target.points.iter().enumerate() {
            let q = transform.transform_point(p);
            let nearest = tree.nearest_one::<SquaredEuclidean>(&[q.x, q.y, q.z]);
            if nearest.distance <= max_dist_sq {
                correspondences.push((i, nearest.item as usize, nearest.distance));
            }
        }

        if self.config.outlier_ratio > 0.0 && !correspondences.is_empty() {
            correspondences.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap());
            let keep =
                ((1.0 - self.config.outlier_ratio) * correspondences.len() as f64) as usize;
            correspondences.truncate(keep.max(self.config.min_correspondences));
        }

        correspondences
    }

    /// Closed-form rigid alignment of the matched pairs (Kabsch).
    fn compute_increment(
        &self,
        correspondences: &[(usize, usize, f64)],
        transform: &Pose3D,
    ) -> Pose3D {
        let n = correspondences.len() as f64;

        let mut centroid_src = Vector3::zeros();
        let mut centroid_dst = Vector3::zeros();
        for &(ti, ri, _) in correspondences {
            centroid_src += transform.transform_point(&self.target.points[ti]);
            centroid_dst += self.reference.points[ri];
        }
        centroid_src /= n;
        centroid_dst /= n;

        let mut h = Matrix3::zeros();
        for &(ti, ri, _) in correspondences {
            let s = transform.transform_point(&self.target.points[ti]) - centroid_src;
            let d = self.reference.points[ri] - centroid_dst;
            h += s * d.transpose();
        }

        let svd = h.svd(true, true);
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return Pose3D::identity(),
        };
        let mut r = v_t.transpose() * u.transpose();
        if r.determinant() < 0.0 {
            let mut v = v_t.transpose();
            v.column_mut(2).neg_mut();
            r = v * u.transpose();
        }

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
        let translation = centroid_dst - r * centroid_src;
        Pose3D::new(rotation, translation)
    }
}

impl Matcher for PointToPointIcp3D {
    fn set_ref(&mut self, cloud: &PointCloud3D) {
        self.reference = cloud.clone();
        self.tree = Some(Self::build_tree(cloud));
    }

    fn set_target(&mut self, cloud: &PointCloud3D) {
        self.target = cloud.clone();
    }

    fn align(&mut self, initial: &Pose3D) -> Result<(), SlamError> {
        let tree = self.tree.as_ref().ok_or(SlamError::MatcherFailure {
            context: "reference cloud not set".to_string(),
        })?;
        if self.target.is_empty() {
            return Err(SlamError::MatcherFailure {
                context: "target cloud is empty".to_string(),
            });
        }

        let mut transform = *initial;
        let mut converged = false;

        for _ in 0..self.config.max_iterations {
            let correspondences = self.find_correspondences(tree, &transform);
            if correspondences.len() < self.config.min_correspondences {
                return Err(SlamError::MatcherFailure {
                    context: format!(
                        "only {} correspondences, {} required",
                        correspondences.len(),
                        self.config.min_correspondences
                    ),
                });
            }

            let increment = self.compute_increment(&correspondences, &transform);
            transform = increment.compose(&transform);

            if increment.translation_norm() < self.config.translation_epsilon
                && increment.rotation_angle() < self.config.rotation_epsilon
            {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(SlamError::MatcherFailure {
                context: "icp did not converge within the iteration limit".to_string(),
            });
        }

        self.result = transform;
        Ok(())
    }

    fn result(&self) -> Pose3D {
        self.result
    }

    fn info(&self) -> Option<Matrix6> {
        // Point-to-point ICP reports no covariance; callers fall back to the
        // configured noise diagonal.
        None
    }
}

/// Instantiate a matcher by its configuration tag.
///
/// A non-empty `params_path` points at a JSON file overriding the matcher's
/// defaults.
pub fn create_matcher(tag: &str, params_path: &str) -> Result<Box<dyn Matcher>, SlamError> {
    match tag {
        "ICP" => {
            let config = if params_path.is_empty() {
                IcpConfig::default()
            } else {
                let text =
                    std::fs::read_to_string(params_path).map_err(|e| SlamError::ConfigInvalid {
                        context: format!("matcher params '{params_path}' unreadable: {e}"),
                    })?;
                serde_json::from_str(&text).map_err(|e| SlamError::ConfigInvalid {
                    context: format!("matcher params '{params_path}' malformed: {e}"),
                })?
            };
            Ok(Box::new(PointToPointIcp3D::new(config)))
        }
        other => Err(SlamError::ConfigInvalid {
            context: format!("unsupported matcher tag '{other}'"),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A 3D grid cloud with enough structure to lock all six degrees of
    /// freedom.
    pub(crate) fn structured_cloud() -> PointCloud3D {
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                points.push(Vector3::new(i as f64 * 0.4, j as f64 * 0.4, 0.0));
                points.push(Vector3::new(i as f64 * 0.4, 0.0, 0.3 + j as f64 * 0.25));
                points.push(Vector3::new(0.0, i as f64 * 0.4, 0.5 + j as f64 * 0.2));
            }
        }
        PointCloud3D::from_points(points)
    }

    #[test]
    fn aligns_transformed_copy() {
        let reference = structured_cloud();
        let truth = Pose3D::from_parts(
            Vector3::new(0.02, -0.03, 0.05),
            Vector3::new(0.1, -0.05, 0.08),
        );
        // Target points expressed in a frame displaced by `truth`.
        let target = reference.transform(&truth.inverse());

        let mut icp = PointToPointIcp3D::new(IcpConfig::default());
        icp.set_ref(&reference);
        icp.set_target(&target);
        icp.align(&Pose3D::identity()).unwrap();

        let result = icp.result();
        assert_relative_eq!(result.translation, truth.translation, epsilon = 1e-6);
        assert_relative_eq!(
            result.rotation.angle_to(&truth.rotation),
            0.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn fails_without_reference() {
        let mut icp = PointToPointIcp3D::new(IcpConfig::default());
        icp.set_target(&structured_cloud());
        assert!(icp.align(&Pose3D::identity()).is_err());
    }

    #[test]
    fn unknown_tag_is_config_invalid() {
        assert!(matches!(
            create_matcher("NDT", ""),
            Err(SlamError::ConfigInvalid { .. })
        ));
        assert!(create_matcher("ICP", "").is_ok());
    }
}
