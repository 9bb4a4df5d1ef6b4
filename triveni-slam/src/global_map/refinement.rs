//! Loop-closure refinement capability.

use triveni_core::Pose3D;

use crate::config::{GlobalMapSection, RefinementType};
use crate::error::SlamError;
use crate::lidar::{IcpConfig, Matcher, PointToPointIcp3D};

use super::Submap;

/// Refines a candidate relative pose by aligning the query submap's clouds
/// against the match submap's clouds.
pub trait Refiner: Send {
    /// Refine `T_match_query` starting from `initial`.
    fn refine(
        &mut self,
        submap_match: &Submap,
        submap_query: &Submap,
        initial: &Pose3D,
    ) -> Result<Pose3D, SlamError>;
}

/// ICP-based refinement over the submaps' raw lidar points.
pub struct IcpRefiner {
    icp: PointToPointIcp3D,
    /// Refinements moving the estimate further than this are discarded.
    max_correction_m: f64,
}

impl IcpRefiner {
    pub fn new(max_correction_m: f64) -> Self {
        Self {
            icp: PointToPointIcp3D::new(IcpConfig {
                max_correspondence_distance: 2.0,
                ..IcpConfig::default()
            }),
            max_correction_m,
        }
    }
}

impl Refiner for IcpRefiner {
    fn refine(
        &mut self,
        submap_match: &Submap,
        submap_query: &Submap,
        initial: &Pose3D,
    ) -> Result<Pose3D, SlamError> {
        if submap_match.lidar_points.is_empty() || submap_query.lidar_points.is_empty() {
            return Err(SlamError::MatcherFailure {
                context: "submap has no lidar points to refine against".to_string(),
            });
        }

        self.icp.set_ref(&submap_match.lidar_points);
        self.icp.set_target(&submap_query.lidar_points);
        self.icp.align(initial)?;
        let refined = self.icp.result();

        let correction = initial.between(&refined);
        if correction.translation_norm() > self.max_correction_m {
            return Err(SlamError::MatcherFailure {
                context: format!(
                    "refinement moved the estimate by {:.2} m, limit {:.2} m",
                    correction.translation_norm(),
                    self.max_correction_m
                ),
            });
        }

        Ok(refined)
    }
}

/// Instantiate the configured refiner.
pub fn create_refiner(params: &GlobalMapSection) -> Result<Box<dyn Refiner>, SlamError> {
    match params.reloc_refinement_type {
        RefinementType::Icp => Ok(Box::new(IcpRefiner::new(
            params.refinement_max_correction_m,
        ))),
        other => Err(SlamError::ConfigInvalid {
            context: format!("unsupported refinement type {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use triveni_core::PointCloud3D;

    fn cloud() -> PointCloud3D {
        let mut points = Vec::new();
        for i in 0..8 {
            for j in 0..8 {
                points.push(Vector3::new(i as f64 * 0.5, j as f64 * 0.5, 0.0));
                points.push(Vector3::new(i as f64 * 0.5, 0.0, 0.4 + j as f64 * 0.3));
            }
        }
        PointCloud3D::from_points(points)
    }

    #[test]
    fn refines_small_offset() {
        let mut submap_match = Submap::new(0, Pose3D::identity());
        submap_match.lidar_points = cloud();

        // Query submap sees the same structure shifted by the true relative
        // transform.
        let truth = Pose3D::from_translation(Vector3::new(0.1, -0.05, 0.02));
        let mut submap_query = Submap::new(1, truth);
        submap_query.lidar_points = cloud().transform(&truth.inverse());

        let mut refiner = IcpRefiner::new(2.0);
        let refined = refiner
            .refine(&submap_match, &submap_query, &Pose3D::identity())
            .unwrap();
        approx::assert_relative_eq!(refined.translation, truth.translation, epsilon = 1e-5);
    }

    #[test]
    fn empty_submap_fails() {
        let submap_match = Submap::new(0, Pose3D::identity());
        let submap_query = Submap::new(1, Pose3D::identity());
        let mut refiner = IcpRefiner::new(2.0);
        assert!(refiner
            .refine(&submap_match, &submap_query, &Pose3D::identity())
            .is_err());
    }
}
