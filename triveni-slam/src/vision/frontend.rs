//! Keyframing, localization, and map extension.

use std::collections::BTreeMap;
use std::time::Instant;

use nalgebra::{DMatrix, SMatrix, SVector, UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use triveni_core::{
    skew, ExtrinsicsRegistry, FactorGraph, FrameIds, Pose3D, Transaction,
};

use crate::config::VisionSection;
use crate::error::SlamError;

use super::map::{Landmark, VisualMap};
use super::tracks::TrackTable;
use super::{FeatureTracker, ImageFrame, PinholeCamera};

/// Source tag on reprojection constraints.
const SOURCE: &str = "VISUAL_REPROJECTION";

/// Iterations of the final motion-only refinement.
const REFINEMENT_ITERATIONS: usize = 10;
/// Iterations of the per-hypothesis RANSAC polish.
const HYPOTHESIS_ITERATIONS: usize = 4;

/// Result of localizing one frame.
#[derive(Debug, Clone)]
pub struct Localization {
    /// Estimated `T_world_baselink` at the frame stamp.
    pub pose: Pose3D,
    /// Track ids visible at the frame that are already triangulated.
    pub triangulated: Vec<u64>,
    /// Track ids visible at the frame awaiting triangulation.
    pub untriangulated: Vec<u64>,
    /// PnP inlier count.
    pub inliers: usize,
}

/// The visual front-end.
pub struct VisualFrontend {
    params: VisionSection,
    camera: PinholeCamera,
    t_baselink_camera: Pose3D,
    tracker: Box<dyn FeatureTracker>,

    tracks: TrackTable,
    map: VisualMap,

    /// Poses of keyframes currently inside the window.
    keyframe_poses: BTreeMap<u64, Pose3D>,
    last_keyframe_us: Option<u64>,
    added_since_keyframe: usize,

    /// Pose produced by the most recent `localize`, keyed by its stamp.
    pending_pose: Option<(u64, Pose3D)>,
    last_pose: Pose3D,
}

impl VisualFrontend {
    /// Create a front-end bound to a camera and its extrinsic.
    pub fn new(
        params: VisionSection,
        camera: PinholeCamera,
        extrinsics: &ExtrinsicsRegistry,
        frame_ids: &FrameIds,
        tracker: Box<dyn FeatureTracker>,
    ) -> Result<Self, SlamError> {
        let t_baselink_camera = extrinsics
            .get(&frame_ids.baselink, &frame_ids.camera)
            .map_err(|_| SlamError::ExtrinsicsMissing {
                from: frame_ids.baselink.clone(),
                to: frame_ids.camera.clone(),
            })?;
        Ok(Self {
            params,
            camera,
            t_baselink_camera,
            tracker,
            tracks: TrackTable::new(),
            map: VisualMap::new(),
            keyframe_poses: BTreeMap::new(),
            last_keyframe_us: None,
            added_since_keyframe: 0,
            pending_pose: None,
            last_pose: Pose3D::identity(),
        })
    }

    /// The landmark table.
    pub fn map(&self) -> &VisualMap {
        &self.map
    }

    /// The track table.
    pub fn tracks(&self) -> &TrackTable {
        &self.tracks
    }

    /// Advance the tracker with a new frame.
    ///
    /// Fails with DUPLICATE_STAMP if the stamp has been seen before.
    pub fn add_image(&mut self, frame: &ImageFrame) -> Result<(), SlamError> {
        if self.tracks.has_stamp(frame.timestamp_us) {
            return Err(SlamError::DuplicateStamp {
                stamp_us: frame.timestamp_us,
            });
        }
        let observations = self.tracker.track(frame);
        if observations.len() * 2 < self.params.num_features_to_track {
            log::debug!(
                "tracker returned {} observations, well below the requested {}",
                observations.len(),
                self.params.num_features_to_track
            );
        }
        self.tracks.add_frame(frame.timestamp_us, &observations);
        self.added_since_keyframe += 1;
        Ok(())
    }

    /// Estimate the baselink pose at `stamp_us` from 2D-3D correspondences.
    ///
    /// RANSAC over pose hypotheses polished from minimal samples, followed by
    /// a motion-only refinement bounded by the configured time budget. Fails
    /// with UNDERCONSTRAINED below three correspondences.
    pub fn localize(&mut self, stamp_us: u64) -> Result<Localization, SlamError> {
        let observations = self.tracks.observations_at(stamp_us);

        let mut triangulated = Vec::new();
        let mut untriangulated = Vec::new();
        let mut correspondences: Vec<(Vector2<f64>, Vector3<f64>)> = Vec::new();
        for (id, pixel) in &observations {
            match self.map.get(*id) {
                Some(lm) => {
                    triangulated.push(*id);
                    correspondences.push((*pixel, lm.position));
                }
                None => untriangulated.push(*id),
            }
        }

        if correspondences.len() < 3 {
            return Err(SlamError::Underconstrained {
                context: "pnp correspondences",
                have: correspondences.len(),
                need: 3,
            });
        }

        let initial = self
            .last_keyframe_us
            .and_then(|s| self.keyframe_poses.get(&s).copied())
            .unwrap_or(self.last_pose);

        let threshold = self.params.pnp_inlier_threshold_px;
        let mut rng = StdRng::seed_from_u64(stamp_us);
        let mut best_pose = initial;
        let mut best_inliers = self.count_inliers(&initial, &correspondences, threshold);

        for _ in 0..self.params.pnp_ransac_iterations {
            let sample: Vec<(Vector2<f64>, Vector3<f64>)> = (0..3)
                .map(|_| correspondences[rng.gen_range(0..correspondences.len())])
                .collect();
            let hypothesis =
                self.refine_pose(initial, &sample, HYPOTHESIS_ITERATIONS, None);
            let inliers = self.count_inliers(&hypothesis, &correspondences, threshold);
            if inliers > best_inliers {
                best_inliers = inliers;
                best_pose = hypothesis;
            }
        }

        // Motion-only bundle adjustment on the inlier set, time-bounded.
        let inlier_set: Vec<(Vector2<f64>, Vector3<f64>)> = correspondences
            .iter()
            .filter(|(pixel, world)| {
                self.reprojection_error(&best_pose, pixel, world)
                    .is_some_and(|e| e < threshold)
            })
            .copied()
            .collect();
        let refined = if inlier_set.len() >= 3 {
            self.refine_pose(
                best_pose,
                &inlier_set,
                REFINEMENT_ITERATIONS,
                Some(self.params.refinement_time_budget_s),
            )
        } else {
            best_pose
        };

        self.pending_pose = Some((stamp_us, refined));
        self.last_pose = refined;

        Ok(Localization {
            pose: refined,
            triangulated,
            untriangulated,
            inliers: best_inliers,
        })
    }

    /// Keyframe policy.
    ///
    /// True iff the minimum time since the last keyframe has passed AND any
    /// of: parallax exceeded, triangulated tracks dropped too low, or the
    /// window worth of non-keyframes has accumulated. The first frame is
    /// always a keyframe.
    pub fn is_keyframe(
        &self,
        stamp_us: u64,
        triangulated: &[u64],
        untriangulated: &[u64],
        _pose: &Pose3D,
    ) -> bool {
        let last_kf_us = match self.last_keyframe_us {
            Some(s) => s,
            None => return true,
        };

        let dt_s = (stamp_us.saturating_sub(last_kf_us)) as f64 * 1e-6;
        if dt_s < self.params.keyframe_min_time_in_seconds {
            return false;
        }

        let mut union: Vec<u64> = Vec::with_capacity(triangulated.len() + untriangulated.len());
        union.extend_from_slice(triangulated);
        union.extend_from_slice(untriangulated);
        let parallax = self
            .tracks
            .mean_parallax(&union, last_kf_us, stamp_us)
            .unwrap_or(0.0);

        parallax > self.params.keyframe_parallax
            || triangulated.len() < self.params.keyframe_tracks_drop
            || self.added_since_keyframe >= self.params.window_size - 1
    }

    /// Commit `stamp_us` as a keyframe: emit reprojection constraints for
    /// visible triangulated landmarks and triangulate mature tracks.
    ///
    /// Must be preceded by a successful `localize` at the same stamp.
    pub fn extend_map(
        &mut self,
        stamp_us: u64,
        triangulated: &[u64],
        untriangulated: &[u64],
    ) -> Result<Transaction, SlamError> {
        let pose = match self.pending_pose {
            Some((s, p)) if s == stamp_us => p,
            _ => {
                return Err(SlamError::NotReady {
                    context: "extend_map requires a preceding localize at the same stamp",
                })
            }
        };

        let mut tx = Transaction::new(stamp_us);
        tx.add_pose_variable(stamp_us, pose);

        // Constraints on already-triangulated landmarks seen at this frame.
        for id in triangulated {
            if let Some(pixel) = self.tracks.pixel(*id, stamp_us) {
                self.map.add_observation(*id, stamp_us, pixel);
                tx.add_reprojection_constraint(
                    stamp_us,
                    *id,
                    pixel,
                    self.camera.intrinsics(),
                    self.t_baselink_camera,
                    self.params.reprojection_information_weight,
                    SOURCE,
                );
            }
        }

        // Try to triangulate tracks observed from enough keyframes.
        self.keyframe_poses.insert(stamp_us, pose);
        for id in untriangulated {
            if let Some(landmark) = self.try_triangulate(*id) {
                tx.add_landmark_variable(*id, landmark.position);
                for (kf_stamp, pixel) in &landmark.observations {
                    tx.add_reprojection_constraint(
                        *kf_stamp,
                        *id,
                        *pixel,
                        self.camera.intrinsics(),
                        self.t_baselink_camera,
                        self.params.reprojection_information_weight,
                        SOURCE,
                    );
                }
                self.map.insert(landmark);
            }
        }

        self.last_keyframe_us = Some(stamp_us);
        self.added_since_keyframe = 0;
        self.slide_window();

        Ok(tx)
    }

    /// Refresh keyframe poses and landmark positions after optimization.
    pub fn update_from_graph(&mut self, graph: &FactorGraph) {
        for (stamp, pose) in self.keyframe_poses.iter_mut() {
            if let Some(updated) = graph.pose(*stamp) {
                *pose = updated;
            }
        }
        if let Some(last) = self.last_keyframe_us {
            if let Some(pose) = self.keyframe_poses.get(&last) {
                self.last_pose = *pose;
            }
        }
        self.map.update_from_graph(graph);
    }

    fn slide_window(&mut self) {
        while self.keyframe_poses.len() > self.params.window_size {
            if let Some(oldest) = self.keyframe_poses.keys().next().copied() {
                self.keyframe_poses.remove(&oldest);
            }
        }
        if let Some(oldest) = self.keyframe_poses.keys().next().copied() {
            self.tracks.prune_before(oldest);
            self.map.prune_unobserved_before(oldest);
        }
    }

    /// `T_world_camera` for a baselink pose.
    fn camera_pose(&self, t_world_baselink: &Pose3D) -> Pose3D {
        t_world_baselink.compose(&self.t_baselink_camera)
    }

    fn reprojection_error(
        &self,
        pose: &Pose3D,
        pixel: &Vector2<f64>,
        world: &Vector3<f64>,
    ) -> Option<f64> {
        let p_cam = self.camera_pose(pose).inverse_transform_point(world);
        let projected = self.camera.intrinsics().project(&p_cam)?;
        Some((projected - pixel).norm())
    }

    fn count_inliers(
        &self,
        pose: &Pose3D,
        correspondences: &[(Vector2<f64>, Vector3<f64>)],
        threshold: f64,
    ) -> usize {
        correspondences
            .iter()
            .filter(|(pixel, world)| {
                self.reprojection_error(pose, pixel, world)
                    .is_some_and(|e| e < threshold)
            })
            .count()
    }

    /// Gauss-Newton motion-only refinement of a baselink pose.
    fn refine_pose(
        &self,
        initial: Pose3D,
        correspondences: &[(Vector2<f64>, Vector3<f64>)],
        iterations: usize,
        time_budget_s: Option<f64>,
    ) -> Pose3D {
        let started = Instant::now();
        let mut pose = initial;
        let intrinsics = self.camera.intrinsics();
        let r_bc = self
            .t_baselink_camera
            .rotation
            .to_rotation_matrix()
            .into_inner();
        let r_cb = r_bc.transpose();

        for _ in 0..iterations {
            if let Some(budget) = time_budget_s {
                if started.elapsed().as_secs_f64() > budget {
                    break;
                }
            }

            let mut h = SMatrix::<f64, 6, 6>::zeros();
            let mut b = SVector::<f64, 6>::zeros();
            let r_wb = pose.rotation.to_rotation_matrix().into_inner();

            for (pixel, world) in correspondences {
                let p_body = pose.inverse_transform_point(world);
                let p_cam = self.t_baselink_camera.inverse_transform_point(&p_body);
                let projected = match intrinsics.project(&p_cam) {
                    Some(p) => p,
                    None => continue,
                };
                let residual = projected - pixel;

                let z_inv = 1.0 / p_cam.z;
                let d_proj = nalgebra::Matrix2x3::new(
                    intrinsics.fx * z_inv,
                    0.0,
                    -intrinsics.fx * p_cam.x * z_inv * z_inv,
                    0.0,
                    intrinsics.fy * z_inv,
                    -intrinsics.fy * p_cam.y * z_inv * z_inv,
                );

                let mut jac = SMatrix::<f64, 2, 6>::zeros();
                jac.fixed_view_mut::<2, 3>(0, 0)
                    .copy_from(&(d_proj * r_cb * skew(&p_body)));
                jac.fixed_view_mut::<2, 3>(0, 3)
                    .copy_from(&(-(d_proj * r_cb * r_wb.transpose())));

                h += jac.transpose() * jac;
                b += jac.transpose() * residual;
            }

            let step = match h.cholesky() {
                Some(chol) => chol.solve(&(-b)),
                None => break,
            };
            if step.norm() < 1e-12 {
                break;
            }

            pose.rotation *=
                UnitQuaternion::from_scaled_axis(Vector3::new(step[0], step[1], step[2]));
            pose.translation += Vector3::new(step[3], step[4], step[5]);
        }

        pose
    }

    /// Multi-view DLT triangulation of a track from its keyframe
    /// observations.
    ///
    /// Requires at least three observing keyframes, a non-degenerate DLT
    /// system, positive depth in every view, and a depth below the
    /// configured maximum in the newest view.
    fn try_triangulate(&self, id: u64) -> Option<Landmark> {
        let all_observations = self.tracks.observations_of(id)?;
        let observations: BTreeMap<u64, Vector2<f64>> = all_observations
            .iter()
            .filter(|(stamp, _)| self.keyframe_poses.contains_key(stamp))
            .map(|(s, p)| (*s, *p))
            .collect();
        if observations.len() < 3 {
            return None;
        }

        let views: Vec<(Pose3D, Vector2<f64>)> = observations
            .iter()
            .map(|(stamp, pixel)| (self.camera_pose(&self.keyframe_poses[stamp]), *pixel))
            .collect();

        let position = triangulate_dlt(&self.camera, &views)?;

        // Positive depth in every observing frame.
        for (t_world_cam, _) in &views {
            if t_world_cam.inverse_transform_point(&position).z <= 0.0 {
                return None;
            }
        }

        // Distance gate against the newest view.
        let (newest_cam, _) = views.last()?;
        if newest_cam.inverse_transform_point(&position).norm()
            > self.params.max_triangulation_distance
        {
            return None;
        }

        Some(Landmark {
            id,
            position,
            observations,
        })
    }
}

/// Multi-view linear triangulation.
///
/// Solves the homogeneous system built from normalized image coordinates;
/// rejects rank-deficient systems and solutions at infinity.
pub(crate) fn triangulate_dlt(
    camera: &PinholeCamera,
    views: &[(Pose3D, Vector2<f64>)],
) -> Option<Vector3<f64>> {
    let mut a = DMatrix::zeros(2 * views.len(), 4);

    for (row, (t_world_cam, pixel)) in views.iter().enumerate() {
        let t_cam_world = t_world_cam.inverse();
        let r = t_cam_world.rotation.to_rotation_matrix().into_inner();
        let t = t_cam_world.translation;
        let ray = camera.backproject(pixel);

        // P rows of [R | t]; constraint rows: x·P₃ − P₁ and y·P₃ − P₂.
        for col in 0..3 {
            a[(2 * row, col)] = ray.x * r[(2, col)] - r[(0, col)];
            a[(2 * row + 1, col)] = ray.y * r[(2, col)] - r[(1, col)];
        }
        a[(2 * row, 3)] = ray.x * t.z - t.x;
        a[(2 * row + 1, 3)] = ray.y * t.z - t.y;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let singular = &svd.singular_values;
    // Rank-3 requirement keeps the nullspace one-dimensional.
    if singular[2] < 1e-8 {
        return None;
    }

    let last = v_t.nrows() - 1;
    let h = v_t.row(last);
    if h[3].abs() < 1e-10 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}
