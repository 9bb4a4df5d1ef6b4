//! Trajectory initializer.
//!
//! Bootstraps metric state from scratch or from an externally provided path.
//! While uninitialized, candidate keyframe stamps are accumulated; once the
//! trajectory is long enough the initializer seeds keyframe poses
//! (path-seeded mode interpolates the external path, pure visual mode runs
//! a two-view epipolar bootstrap), estimates gyro bias, gravity, scale, and
//! velocities against the IMU preintegration, optimizes a local graph under
//! a wall-clock budget, and hands everything to the estimator in a single
//! transaction.

use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};

use triveni_core::{
    FactorGraph, ImuBias, ImuState, Matrix15, OptimizerConfig, Pose3D, PreintegratedDelta,
    Timestamped, Transaction, GRAVITY_WORLD,
};

use crate::config::{ImuSection, InitMode, InitSection};
use crate::error::SlamError;
use crate::imu::Preintegrator;
use crate::vision::{triangulate_dlt, PinholeCamera, TrackTable};

mod sfm;

/// Source tag on initializer-made constraints.
const SOURCE: &str = "SLAM_INITIALIZATION";

/// Candidate keyframes are spaced at least this far apart.
const CANDIDATE_SPACING_US: u64 = 1_000_000;

/// Externally provided metric path used by path-seeded initialization.
#[derive(Debug, Clone, Default)]
pub struct InitializedPath {
    /// Ordered baselink poses.
    pub poses: Vec<Timestamped<Pose3D>>,
}

impl InitializedPath {
    /// Interpolate the path at a stamp, `None` outside its span.
    pub fn interpolate(&self, stamp_us: u64) -> Option<Pose3D> {
        let after = self
            .poses
            .iter()
            .position(|p| p.timestamp_us >= stamp_us)?;
        if after == 0 {
            return (self.poses[0].timestamp_us == stamp_us).then(|| self.poses[0].data);
        }
        Pose3D::interpolate(&self.poses[after - 1], &self.poses[after], stamp_us)
    }

    /// Total path length in meters.
    pub fn length(&self) -> f64 {
        self.poses
            .windows(2)
            .map(|w| (w[1].data.translation - w[0].data.translation).norm())
            .sum()
    }
}

/// Everything a successful initialization produces.
pub struct InitializationResult {
    /// Estimated gravity vector in the world frame.
    pub gravity: Vector3<f64>,
    /// Recovered metric scale (1 for already-metric seeds).
    pub scale: f64,
    /// Per-keyframe states after the local optimization.
    pub states: Vec<ImuState>,
    /// Triangulated landmarks.
    pub landmarks: Vec<(u64, Vector3<f64>)>,
    /// Seeding transaction: every variable and constraint of the local
    /// graph.
    pub transaction: Transaction,
}

/// The trajectory initializer state machine.
pub struct SlamInitializer {
    params: InitSection,
    imu_params: ImuSection,
    camera: PinholeCamera,
    t_baselink_camera: Pose3D,
    reprojection_weight: f64,

    candidate_stamps: Vec<u64>,
    path: Option<InitializedPath>,
    initialized: bool,
}

impl SlamInitializer {
    pub fn new(
        params: InitSection,
        imu_params: ImuSection,
        camera: PinholeCamera,
        t_baselink_camera: Pose3D,
    ) -> Self {
        Self {
            params,
            imu_params,
            camera,
            t_baselink_camera,
            reprojection_weight: 1.0,
            candidate_stamps: Vec::new(),
            path: None,
            initialized: false,
        }
    }

    /// Whether a bootstrap has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Candidate keyframe stamps accumulated so far.
    pub fn candidate_stamps(&self) -> &[u64] {
        &self.candidate_stamps
    }

    /// Provide the external path message.
    pub fn set_path(&mut self, path: InitializedPath) {
        self.path = Some(path);
    }

    /// Offer an image stamp as an initialization candidate.
    ///
    /// Accepted when at least one second has passed since the previous
    /// candidate; the buffer is trimmed to the configured window.
    pub fn add_candidate_frame(&mut self, stamp_us: u64) {
        if let Some(last) = self.candidate_stamps.last() {
            if stamp_us.saturating_sub(*last) < CANDIDATE_SPACING_US {
                return;
            }
        }
        self.candidate_stamps.push(stamp_us);

        let window_us = (self.params.initialization_window_s * 1e6) as u64;
        if let Some(newest) = self.candidate_stamps.last().copied() {
            self.candidate_stamps
                .retain(|s| newest.saturating_sub(*s) <= window_us);
        }
    }

    /// Attempt the bootstrap.
    ///
    /// On failure all accumulated buffers are preserved so the next image
    /// triggers a retry. On success the initializer is done and the result's
    /// transaction seeds the main estimator.
    pub fn try_initialize(
        &mut self,
        imu: &Preintegrator,
        tracks: &TrackTable,
    ) -> Result<InitializationResult, SlamError> {
        if self.candidate_stamps.len() < 3 {
            return Err(SlamError::Underconstrained {
                context: "initialization keyframes",
                have: self.candidate_stamps.len(),
                need: 3,
            });
        }

        // Path-only modes cannot proceed without the external path.
        if !matches!(self.params.init_mode, InitMode::Visual) && self.path.is_none() {
            return Err(SlamError::NotReady {
                context: "initialization mode requires an external path",
            });
        }

        // Seed poses: interpolate the path when one is available, otherwise
        // bootstrap from epipolar geometry.
        let (seeds, metric_seed) = match &self.path {
            Some(path) => (self.seed_from_path(path)?, true),
            None => {
                let camera_seeds = sfm::seed_from_two_view_sfm(
                    &self.camera,
                    tracks,
                    &self.candidate_stamps,
                    self.params.min_visual_parallax,
                )?;
                // Camera poses back onto the baselink.
                let t_camera_baselink = self.t_baselink_camera.inverse();
                let seeds = camera_seeds
                    .into_iter()
                    .map(|(stamp, pose)| (stamp, pose.compose(&t_camera_baselink)))
                    .collect();
                (seeds, false)
            }
        };

        if metric_seed {
            let length: f64 = seeds
                .windows(2)
                .map(|w| (w[1].1.translation - w[0].1.translation).norm())
                .sum();
            if length < self.params.min_trajectory_length_m {
                return Err(SlamError::Underconstrained {
                    context: "trajectory length",
                    have: length as usize,
                    need: self.params.min_trajectory_length_m as usize,
                });
            }
        }

        // Preintegrate between consecutive seeds under zero bias.
        let zero_bias = ImuBias::zero();
        let mut deltas: Vec<PreintegratedDelta> = Vec::new();
        for pair in seeds.windows(2) {
            deltas.push(imu.integrate(pair[0].0, pair[1].0, zero_bias, true));
        }

        // Gyro bias from rotation residuals, then first-order-correct the
        // deltas.
        let gyro_bias = estimate_gyro_bias(&seeds, &deltas)?;
        let bias = ImuBias {
            gyro: gyro_bias,
            accel: Vector3::zeros(),
        };
        let deltas: Vec<PreintegratedDelta> = seeds
            .windows(2)
            .map(|pair| imu.integrate(pair[0].0, pair[1].0, bias, true))
            .collect();

        // Gravity, scale, and velocities from the linear system.
        let (gravity, scale, velocities) = solve_gravity_scale_velocities(&seeds, &deltas)?;

        let gravity_error = (gravity.norm() - GRAVITY_WORLD.norm()).abs() / GRAVITY_WORLD.norm();
        if gravity_error > 0.1 {
            return Err(SlamError::Underconstrained {
                context: "gravity magnitude recovery",
                have: (gravity.norm() * 100.0) as usize,
                need: (GRAVITY_WORLD.norm() * 100.0) as usize,
            });
        }

        // Assemble metric states.
        let states: Vec<ImuState> = seeds
            .iter()
            .zip(velocities.iter())
            .map(|((stamp, pose), velocity)| ImuState {
                timestamp_us: *stamp,
                orientation: pose.rotation,
                position: pose.translation * scale,
                velocity: *velocity,
                bias,
            })
            .collect();

        // Triangulate landmarks observed from at least three seeded
        // keyframes.
        let landmarks = self.triangulate_landmarks(tracks, &seeds, scale);

        // Local graph with inertial, prior, and reprojection factors.
        let mut graph = self.build_local_graph(&states, &deltas, &landmarks, tracks)?;
        let result = graph.optimize(&OptimizerConfig {
            max_time_s: Some(self.params.max_optimization_s),
            ..OptimizerConfig::default()
        });
        log::info!(
            "initializer optimization: {:?} after {} iterations, error {:.3e} -> {:.3e}",
            result.termination_reason,
            result.iterations,
            result.initial_error,
            result.final_error
        );

        // Handoff: copy every variable and constraint into one transaction.
        let mut transaction = Transaction::new(seeds[0].0);
        for (key, value) in graph.variables() {
            transaction.add_variable(*key, *value);
        }
        for constraint in graph.constraints() {
            transaction.add_raw_constraint(constraint.clone());
        }

        let states: Vec<ImuState> = states
            .iter()
            .map(|s| graph.imu_state(s.timestamp_us).unwrap_or(*s))
            .collect();
        let landmarks: Vec<(u64, Vector3<f64>)> = landmarks
            .iter()
            .map(|(id, p)| (*id, graph.landmark(*id).unwrap_or(*p)))
            .collect();

        self.initialized = true;
        Ok(InitializationResult {
            gravity,
            scale,
            states,
            landmarks,
            transaction,
        })
    }

    fn seed_from_path(&self, path: &InitializedPath) -> Result<Vec<(u64, Pose3D)>, SlamError> {
        let seeds: Vec<(u64, Pose3D)> = self
            .candidate_stamps
            .iter()
            .filter_map(|stamp| path.interpolate(*stamp).map(|pose| (*stamp, pose)))
            .collect();
        if seeds.len() < 3 {
            return Err(SlamError::Underconstrained {
                context: "path-seeded keyframes",
                have: seeds.len(),
                need: 3,
            });
        }
        Ok(seeds)
    }

    fn triangulate_landmarks(
        &self,
        tracks: &TrackTable,
        seeds: &[(u64, Pose3D)],
        scale: f64,
    ) -> Vec<(u64, Vector3<f64>)> {
        let mut landmarks = Vec::new();
        let mut ids: Vec<u64> = Vec::new();
        for (stamp, _) in seeds {
            for (id, _) in tracks.observations_at(*stamp) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        for id in ids {
            let observations = match tracks.observations_of(id) {
                Some(obs) => obs,
                None => continue,
            };
            let views: Vec<(Pose3D, Vector2<f64>)> = seeds
                .iter()
                .filter_map(|(stamp, pose)| {
                    observations.get(stamp).map(|pixel| {
                        let scaled = Pose3D::new(pose.rotation, pose.translation * scale);
                        (scaled.compose(&self.t_baselink_camera), *pixel)
                    })
                })
                .collect();
            if views.len() < 3 {
                continue;
            }
            if let Some(position) = triangulate_dlt(&self.camera, &views) {
                let all_in_front = views
                    .iter()
                    .all(|(pose, _)| pose.inverse_transform_point(&position).z > 0.0);
                if all_in_front {
                    landmarks.push((id, position));
                }
            }
        }
        landmarks
    }

    fn build_local_graph(
        &self,
        states: &[ImuState],
        deltas: &[PreintegratedDelta],
        landmarks: &[(u64, Vector3<f64>)],
        tracks: &TrackTable,
    ) -> Result<FactorGraph, SlamError> {
        let mut tx = Transaction::new(states[0].timestamp_us);

        let prior_covariance = Matrix15::identity() * self.imu_params.cov_prior_noise;
        tx.add_imu_state_prior(states[0], prior_covariance, SOURCE);
        for state in states {
            tx.add_imu_state_variables(state);
        }
        for (pair, delta) in states.windows(2).zip(deltas.iter()) {
            let mut scaled = delta.clone();
            scaled.covariance /= self.params.inertial_info_weight;
            scaled.bias_lin = pair[0].bias;
            tx.add_preintegrated_imu_constraint(
                pair[0].timestamp_us,
                pair[1].timestamp_us,
                scaled,
                SOURCE,
            );
        }

        for (id, position) in landmarks {
            tx.add_landmark_variable(*id, *position);
            if let Some(observations) = tracks.observations_of(*id) {
                for state in states {
                    if let Some(pixel) = observations.get(&state.timestamp_us) {
                        tx.add_reprojection_constraint(
                            state.timestamp_us,
                            *id,
                            *pixel,
                            self.camera.intrinsics(),
                            self.t_baselink_camera,
                            self.reprojection_weight,
                            SOURCE,
                        );
                    }
                }
            }
        }

        let mut graph = FactorGraph::new();
        graph.apply(&tx).map_err(|e| SlamError::MatcherFailure {
            context: format!("local graph assembly failed: {e}"),
        })?;
        Ok(graph)
    }
}

/// Least-squares gyro bias from rotation residuals between seed poses and
/// preintegrated rotations.
fn estimate_gyro_bias(
    seeds: &[(u64, Pose3D)],
    deltas: &[PreintegratedDelta],
) -> Result<Vector3<f64>, SlamError> {
    let mut h = Matrix3::zeros();
    let mut b = Vector3::zeros();

    for (pair, delta) in seeds.windows(2).zip(deltas.iter()) {
        let rotation_seed = pair[0].1.rotation.inverse() * pair[1].1.rotation;
        let error = (delta.delta_q.inverse() * rotation_seed).scaled_axis();
        let jac = delta.j_r_bg;
        h += jac.transpose() * jac;
        b += jac.transpose() * error;
    }

    h.try_inverse()
        .map(|inv| inv * b)
        .ok_or(SlamError::Underconstrained {
            context: "gyro bias estimation",
            have: 0,
            need: 3,
        })
}

/// Linear solve for gravity, metric scale, and per-keyframe velocities.
///
/// Unknowns x = [v_0 … v_{N-1}, g, s]. For each consecutive pair:
///
/// ```text
/// s·Δp_seed − v_i·Δt − ½·g·Δt² = R_i·Δp_imu
///     v_{i+1} − v_i −    g·Δt  = R_i·Δv_imu
/// ```
///
/// Rank deficiency (pure rotation, no translation) fails with
/// UNDERCONSTRAINED.
fn solve_gravity_scale_velocities(
    seeds: &[(u64, Pose3D)],
    deltas: &[PreintegratedDelta],
) -> Result<(Vector3<f64>, f64, Vec<Vector3<f64>>), SlamError> {
    let n = seeds.len();
    let dim = 3 * n + 4;
    let rows = 6 * (n - 1);
    let mut a = DMatrix::zeros(rows, dim);
    let mut rhs = DVector::zeros(rows);

    for (k, (pair, delta)) in seeds.windows(2).zip(deltas.iter()).enumerate() {
        let dt = delta.dt;
        let r_i = pair[0].1.rotation.to_rotation_matrix().into_inner();
        let dp_seed = pair[1].1.translation - pair[0].1.translation;
        let row_p = 6 * k;
        let row_v = 6 * k + 3;

        // Position rows.
        for i in 0..3 {
            a[(row_p + i, 3 * k + i)] = -dt; // v_i
            a[(row_p + i, 3 * n + i)] = -0.5 * dt * dt; // g
            a[(row_p + i, 3 * n + 3)] = dp_seed[i]; // s
        }
        let p_rhs = r_i * delta.delta_p;
        for i in 0..3 {
            rhs[row_p + i] = p_rhs[i];
        }

        // Velocity rows.
        for i in 0..3 {
            a[(row_v + i, 3 * k + i)] = -1.0; // v_i
            a[(row_v + i, 3 * (k + 1) + i)] = 1.0; // v_{i+1}
            a[(row_v + i, 3 * n + i)] = -dt; // g
        }
        let v_rhs = r_i * delta.delta_v;
        for i in 0..3 {
            rhs[row_v + i] = v_rhs[i];
        }
    }

    let svd = a.svd(true, true);
    let max_singular = svd.singular_values.max();
    let min_singular = svd
        .singular_values
        .iter()
        .fold(f64::INFINITY, |acc, s| acc.min(*s));
    if min_singular < 1e-9 * max_singular.max(1.0) {
        return Err(SlamError::Underconstrained {
            context: "scale and gravity recovery",
            have: 0,
            need: 1,
        });
    }

    let x = svd.solve(&rhs, 1e-12).map_err(|_| SlamError::Underconstrained {
        context: "scale and gravity recovery",
        have: 0,
        need: 1,
    })?;

    let velocities: Vec<Vector3<f64>> = (0..n)
        .map(|k| Vector3::new(x[3 * k], x[3 * k + 1], x[3 * k + 2]))
        .collect();
    let gravity = Vector3::new(x[3 * n], x[3 * n + 1], x[3 * n + 2]);
    let scale = x[3 * n + 3];

    if scale <= 0.0 {
        return Err(SlamError::Underconstrained {
            context: "recovered scale is not positive",
            have: 0,
            need: 1,
        });
    }

    Ok((gravity, scale, velocities))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_frames_respect_spacing_and_window() {
        let mut init = SlamInitializer::new(
            InitSection::default(),
            ImuSection::default(),
            PinholeCamera {
                fx: 400.0,
                fy: 400.0,
                cx: 320.0,
                cy: 240.0,
                width: 640,
                height: 480,
            },
            Pose3D::identity(),
        );

        init.add_candidate_frame(0);
        init.add_candidate_frame(500_000); // too close, dropped
        init.add_candidate_frame(1_000_000);
        init.add_candidate_frame(2_500_000);
        assert_eq!(init.candidate_stamps(), &[0, 1_000_000, 2_500_000]);
    }

    #[test]
    fn path_interpolation_is_bounded() {
        let path = InitializedPath {
            poses: vec![
                Timestamped::new(Pose3D::identity(), 1_000_000),
                Timestamped::new(
                    Pose3D::from_translation(Vector3::new(2.0, 0.0, 0.0)),
                    3_000_000,
                ),
            ],
        };
        assert!(path.interpolate(500_000).is_none());
        assert!(path.interpolate(3_500_000).is_none());
        let mid = path.interpolate(2_000_000).unwrap();
        approx::assert_relative_eq!(mid.translation.x, 1.0, epsilon = 1e-9);
        approx::assert_relative_eq!(path.length(), 2.0, epsilon = 1e-12);
    }
}
