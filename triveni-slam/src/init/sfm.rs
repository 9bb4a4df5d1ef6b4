//! Two-view structure-from-motion bootstrap for the pure visual mode.
//!
//! Recovers an up-to-scale relative pose between the first and last
//! candidate keyframes from the epipolar constraint, triangulates the shared
//! tracks, and poses the intermediate keyframes against that structure. The
//! metric scale is left to the inertial alignment.

use nalgebra::{DMatrix, Matrix3, Rotation3, SMatrix, SVector, UnitQuaternion, Vector2, Vector3};

use triveni_core::{skew, Pose3D};

use crate::error::SlamError;
use crate::vision::{PinholeCamera, TrackTable};

/// Minimum correspondences for the linear epipolar solve.
const MIN_EPIPOLAR_CORRESPONDENCES: usize = 8;

/// Seed camera poses for the candidate keyframes, first camera at identity.
pub(super) fn seed_from_two_view_sfm(
    camera: &PinholeCamera,
    tracks: &TrackTable,
    stamps: &[u64],
    min_parallax_px: f64,
) -> Result<Vec<(u64, Pose3D)>, SlamError> {
    let first = stamps[0];
    let last = *stamps.last().expect("caller checks length");

    // Tracks shared by the two bracketing frames.
    let mut pairs: Vec<(u64, Vector2<f64>, Vector2<f64>)> = Vec::new();
    for (id, pixel_first) in tracks.observations_at(first) {
        if let Some(pixel_last) = tracks.pixel(id, last) {
            pairs.push((id, pixel_first, pixel_last));
        }
    }
    if pairs.len() < MIN_EPIPOLAR_CORRESPONDENCES {
        return Err(SlamError::Underconstrained {
            context: "epipolar correspondences",
            have: pairs.len(),
            need: MIN_EPIPOLAR_CORRESPONDENCES,
        });
    }

    let parallax =
        pairs.iter().map(|(_, a, b)| (a - b).norm()).sum::<f64>() / pairs.len() as f64;
    if parallax < min_parallax_px {
        return Err(SlamError::Underconstrained {
            context: "visual parallax",
            have: parallax as usize,
            need: min_parallax_px as usize,
        });
    }

    let normalized: Vec<(Vector3<f64>, Vector3<f64>)> = pairs
        .iter()
        .map(|(_, a, b)| (camera.backproject(a), camera.backproject(b)))
        .collect();

    let essential = solve_essential(&normalized)?;
    let t_cfirst_clast = select_pose(&essential, &normalized)?;

    // Structure in the first camera frame.
    let mut structure: Vec<(u64, Vector3<f64>)> = Vec::new();
    for ((id, _, _), (ray_first, ray_last)) in pairs.iter().zip(normalized.iter()) {
        if let Some(point) =
            triangulate_two_view(&Pose3D::identity(), &t_cfirst_clast, ray_first, ray_last)
        {
            structure.push((*id, point));
        }
    }
    if structure.len() < MIN_EPIPOLAR_CORRESPONDENCES {
        return Err(SlamError::Underconstrained {
            context: "triangulated bootstrap structure",
            have: structure.len(),
            need: MIN_EPIPOLAR_CORRESPONDENCES,
        });
    }

    // Pose the intermediate frames against the structure.
    let mut seeds = Vec::with_capacity(stamps.len());
    seeds.push((first, Pose3D::identity()));
    let span = (last - first) as f64;
    for stamp in &stamps[1..stamps.len() - 1] {
        let correspondences: Vec<(Vector3<f64>, Vector3<f64>)> = structure
            .iter()
            .filter_map(|(id, point)| {
                tracks
                    .pixel(*id, *stamp)
                    .map(|pixel| (camera.backproject(&pixel), *point))
            })
            .collect();
        if correspondences.len() < 3 {
            return Err(SlamError::Underconstrained {
                context: "intermediate frame correspondences",
                have: correspondences.len(),
                need: 3,
            });
        }

        let alpha = (*stamp - first) as f64 / span;
        let initial = Pose3D::new(
            UnitQuaternion::identity().slerp(&t_cfirst_clast.rotation, alpha),
            t_cfirst_clast.translation * alpha,
        );
        let pose = refine_pose_normalized(initial, &correspondences);
        seeds.push((*stamp, pose));
    }
    seeds.push((last, t_cfirst_clast));

    Ok(seeds)
}

/// Linear eight-point solve of the essential matrix, rank-2 projected.
fn solve_essential(
    normalized: &[(Vector3<f64>, Vector3<f64>)],
) -> Result<Matrix3<f64>, SlamError> {
    let mut a = DMatrix::zeros(normalized.len(), 9);
    for (row, (x1, x2)) in normalized.iter().enumerate() {
        // x2ᵀ E x1 = 0, E stacked row-major.
        a[(row, 0)] = x2.x * x1.x;
        a[(row, 1)] = x2.x * x1.y;
        a[(row, 2)] = x2.x;
        a[(row, 3)] = x2.y * x1.x;
        a[(row, 4)] = x2.y * x1.y;
        a[(row, 5)] = x2.y;
        a[(row, 6)] = x1.x;
        a[(row, 7)] = x1.y;
        a[(row, 8)] = 1.0;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t.ok_or(SlamError::Underconstrained {
        context: "essential matrix solve",
        have: 0,
        need: 1,
    })?;
    let e = v_t.row(v_t.nrows() - 1);
    let raw = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);

    // Project onto the essential manifold: equal leading singular values,
    // zero third.
    let svd3 = raw.svd(true, true);
    let (u, v_t) = match (svd3.u, svd3.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(SlamError::Underconstrained {
                context: "essential matrix projection",
                have: 0,
                need: 1,
            })
        }
    };
    let sigma = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0));
    Ok(u * sigma * v_t)
}

/// Pick the (R, t) decomposition with the most points in front of both
/// cameras.
fn select_pose(
    essential: &Matrix3<f64>,
    normalized: &[(Vector3<f64>, Vector3<f64>)],
) -> Result<Pose3D, SlamError> {
    let svd = essential.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(SlamError::Underconstrained {
                context: "essential decomposition",
                have: 0,
                need: 1,
            })
        }
    };

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let mut u = u;
    let mut v = v_t.transpose();
    if u.determinant() < 0.0 {
        u.neg_mut();
    }
    if v.determinant() < 0.0 {
        v.neg_mut();
    }

    let r1 = u * w * v.transpose();
    let r2 = u * w.transpose() * v.transpose();
    let t = u.column(2).into_owned();

    let mut best: Option<(usize, Pose3D)> = None;
    for (r, t) in [(r1, t), (r1, -t), (r2, t), (r2, -t)] {
        // (R, t) maps first-frame points into the second frame; the second
        // camera's pose in the first frame is the inverse.
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
        let t_clast_cfirst = Pose3D::new(rotation, t);
        let t_cfirst_clast = t_clast_cfirst.inverse();

        let in_front = normalized
            .iter()
            .filter_map(|(ray_first, ray_last)| {
                triangulate_two_view(
                    &Pose3D::identity(),
                    &t_cfirst_clast,
                    ray_first,
                    ray_last,
                )
            })
            .count();

        if best.as_ref().map_or(true, |(count, _)| in_front > *count) {
            best = Some((in_front, t_cfirst_clast));
        }
    }

    best.map(|(_, pose)| pose).ok_or(SlamError::Underconstrained {
        context: "cheirality selection",
        have: 0,
        need: 1,
    })
}

/// Midpoint triangulation of one ray pair; `None` unless the point is in
/// front of both cameras.
fn triangulate_two_view(
    t_world_c1: &Pose3D,
    t_world_c2: &Pose3D,
    ray1: &Vector3<f64>,
    ray2: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    // Solve for depths along both rays: c1 + d1·r1 ≈ c2 + d2·r2.
    let r1 = t_world_c1.rotation * ray1;
    let r2 = t_world_c2.rotation * ray2;
    let c1 = t_world_c1.translation;
    let c2 = t_world_c2.translation;

    let a00 = r1.dot(&r1);
    let a01 = -r1.dot(&r2);
    let a11 = r2.dot(&r2);
    let b0 = (c2 - c1).dot(&r1);
    let b1 = -(c2 - c1).dot(&r2);

    let det = a00 * a11 - a01 * a01;
    if det.abs() < 1e-12 {
        return None;
    }
    let d1 = (b0 * a11 - b1 * a01) / det;
    let d2 = (a00 * b1 - a01 * b0) / det;
    if d1 <= 0.0 || d2 <= 0.0 {
        return None;
    }

    Some(0.5 * ((c1 + d1 * r1) + (c2 + d2 * r2)))
}

/// Gauss-Newton pose refinement on normalized image coordinates.
fn refine_pose_normalized(
    initial: Pose3D,
    correspondences: &[(Vector3<f64>, Vector3<f64>)],
) -> Pose3D {
    let mut pose = initial;

    for _ in 0..10 {
        let mut h = SMatrix::<f64, 6, 6>::zeros();
        let mut b = SVector::<f64, 6>::zeros();

        for (ray, world) in correspondences {
            let p_cam = pose.inverse_transform_point(world);
            if p_cam.z <= 1e-6 {
                continue;
            }
            let z_inv = 1.0 / p_cam.z;
            let predicted = Vector2::new(p_cam.x * z_inv, p_cam.y * z_inv);
            let measured = Vector2::new(ray.x, ray.y);
            let residual = predicted - measured;

            let d_proj = nalgebra::Matrix2x3::new(
                z_inv,
                0.0,
                -p_cam.x * z_inv * z_inv,
                0.0,
                z_inv,
                -p_cam.y * z_inv * z_inv,
            );
            let r_wc = pose.rotation.to_rotation_matrix().into_inner();

            let mut jac = SMatrix::<f64, 2, 6>::zeros();
            jac.fixed_view_mut::<2, 3>(0, 0)
                .copy_from(&(d_proj * skew(&p_cam)));
            jac.fixed_view_mut::<2, 3>(0, 3)
                .copy_from(&(-(d_proj * r_wc.transpose())));

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
        pose.rotation *= UnitQuaternion::from_scaled_axis(Vector3::new(step[0], step[1], step[2]));
        pose.translation += Vector3::new(step[3], step[4], step[5]);
    }

    pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> PinholeCamera {
        PinholeCamera {
            fx: 400.0,
            fy: 400.0,
            cx: 320.0,
            cy: 240.0,
            width: 640,
            height: 480,
        }
    }

    fn scene() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                points.push(Vector3::new(
                    -1.2 + i as f64 * 0.6,
                    -0.9 + j as f64 * 0.6,
                    4.0 + ((i * 3 + j) % 4) as f64 * 0.7,
                ));
            }
        }
        points
    }

    fn scripted_tracks(poses: &[(u64, Pose3D)]) -> TrackTable {
        let cam = camera();
        let mut tracks = TrackTable::new();
        for (stamp, pose) in poses {
            let obs: Vec<(u64, Vector2<f64>)> = scene()
                .iter()
                .enumerate()
                .filter_map(|(id, point)| {
                    cam.project(&pose.inverse_transform_point(point))
                        .map(|px| (id as u64, px))
                })
                .collect();
            tracks.add_frame(*stamp, &obs);
        }
        tracks
    }

    #[test]
    fn recovers_translation_direction_up_to_scale() {
        let truth: Vec<(u64, Pose3D)> = (0..4)
            .map(|k| {
                (
                    k * 1_000_000,
                    Pose3D::from_translation(Vector3::new(k as f64 * 0.3, 0.0, 0.0)),
                )
            })
            .collect();
        let tracks = scripted_tracks(&truth);
        let stamps: Vec<u64> = truth.iter().map(|(s, _)| *s).collect();

        let seeds = seed_from_two_view_sfm(&camera(), &tracks, &stamps, 1.0).unwrap();
        assert_eq!(seeds.len(), 4);

        // Up-to-scale: the last translation is the true direction with unit
        // norm.
        let last = seeds.last().unwrap().1;
        let direction = last.translation.normalize();
        assert_relative_eq!(direction, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-6);
        assert_relative_eq!(last.rotation_angle(), 0.0, epsilon = 1e-6);

        // Intermediate frames land proportionally along the baseline.
        let mid = seeds[1].1;
        assert_relative_eq!(
            mid.translation.norm() / last.translation.norm(),
            1.0 / 3.0,
            epsilon = 1e-4
        );
    }

    #[test]
    fn insufficient_parallax_is_underconstrained() {
        let truth: Vec<(u64, Pose3D)> = (0..3)
            .map(|k| (k * 1_000_000, Pose3D::identity()))
            .collect();
        let tracks = scripted_tracks(&truth);
        let stamps: Vec<u64> = truth.iter().map(|(s, _)| *s).collect();

        assert!(matches!(
            seed_from_two_view_sfm(&camera(), &tracks, &stamps, 5.0),
            Err(SlamError::Underconstrained { .. })
        ));
    }
}
