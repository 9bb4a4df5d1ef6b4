//! Discrete preintegration of IMU samples.
//!
//! Integrates gyroscope and accelerometer readings over an interval
//! (t_i, t_j] into a gravity-free motion increment, propagating the 15×15
//! error-state covariance over (δφ, δv, δp, δb_g, δb_a) and accumulating the
//! bias Jacobians that allow first-order post-hoc bias correction.
//!
//! Rotation is integrated on SO(3) via the first-order retraction
//! `q_{k+1} = q_k ⊗ Exp((ω_k − b_g) dt_k)`; velocity and position use the
//! Euler rule under zero gravity. Gravity is added in the world frame at
//! prediction time.

use nalgebra::{Matrix3, SMatrix, UnitQuaternion};

use triveni_core::{right_jacobian_so3, skew, ImuBias, ImuNoise, ImuSample, PreintegratedDelta};

type Matrix15 = SMatrix<f64, 15, 15>;
type Matrix15x12 = SMatrix<f64, 15, 12>;
type Matrix12 = SMatrix<f64, 12, 12>;

/// Integrates a batch of IMU samples into a [`PreintegratedDelta`].
#[derive(Debug, Clone)]
pub struct Preintegrator {
    /// Samples queued for integration, strictly increasing in time.
    pub data: Vec<ImuSample>,
    noise: ImuNoise,
}

impl Preintegrator {
    /// Create an integrator with the given noise model.
    pub fn new(noise: ImuNoise) -> Self {
        Self {
            data: Vec::new(),
            noise,
        }
    }

    /// Drop all queued samples.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Integrate the queued samples over (t_start, t_end] under `bias`.
    ///
    /// Each sample's rates are held over the step that ends at its stamp;
    /// the tail beyond the last sample is covered by holding the last
    /// sample's rates. Samples outside the interval are ignored. Covariance
    /// and bias-Jacobian propagation can be skipped for prediction-only use.
    pub fn integrate(
        &self,
        t_start_us: u64,
        t_end_us: u64,
        bias: ImuBias,
        with_covariance: bool,
    ) -> PreintegratedDelta {
        let mut delta = PreintegratedDelta::identity(bias);
        if t_end_us <= t_start_us {
            return delta;
        }

        let mut prev_us = t_start_us;
        for sample in &self.data {
            if sample.timestamp_us <= t_start_us {
                continue;
            }
            if sample.timestamp_us > t_end_us {
                break;
            }
            let dt = (sample.timestamp_us - prev_us) as f64 * 1e-6;
            step(&mut delta, sample, dt, with_covariance, &self.noise);
            prev_us = sample.timestamp_us;
        }

        // Hold the last rates over the tail of the interval.
        if prev_us < t_end_us {
            if let Some(last) = self
                .data
                .iter()
                .rev()
                .find(|s| s.timestamp_us <= t_end_us && s.timestamp_us > t_start_us)
            {
                let dt = (t_end_us - prev_us) as f64 * 1e-6;
                step(&mut delta, last, dt, with_covariance, &self.noise);
            }
            delta.dt = (t_end_us - t_start_us) as f64 * 1e-6;
        }

        delta
    }
}

/// One Euler step of mean, covariance, and bias-Jacobian propagation.
fn step(
    delta: &mut PreintegratedDelta,
    sample: &ImuSample,
    dt: f64,
    with_covariance: bool,
    noise: &ImuNoise,
) {
    if dt <= 0.0 {
        return;
    }

    let omega = sample.angular_velocity - delta.bias_lin.gyro;
    let accel = sample.linear_acceleration - delta.bias_lin.accel;

    let phi = omega * dt;
    let dq_inc = UnitQuaternion::from_scaled_axis(phi);
    let dr_inc = dq_inc.to_rotation_matrix().into_inner();
    let jr = right_jacobian_so3(&phi);

    let dr = delta.delta_q.to_rotation_matrix().into_inner();
    let skew_accel = skew(&accel);

    if with_covariance {
        // Error-state transition A (15×15) over (δφ, δv, δp, δb_g, δb_a).
        let mut a_mat = Matrix15::identity();
        a_mat
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&dr_inc.transpose());
        a_mat
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-dr * skew_accel * dt));
        a_mat
            .fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * dr * skew_accel * dt * dt));
        a_mat
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));
        a_mat.fixed_view_mut::<3, 3>(0, 9).copy_from(&(-jr * dt));
        a_mat.fixed_view_mut::<3, 3>(3, 12).copy_from(&(-dr * dt));
        a_mat
            .fixed_view_mut::<3, 3>(6, 12)
            .copy_from(&(-0.5 * dr * dt * dt));

        // Noise input B (15×12) over (n_g, n_a, w_bg, w_ba).
        let mut b_mat = Matrix15x12::zeros();
        b_mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        b_mat.fixed_view_mut::<3, 3>(3, 3).copy_from(&(dr * dt));
        b_mat
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(0.5 * dr * dt * dt));
        b_mat
            .fixed_view_mut::<3, 3>(9, 6)
            .copy_from(&Matrix3::identity());
        b_mat
            .fixed_view_mut::<3, 3>(12, 9)
            .copy_from(&Matrix3::identity());

        // Discrete noise: measurement densities scale with 1/dt, random
        // walks with dt.
        let mut q_mat = Matrix12::zeros();
        let gyro_var = noise.sigma_gyro * noise.sigma_gyro / dt;
        let accel_var = noise.sigma_accel * noise.sigma_accel / dt;
        for i in 0..3 {
            q_mat[(i, i)] = gyro_var;
            q_mat[(3 + i, 3 + i)] = accel_var;
            q_mat[(6 + i, 6 + i)] = noise.gyro_walk_variance(dt);
            q_mat[(9 + i, 9 + i)] = noise.accel_walk_variance(dt);
        }

        delta.covariance =
            a_mat * delta.covariance * a_mat.transpose() + b_mat * q_mat * b_mat.transpose();

        // Bias Jacobians: position and velocity first (they use the previous
        // rotation Jacobian), rotation last.
        delta.j_p_bg =
            delta.j_p_bg + delta.j_v_bg * dt - 0.5 * dr * skew_accel * delta.j_r_bg * dt * dt;
        delta.j_p_ba = delta.j_p_ba + delta.j_v_ba * dt - 0.5 * dr * dt * dt;
        delta.j_v_bg -= dr * skew_accel * delta.j_r_bg * dt;
        delta.j_v_ba -= dr * dt;
        delta.j_r_bg = dr_inc.transpose() * delta.j_r_bg - jr * dt;
    }

    // Mean propagation: position with the pre-step velocity and rotation.
    let accel_rotated = dr * accel;
    delta.delta_p += delta.delta_v * dt + 0.5 * accel_rotated * dt * dt;
    delta.delta_v += accel_rotated * dt;
    delta.delta_q *= dq_inc;
    delta.dt += dt;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn constant_samples(
        n: usize,
        rate_hz: f64,
        omega: Vector3<f64>,
        accel: Vector3<f64>,
    ) -> Vec<ImuSample> {
        let dt_us = (1e6 / rate_hz) as u64;
        (1..=n)
            .map(|k| ImuSample {
                timestamp_us: k as u64 * dt_us,
                angular_velocity: omega,
                linear_acceleration: accel,
            })
            .collect()
    }

    #[test]
    fn constant_acceleration_integrates_exactly() {
        let mut pre = Preintegrator::new(ImuNoise::default());
        pre.data = constant_samples(100, 100.0, Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));

        let delta = pre.integrate(0, 1_000_000, ImuBias::zero(), false);
        assert_relative_eq!(delta.dt, 1.0, epsilon = 1e-12);
        assert_relative_eq!(delta.delta_v, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(delta.delta_p, Vector3::new(0.5, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(delta.delta_q.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_rotation_accumulates_angle() {
        let mut pre = Preintegrator::new(ImuNoise::default());
        pre.data = constant_samples(
            200,
            200.0,
            Vector3::new(0.0, 0.0, 0.5),
            Vector3::zeros(),
        );

        let delta = pre.integrate(0, 1_000_000, ImuBias::zero(), false);
        assert_relative_eq!(delta.delta_q.angle(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn covariance_grows_with_time() {
        let mut pre = Preintegrator::new(ImuNoise::default());
        pre.data = constant_samples(100, 100.0, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));

        let short = pre.integrate(0, 500_000, ImuBias::zero(), true);
        let long = pre.integrate(0, 1_000_000, ImuBias::zero(), true);
        assert!(long.covariance.trace() > short.covariance.trace());
    }

    #[test]
    fn bias_jacobian_predicts_reintegration() {
        let mut pre = Preintegrator::new(ImuNoise::default());
        pre.data = constant_samples(
            100,
            100.0,
            Vector3::new(0.02, -0.01, 0.03),
            Vector3::new(0.5, 0.2, 9.7),
        );

        let nominal = pre.integrate(0, 1_000_000, ImuBias::zero(), true);

        // < 5% relative perturbation of the measured rates.
        let perturbed_bias = ImuBias {
            gyro: Vector3::new(1e-3, -5e-4, 8e-4),
            accel: Vector3::new(5e-3, -2e-3, 1e-2),
        };
        let (q_corr, v_corr, p_corr) = nominal.corrected(&perturbed_bias);

        let fresh = pre.integrate(0, 1_000_000, perturbed_bias, false);

        assert!(q_corr.angle_to(&fresh.delta_q) < 1e-3);
        assert!((v_corr - fresh.delta_v).norm() < 1e-2);
        assert!((p_corr - fresh.delta_p).norm() < 1e-2);
    }

    #[test]
    fn empty_interval_returns_identity() {
        let pre = Preintegrator::new(ImuNoise::default());
        let delta = pre.integrate(1_000_000, 1_000_000, ImuBias::zero(), true);
        assert_eq!(delta.dt, 0.0);
        assert_relative_eq!(delta.delta_p, Vector3::zeros());
    }
}
