//! IMU samples, states, noise models, and preintegrated deltas.

use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::Pose3D;

/// 15×15 matrix over the error state (δφ, δv, δp, δb_g, δb_a).
pub type Matrix15 = SMatrix<f64, 15, 15>;

/// Gravity vector in the world frame (m/s²).
pub const GRAVITY_WORLD: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// A single raw IMU measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// Timestamp in microseconds.
    pub timestamp_us: u64,
    /// Angular velocity in rad/s, body frame.
    pub angular_velocity: Vector3<f64>,
    /// Linear acceleration in m/s², body frame (includes gravity).
    pub linear_acceleration: Vector3<f64>,
}

impl ImuSample {
    /// Timestamp in seconds.
    #[inline]
    pub fn secs(&self) -> f64 {
        self.timestamp_us as f64 * 1e-6
    }
}

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    /// Zero bias.
    pub fn zero() -> Self {
        Self::default()
    }
}

/// IMU noise densities (1-sigma, continuous time).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuNoise {
    /// Gyroscope measurement noise (rad/s/√Hz).
    pub sigma_gyro: f64,
    /// Accelerometer measurement noise (m/s²/√Hz).
    pub sigma_accel: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub sigma_gyro_walk: f64,
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub sigma_accel_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        // Typical MEMS values, close to the EuRoC sensor sheet.
        Self {
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
            sigma_gyro_walk: 1.9e-5,
            sigma_accel_walk: 3.0e-3,
        }
    }
}

impl ImuNoise {
    /// Discrete gyro measurement variance for a step of `dt` seconds.
    #[inline]
    pub fn gyro_variance(&self, dt: f64) -> f64 {
        self.sigma_gyro * self.sigma_gyro * dt
    }

    /// Discrete accel measurement variance for a step of `dt` seconds.
    #[inline]
    pub fn accel_variance(&self, dt: f64) -> f64 {
        self.sigma_accel * self.sigma_accel * dt
    }

    /// Discrete gyro bias walk variance for a step of `dt` seconds.
    #[inline]
    pub fn gyro_walk_variance(&self, dt: f64) -> f64 {
        self.sigma_gyro_walk * self.sigma_gyro_walk * dt
    }

    /// Discrete accel bias walk variance for a step of `dt` seconds.
    #[inline]
    pub fn accel_walk_variance(&self, dt: f64) -> f64 {
        self.sigma_accel_walk * self.sigma_accel_walk * dt
    }
}

/// Full inertial navigation state at a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuState {
    /// Timestamp in microseconds.
    pub timestamp_us: u64,
    /// Orientation `R_world_imu`.
    pub orientation: UnitQuaternion<f64>,
    /// Position in the world frame, meters.
    pub position: Vector3<f64>,
    /// Velocity in the world frame, m/s.
    pub velocity: Vector3<f64>,
    /// Biases at this state.
    pub bias: ImuBias,
}

impl ImuState {
    /// State at the origin with zero velocity and bias.
    pub fn at_origin(timestamp_us: u64) -> Self {
        Self {
            timestamp_us,
            orientation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            bias: ImuBias::zero(),
        }
    }

    /// Timestamp in seconds.
    #[inline]
    pub fn secs(&self) -> f64 {
        self.timestamp_us as f64 * 1e-6
    }

    /// Pose `T_world_imu` of this state.
    #[inline]
    pub fn pose(&self) -> Pose3D {
        Pose3D::new(self.orientation, self.position)
    }
}

/// Preintegrated IMU motion over an interval (t_i, t_j].
///
/// Contents are exactly the integral of the samples in the interval under the
/// linearization biases `bias_lin`; gravity is *not* included and must be
/// added in the world frame at prediction time. The covariance is over the
/// 15-dimensional error state (δφ, δv, δp, δb_g, δb_a) and the five 3×3
/// Jacobians allow first-order correction for small bias changes without
/// re-integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreintegratedDelta {
    /// Interval length in seconds.
    pub dt: f64,
    /// Rotation increment ΔR_ij.
    pub delta_q: UnitQuaternion<f64>,
    /// Velocity increment Δv_ij (body frame of state i, gravity-free).
    pub delta_v: Vector3<f64>,
    /// Position increment Δp_ij (body frame of state i, gravity-free).
    pub delta_p: Vector3<f64>,
    /// 15×15 error-state covariance.
    pub covariance: Matrix15,
    /// ∂(ΔR)/∂b_g
    pub j_r_bg: Matrix3<f64>,
    /// ∂(Δv)/∂b_g
    pub j_v_bg: Matrix3<f64>,
    /// ∂(Δv)/∂b_a
    pub j_v_ba: Matrix3<f64>,
    /// ∂(Δp)/∂b_g
    pub j_p_bg: Matrix3<f64>,
    /// ∂(Δp)/∂b_a
    pub j_p_ba: Matrix3<f64>,
    /// Biases the delta was integrated under.
    pub bias_lin: ImuBias,
}

impl PreintegratedDelta {
    /// Identity delta (empty interval).
    pub fn identity(bias_lin: ImuBias) -> Self {
        Self {
            dt: 0.0,
            delta_q: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            covariance: Matrix15::zeros(),
            j_r_bg: Matrix3::zeros(),
            j_v_bg: Matrix3::zeros(),
            j_v_ba: Matrix3::zeros(),
            j_p_bg: Matrix3::zeros(),
            j_p_ba: Matrix3::zeros(),
            bias_lin,
        }
    }

    /// Apply the first-order bias correction for biases `bias`.
    ///
    /// Returns (ΔR̃, Δṽ, Δp̃) corrected from `bias_lin` to `bias` using the
    /// stored Jacobians.
    pub fn corrected(&self, bias: &ImuBias) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let delta_bg = bias.gyro - self.bias_lin.gyro;
        let delta_ba = bias.accel - self.bias_lin.accel;

        let delta_q = self.delta_q * UnitQuaternion::from_scaled_axis(self.j_r_bg * delta_bg);
        let delta_v = self.delta_v + self.j_v_bg * delta_bg + self.j_v_ba * delta_ba;
        let delta_p = self.delta_p + self.j_p_bg * delta_bg + self.j_p_ba * delta_ba;

        (delta_q, delta_v, delta_p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_delta_corrected_with_same_bias_is_unchanged() {
        let delta = PreintegratedDelta::identity(ImuBias::zero());
        let (q, v, p) = delta.corrected(&ImuBias::zero());
        assert_relative_eq!(q.angle(), 0.0);
        assert_relative_eq!(v, Vector3::zeros());
        assert_relative_eq!(p, Vector3::zeros());
    }
}
