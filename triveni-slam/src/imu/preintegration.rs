//! IMU preintegration front-end.
//!
//! Owns the sample buffers and the two states the rest of the system sees:
//! the anchor state `i` at the last keyframe and the rolling state `k` used
//! to answer pose predictions between keyframes. Closing an interval
//! produces a transaction with the preintegrated constraint linking state
//! `i` to the new state `j`, then rolls the anchor forward.

use std::collections::VecDeque;

use nalgebra::{UnitQuaternion, Vector3};

use triveni_core::{
    FactorGraph, ImuBias, ImuNoise, ImuSample, ImuState, Matrix15, Pose3D, PreintegratedDelta,
    Transaction, GRAVITY_WORLD,
};

use crate::config::ImuSection;
use crate::error::SlamError;

use super::Preintegrator;

/// Source tag on preintegrated constraints.
const SOURCE: &str = "IMU_PREINTEGRATION";
/// Source tag on the first-state prior.
const PRIOR_SOURCE: &str = "FIRST_IMU_STATE_PRIOR";

/// Sample buffering plus the keyframe-anchored preintegration state machine.
pub struct ImuPreintegration {
    params: ImuSection,
    noise: ImuNoise,

    /// Samples not yet consumed by the current interval.
    current_buffer: VecDeque<ImuSample>,
    /// All samples since the anchor, kept so the working buffer can be
    /// rebuilt after a graph update.
    total_buffer: VecDeque<ImuSample>,

    /// Integrator holding the samples of the open interval (i, ·].
    window: Preintegrator,

    /// Anchor state at the last keyframe.
    state_i: ImuState,
    /// Rolling prediction state between keyframes.
    state_k: ImuState,

    first_window: bool,
    last_pushed_us: Option<u64>,
    /// Samples dropped for violating monotonicity.
    out_of_order_count: u64,
}

impl ImuPreintegration {
    /// Create a preintegrator with optional initial bias estimates.
    ///
    /// Fails with CONFIG_INVALID if the prior noise is not positive.
    pub fn new(params: ImuSection, initial_bias: ImuBias) -> Result<Self, SlamError> {
        if params.cov_prior_noise <= 0.0 {
            return Err(SlamError::ConfigInvalid {
                context: "prior noise on IMU state must be positive".to_string(),
            });
        }
        let noise = ImuNoise {
            sigma_gyro: params.sigma_gyro,
            sigma_accel: params.sigma_accel,
            sigma_gyro_walk: params.sigma_gyro_walk,
            sigma_accel_walk: params.sigma_accel_walk,
        };
        let mut state = ImuState::at_origin(0);
        state.bias = initial_bias;
        Ok(Self {
            params,
            noise,
            current_buffer: VecDeque::new(),
            total_buffer: VecDeque::new(),
            window: Preintegrator::new(noise),
            state_i: state,
            state_k: state,
            first_window: true,
            last_pushed_us: None,
            out_of_order_count: 0,
        })
    }

    /// Anchor state at the last keyframe.
    pub fn anchor_state(&self) -> &ImuState {
        &self.state_i
    }

    /// Samples dropped for arriving out of order.
    pub fn out_of_order_count(&self) -> u64 {
        self.out_of_order_count
    }

    /// Append a raw sample.
    ///
    /// Fails with OUT_OF_ORDER (and drops the sample) if its stamp is not
    /// strictly after the last stored stamp; the preintegrator keeps running.
    pub fn push_sample(
        &mut self,
        timestamp_us: u64,
        angular_velocity: Vector3<f64>,
        linear_acceleration: Vector3<f64>,
    ) -> Result<(), SlamError> {
        if let Some(last_us) = self.last_pushed_us {
            if timestamp_us <= last_us {
                self.out_of_order_count += 1;
                return Err(SlamError::OutOfOrder {
                    what: "imu sample",
                    stamp_us: timestamp_us,
                    last_us,
                });
            }
            let gap_s = (timestamp_us - last_us) as f64 * 1e-6;
            if gap_s > self.params.max_sample_gap_s {
                log::warn!(
                    "imu sample gap of {:.3} s exceeds configured maximum {:.3} s",
                    gap_s,
                    self.params.max_sample_gap_s
                );
            }
        }
        let sample = ImuSample {
            timestamp_us,
            angular_velocity,
            linear_acceleration,
        };
        self.current_buffer.push_back(sample);
        self.total_buffer.push_back(sample);
        self.last_pushed_us = Some(timestamp_us);
        Ok(())
    }

    /// Anchor the keyframe state at `timestamp_us`, discarding older samples.
    pub fn set_start(
        &mut self,
        timestamp_us: u64,
        orientation: Option<UnitQuaternion<f64>>,
        position: Option<Vector3<f64>>,
        velocity: Option<Vector3<f64>>,
    ) {
        while matches!(self.current_buffer.front(), Some(s) if s.timestamp_us <= timestamp_us) {
            self.current_buffer.pop_front();
        }
        while matches!(self.total_buffer.front(), Some(s) if s.timestamp_us <= timestamp_us) {
            self.total_buffer.pop_front();
        }

        let mut state = ImuState::at_origin(timestamp_us);
        if let Some(q) = orientation {
            state.orientation = q;
        }
        if let Some(p) = position {
            state.position = p;
        }
        if let Some(v) = velocity {
            state.velocity = v;
        }
        state.bias = self.state_i.bias;

        self.state_i = state;
        self.state_k = state;
        self.window.clear();
        self.first_window = true;
    }

    /// Predict `T_world_imu` at `timestamp_us` by integrating buffered
    /// samples forward from the rolling state.
    ///
    /// Fails with NOT_READY if no samples are buffered or the request
    /// precedes the buffer front.
    pub fn predict_pose(&mut self, timestamp_us: u64) -> Result<Pose3D, SlamError> {
        if timestamp_us == self.state_k.timestamp_us {
            return Ok(self.state_k.pose());
        }

        let front = self.current_buffer.front().ok_or(SlamError::NotReady {
            context: "imu buffer is empty",
        })?;
        if timestamp_us < front.timestamp_us {
            return Err(SlamError::NotReady {
                context: "prediction requested before the imu buffer front",
            });
        }

        // Move consumed samples into the open window and integrate only the
        // new span (state_k → timestamp_us).
        let mut interval = Preintegrator::new(self.noise);
        while let Some(sample) = self.current_buffer.front().copied() {
            if sample.timestamp_us > timestamp_us {
                break;
            }
            self.current_buffer.pop_front();
            interval.data.push(sample);
            self.window.data.push(sample);
        }

        let delta = interval.integrate(
            self.state_k.timestamp_us,
            timestamp_us,
            self.state_i.bias,
            false,
        );
        self.state_k = predict_state(&delta, &self.state_k, timestamp_us);
        Ok(self.state_k.pose())
    }

    /// Close the interval at `timestamp_us` and produce the transaction
    /// linking state i to the new state j.
    ///
    /// On the first interval a prior on state i is included. If orientation
    /// and position overrides are supplied, the rolled anchor adopts them and
    /// its velocity is recomputed from the position chord. An empty or
    /// non-positive interval yields an empty transaction.
    pub fn register_preintegrated_factor(
        &mut self,
        timestamp_us: u64,
        orientation: Option<UnitQuaternion<f64>>,
        position: Option<Vector3<f64>>,
    ) -> Result<Transaction, SlamError> {
        let mut transaction = Transaction::new(timestamp_us);

        if timestamp_us <= self.state_i.timestamp_us {
            return Ok(transaction);
        }
        if let Some(front) = self.current_buffer.front() {
            if timestamp_us < front.timestamp_us && self.window.data.is_empty() {
                return Err(SlamError::NotReady {
                    context: "no imu samples cover the requested interval",
                });
            }
        } else if self.window.data.is_empty() {
            return Err(SlamError::NotReady {
                context: "imu buffer is empty",
            });
        }

        if self.first_window {
            let prior_covariance = Matrix15::identity() * self.params.cov_prior_noise;
            transaction.add_imu_state_prior(self.state_i, prior_covariance, PRIOR_SOURCE);
            transaction.add_imu_state_variables(&self.state_i);
            self.first_window = false;
        }

        while let Some(sample) = self.current_buffer.front().copied() {
            if sample.timestamp_us > timestamp_us {
                break;
            }
            self.current_buffer.pop_front();
            self.window.data.push(sample);
        }

        let delta = self.window.integrate(
            self.state_i.timestamp_us,
            timestamp_us,
            self.state_i.bias,
            true,
        );

        let mut state_j = predict_state(&delta, &self.state_i, timestamp_us);

        transaction.add_preintegrated_imu_constraint(
            self.state_i.timestamp_us,
            timestamp_us,
            delta,
            SOURCE,
        );
        transaction.add_imu_state_variables(&state_j);

        // Adopt externally supplied pose for the rolled anchor, recomputing
        // the velocity from the position chord.
        if let (Some(q), Some(p)) = (orientation, position) {
            let dt = (timestamp_us - self.state_i.timestamp_us) as f64 * 1e-6;
            state_j.orientation = q;
            state_j.velocity = (p - self.state_i.position) / dt;
            state_j.position = p;
        }

        self.state_i = state_j;
        self.state_k = state_j;

        while matches!(self.total_buffer.front(), Some(s) if s.timestamp_us < self.state_i.timestamp_us)
        {
            self.total_buffer.pop_front();
        }

        self.window.clear();
        Ok(transaction)
    }

    /// Refresh the anchor from post-optimization graph values and rebuild
    /// the working buffer from the total buffer.
    pub fn update_from_graph(&mut self, graph: &FactorGraph) {
        let stamp = self.state_i.timestamp_us;
        match graph.imu_state(stamp) {
            Some(state) => {
                self.state_i = state;
                self.state_k = state;
                self.current_buffer = self.total_buffer.clone();
                self.window.clear();
            }
            None => {
                log::debug!("anchor state at {} µs not present in graph", stamp);
            }
        }
    }
}

/// Predict the state at `t_new` from `from` plus a gravity-free delta.
///
/// Gravity is applied here, in the world frame.
fn predict_state(delta: &PreintegratedDelta, from: &ImuState, t_new_us: u64) -> ImuState {
    let dt = delta.dt;
    let rot = from.orientation;

    ImuState {
        timestamp_us: t_new_us,
        orientation: rot * delta.delta_q,
        velocity: from.velocity + GRAVITY_WORLD * dt + rot * delta.delta_v,
        position: from.position
            + from.velocity * dt
            + 0.5 * GRAVITY_WORLD * dt * dt
            + rot * delta.delta_p,
        bias: from.bias,
    }
}
