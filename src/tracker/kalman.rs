//! Per-corner Kalman filter: constant-velocity state `[x, y, vx, vy]`,
//! `Δt = 1`, used to smooth the four projected corners frame to frame.

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};

/// Position variance injected per step (~2 px expected displacement).
const PROCESS_NOISE_POS: f64 = 4.0;
/// Velocity variance injected per step.
const PROCESS_NOISE_VEL: f64 = 1.0;
/// Measurement noise variance (~1 px).
const MEASUREMENT_NOISE: f64 = 1.0;
/// Initial posterior covariance, diagonal.
const INITIAL_COVARIANCE: f64 = 10.0;

/// A single corner's Kalman filter. Reset (not re-measured) whenever its
/// target transitions `IDLE -> DETECTED`, per the spec's open-question
/// resolution.
#[derive(Debug, Clone)]
pub struct CornerKalman {
    state: Vector4<f64>,
    covariance: Matrix4<f64>,
}

impl CornerKalman {
    /// Initial posterior: the first observed corner, zero velocity,
    /// diagonal covariance of 10.
    pub fn new(initial_x: f32, initial_y: f32) -> Self {
        Self {
            state: Vector4::new(initial_x as f64, initial_y as f64, 0.0, 0.0),
            covariance: Matrix4::identity() * INITIAL_COVARIANCE,
        }
    }

    fn transition() -> Matrix4<f64> {
        #[rustfmt::skip]
        let f = Matrix4::new(
            1.0, 0.0, 1.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        f
    }

    fn process_noise() -> Matrix4<f64> {
        Matrix4::from_diagonal(&Vector4::new(
            PROCESS_NOISE_POS,
            PROCESS_NOISE_POS,
            PROCESS_NOISE_VEL,
            PROCESS_NOISE_VEL,
        ))
    }

    fn measurement_matrix() -> Matrix2x4<f64> {
        #[rustfmt::skip]
        let h = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );
        h
    }

    fn predict(&mut self) {
        let f = Self::transition();
        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + Self::process_noise();
    }

    /// Predict then update with a new corner measurement, returning the
    /// smoothed posterior position.
    pub fn step(&mut self, measurement_x: f32, measurement_y: f32) -> (f32, f32) {
        self.predict();

        let h = Self::measurement_matrix();
        let z = Vector2::new(measurement_x as f64, measurement_y as f64);
        let y = z - h * self.state;
        let r = Matrix2::identity() * MEASUREMENT_NOISE;
        let s = h * self.covariance * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            // Degenerate innovation covariance: fall back to the raw
            // measurement rather than propagate NaNs into the state.
            self.state[0] = measurement_x as f64;
            self.state[1] = measurement_y as f64;
            return (measurement_x, measurement_y);
        };
        let k: Matrix4x2<f64> = self.covariance * h.transpose() * s_inv;
        self.state += k * y;
        self.covariance = (Matrix4::identity() - k * h) * self.covariance;

        (self.state[0] as f32, self.state[1] as f32)
    }

    pub fn position(&self) -> (f32, f32) {
        (self.state[0] as f32, self.state[1] as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_measured_corner_with_zero_velocity() {
        let kf = CornerKalman::new(12.0, 34.0);
        assert_eq!(kf.position(), (12.0, 34.0));
    }

    #[test]
    fn tracks_a_smoothly_moving_corner() {
        let mut kf = CornerKalman::new(0.0, 0.0);
        let mut last = (0.0f32, 0.0f32);
        for i in 1..20 {
            last = kf.step(i as f32, 0.0);
        }
        assert!((last.0 - 19.0).abs() < 1.0);
        assert!(last.1.abs() < 0.5);
    }

    #[test]
    fn smooths_a_single_noisy_measurement() {
        let mut kf = CornerKalman::new(10.0, 10.0);
        // Feed a steady position a few times so the filter's gain shrinks...
        for _ in 0..5 {
            kf.step(10.0, 10.0);
        }
        // ...then a single outlier measurement should be damped, not
        // followed exactly.
        let (x, _) = kf.step(50.0, 10.0);
        assert!(x < 50.0);
        assert!(x > 10.0);
    }
}
