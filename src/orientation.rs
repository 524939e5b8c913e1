//! Direction cosine matrix orientation filter
//!
//! The device orientation is tracked as three body axes `i_b, j_b, k_b`
//! expressed in world coordinates. Each IMU sample nudges the basis by a
//! small rotation `dθ` that blends the gyroscope rate with the tilt error
//! between `k_b` and the measured gravity direction.
//!
//! See <http://www.starlino.com/dcm_tutorial.html>.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Value type used for all IMU vectors
pub type Vec3 = Vector3<f32>;

/// Normalize, mapping the zero vector to itself instead of NaN
pub fn normalize_or_zero(v: &Vec3) -> Vec3 {
    v.try_normalize(0.0).unwrap_or_else(Vec3::zeros)
}

/// How the basis is re-orthogonalized after each update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrthogonalityCorrection {
    /// `i' = norm(i - ε·j)`, `j' = norm(j - ε·i)`
    #[default]
    Standard,
    /// `i' = norm((i - ε) ⊙ j)`, `j' = norm((j - ε) ⊙ i')`, component-wise.
    /// Collapses an axis-aligned basis to zero; kept for comparison.
    ComponentWise,
}

/// DCM filter state
#[derive(Debug, Clone)]
pub struct OrientationFilter {
    i_b: Vec3,
    j_b: Vec3,
    k_b: Vec3,
    alpha: f32,
    err: f32,
    correction: OrthogonalityCorrection,
    recenter_requested: bool,
}

impl OrientationFilter {
    /// `alpha` weights the accelerometer/gyro blend; larger moves faster.
    pub fn new(alpha: f32) -> Self {
        Self::with_correction(alpha, OrthogonalityCorrection::default())
    }

    pub fn with_correction(alpha: f32, correction: OrthogonalityCorrection) -> Self {
        Self {
            i_b: Vec3::x(),
            j_b: Vec3::y(),
            k_b: Vec3::z(),
            alpha,
            err: 0.0,
            correction,
            // The first sample only seeds the basis
            recenter_requested: true,
        }
    }

    /// Reset to the world frame on the next sample
    pub fn recenter(&mut self) {
        self.recenter_requested = true;
    }

    pub fn recenter_pending(&self) -> bool {
        self.recenter_requested
    }

    /// Body axes `(i_b, j_b, k_b)`
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        (self.i_b, self.j_b, self.k_b)
    }

    /// Half the dot product of `i_b` and `j_b` from the last update
    pub fn orthogonality_error(&self) -> f32 {
        self.err
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Fuse one accelerometer (G) and gyroscope sample taken `dt` seconds
    /// after the previous one.
    pub fn update(&mut self, accel: Vec3, gyro: Vec3, dt: f32) {
        if self.recenter_requested {
            self.i_b = Vec3::x();
            self.j_b = Vec3::y();
            self.k_b = Vec3::z();
            self.recenter_requested = false;
            trace!("Orientation recentered");
            return;
        }

        let k_acc = -normalize_or_zero(&accel);
        let w_a = self.k_b.cross(&k_acc);
        let w_g = -(gyro * dt);
        let d_theta = (w_a + w_g) * self.alpha / (1.0 + self.alpha);

        self.k_b += d_theta.cross(&self.k_b);
        self.i_b += d_theta.cross(&self.i_b);
        self.j_b += d_theta.cross(&self.j_b);

        self.err = self.i_b.dot(&self.j_b) * 0.5;
        match self.correction {
            OrthogonalityCorrection::Standard => {
                let i_b = normalize_or_zero(&(self.i_b - self.j_b * self.err));
                let j_b = normalize_or_zero(&(self.j_b - self.i_b * self.err));
                self.i_b = i_b;
                self.j_b = j_b;
            }
            OrthogonalityCorrection::ComponentWise => {
                self.i_b = normalize_or_zero(&self.i_b.add_scalar(-self.err).component_mul(&self.j_b));
                self.j_b = normalize_or_zero(&self.j_b.add_scalar(-self.err).component_mul(&self.i_b));
            }
        }
        self.k_b = self.i_b.cross(&self.j_b);
    }

    /// Nearest proper rotation to the current basis
    pub fn rotation(&self) -> UnitQuaternion<f32> {
        let m = Matrix3::from_columns(&[self.i_b, self.j_b, self.k_b]);
        if m.iter().all(|v| v.is_finite()) && m.determinant() > f32::EPSILON {
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&m))
        } else {
            UnitQuaternion::identity()
        }
    }

    /// Roll, pitch, yaw in radians
    pub fn euler_angles(&self) -> (f32, f32, f32) {
        self.rotation().euler_angles()
    }
}
