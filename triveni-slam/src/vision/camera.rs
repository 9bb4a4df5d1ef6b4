//! Pinhole camera model.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use triveni_core::PinholeIntrinsics;

/// Distortion-free pinhole camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl PinholeCamera {
    /// Project a camera-frame point to pixels.
    ///
    /// `None` for points at or behind the focal plane or outside the image.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        let pixel = self.intrinsics().project(p_cam)?;
        let in_bounds = pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x < self.width as f64
            && pixel.y < self.height as f64;
        in_bounds.then_some(pixel)
    }

    /// Back-project a pixel to a unit-depth camera-frame ray.
    pub fn backproject(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
    }

    /// The projection parameters carried into reprojection constraints.
    pub fn intrinsics(&self) -> PinholeIntrinsics {
        PinholeIntrinsics {
            fx: self.fx,
            fy: self.fy,
            cx: self.cx,
            cy: self.cy,
        }
    }
}
