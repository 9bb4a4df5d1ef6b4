//! Visual front-end: feature tracks, landmark map, keyframing, and
//! reprojection constraint generation.
//!
//! Feature detection and matching live outside the core; the front-end sees
//! them through the [`FeatureTracker`] capability and records everything in a
//! [`TrackTable`]. Landmarks are owned by a single id-keyed [`VisualMap`];
//! keyframes and submaps refer to them by id only.

mod camera;
mod frontend;
mod map;
mod tracks;

pub use camera::PinholeCamera;
pub use frontend::{Localization, VisualFrontend};
pub(crate) use frontend::triangulate_dlt;
pub use map::{Landmark, VisualMap};
pub use tracks::TrackTable;

use nalgebra::Vector2;

/// A raw camera image as delivered by the transport layer.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    /// Timestamp in microseconds, monotonic per camera.
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    /// Pixel encoding, e.g. "mono8".
    pub encoding: String,
    pub pixels: Vec<u8>,
}

/// Capability set of the external feature tracker.
///
/// Track ids are stable across frames for as long as the tracker keeps a
/// feature alive; the front-end treats them as landmark ids.
pub trait FeatureTracker: Send {
    /// Advance the tracker by one frame, returning the (track id, pixel)
    /// observations visible in it.
    fn track(&mut self, frame: &ImageFrame) -> Vec<(u64, Vector2<f64>)>;
}
