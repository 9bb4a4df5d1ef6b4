//! Lidar front-end: scan buffering and registration.
//!
//! Two registration flavors produce relative-pose transactions: windowed
//! multi-scan registration against the N most recent scans, and scan-to-map
//! registration against a rolling local map. The point-cloud matcher behind
//! both is a capability ([`Matcher`]) selected by tag string at startup.

mod matcher;
mod multi_scan;
mod scan_pose;
mod scan_to_map;

pub use matcher::{create_matcher, IcpConfig, Matcher, PointToPointIcp3D};
pub use multi_scan::MultiScanRegistration;
pub use scan_pose::ScanPose;
pub use scan_to_map::ScanToMapRegistration;
