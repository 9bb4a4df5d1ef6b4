//! ASCII PCD v0.7 reader and writer.
//!
//! Only the `x y z` float layout used by the run persistence. Coordinates
//! are written with fixed precision, so a save → load → save cycle is
//! byte-stable.

use std::fmt::Write as _;
use std::path::Path;

use nalgebra::Vector3;

use triveni_core::PointCloud3D;

use super::IoError;

/// Serialize a cloud to PCD text.
pub fn to_pcd_string(cloud: &PointCloud3D) -> String {
    let n = cloud.len();
    let mut out = String::new();
    out.push_str("# .PCD v0.7 - Point Cloud Data file format\n");
    out.push_str("VERSION 0.7\n");
    out.push_str("FIELDS x y z\n");
    out.push_str("SIZE 8 8 8\n");
    out.push_str("TYPE F F F\n");
    out.push_str("COUNT 1 1 1\n");
    let _ = writeln!(out, "WIDTH {n}");
    out.push_str("HEIGHT 1\n");
    out.push_str("VIEWPOINT 0 0 0 1 0 0 0\n");
    let _ = writeln!(out, "POINTS {n}");
    out.push_str("DATA ascii\n");
    for p in &cloud.points {
        let _ = writeln!(out, "{:.6} {:.6} {:.6}", p.x, p.y, p.z);
    }
    out
}

/// Parse PCD text into a cloud.
pub fn from_pcd_string(text: &str) -> Result<PointCloud3D, IoError> {
    let mut points = Vec::new();
    let mut in_data = false;
    for line in text.lines() {
        if in_data {
            let mut values = line.split_whitespace().map(str::parse::<f64>);
            match (values.next(), values.next(), values.next()) {
                (Some(Ok(x)), Some(Ok(y)), Some(Ok(z))) => {
                    points.push(Vector3::new(x, y, z));
                }
                _ => {
                    return Err(IoError::Format(format!("bad pcd data line: '{line}'")));
                }
            }
        } else if let Some(format) = line.strip_prefix("DATA ") {
            if format.trim() != "ascii" {
                return Err(IoError::Format(format!(
                    "unsupported pcd data format '{}'",
                    format.trim()
                )));
            }
            in_data = true;
        }
    }
    if !in_data {
        return Err(IoError::Format("pcd file has no DATA section".to_string()));
    }
    Ok(PointCloud3D::from_points(points))
}

/// Write a cloud to a file.
pub fn save_pcd(cloud: &PointCloud3D, path: &Path) -> Result<(), IoError> {
    std::fs::write(path, to_pcd_string(cloud))?;
    Ok(())
}

/// Read a cloud from a file.
pub fn load_pcd(path: &Path) -> Result<PointCloud3D, IoError> {
    from_pcd_string(&std::fs::read_to_string(path)?)
}
