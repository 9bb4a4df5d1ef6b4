//! Feature track bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::Vector2;

/// Observations of feature tracks across frames.
///
/// A track is the pixel trace of one feature through time; its id doubles as
/// the landmark id once the track is triangulated.
#[derive(Debug, Clone, Default)]
pub struct TrackTable {
    /// track id → (stamp → pixel)
    tracks: HashMap<u64, BTreeMap<u64, Vector2<f64>>>,
    /// Frames the table has seen.
    stamps: BTreeSet<u64>,
}

impl TrackTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame stamp has been recorded.
    pub fn has_stamp(&self, stamp_us: u64) -> bool {
        self.stamps.contains(&stamp_us)
    }

    /// Record a frame's observations.
    pub fn add_frame(&mut self, stamp_us: u64, observations: &[(u64, Vector2<f64>)]) {
        self.stamps.insert(stamp_us);
        for (id, pixel) in observations {
            self.tracks.entry(*id).or_default().insert(stamp_us, *pixel);
        }
    }

    /// All (track id, pixel) observations at a frame.
    pub fn observations_at(&self, stamp_us: u64) -> Vec<(u64, Vector2<f64>)> {
        let mut out: Vec<(u64, Vector2<f64>)> = self
            .tracks
            .iter()
            .filter_map(|(id, obs)| obs.get(&stamp_us).map(|p| (*id, *p)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// The pixel trace of one track.
    pub fn observations_of(&self, id: u64) -> Option<&BTreeMap<u64, Vector2<f64>>> {
        self.tracks.get(&id)
    }

    /// Pixel of a track at a frame.
    pub fn pixel(&self, id: u64, stamp_us: u64) -> Option<Vector2<f64>> {
        self.tracks.get(&id).and_then(|obs| obs.get(&stamp_us)).copied()
    }

    /// Number of live tracks.
    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Drop all observations older than `stamp_us` and tracks that become
    /// empty.
    pub fn prune_before(&mut self, stamp_us: u64) {
        self.stamps = self.stamps.split_off(&stamp_us);
        self.tracks.retain(|_, obs| {
            *obs = obs.split_off(&stamp_us);
            !obs.is_empty()
        });
    }

    /// Mean pixel distance between corresponding observations at two frames,
    /// restricted to the given track ids. `None` when no track is seen in
    /// both frames.
    pub fn mean_parallax(&self, ids: &[u64], stamp_a_us: u64, stamp_b_us: u64) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for id in ids {
            if let (Some(a), Some(b)) = (self.pixel(*id, stamp_a_us), self.pixel(*id, stamp_b_us))
            {
                sum += (a - b).norm();
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }
}
