//! Submap manager, global map, loop closure, and relocalization.
//!
//! The optimized trajectory is sliced into fixed-radius submaps. Every new
//! submap anchor enters the pose graph through a transaction; completed
//! submaps are searched for loop closures, and reloc requests are answered
//! from offline submaps first, then online ones.

mod candidate_search;
mod refinement;
mod submap;

pub use candidate_search::{create_candidate_search, CandidateSearcher, EucDistCandidateSearch};
pub use refinement::{create_refiner, IcpRefiner, Refiner};
pub use submap::{Keypoint, Submap};

use std::collections::HashSet;

use nalgebra::Vector3;

use triveni_core::{FactorGraph, LoamFeatureClouds, PointCloud3D, Pose3D, Transaction};

use crate::config::{covariance_from_diagonal, GlobalMapSection};
use crate::error::SlamError;

/// Source tag on anchor-to-anchor constraints.
const LOCAL_MAPPER_SOURCE: &str = "LOCAL_MAPPER";
/// Source tag on the first anchor's prior.
const FIRST_SUBMAP_SOURCE: &str = "FIRST_SUBMAP_PRIOR";
/// Source tag on loop-closure constraints.
const LOOP_CLOSURE_SOURCE: &str = "LOOP_CLOSURE";

/// A camera measurement routed into a submap: landmark id, world position,
/// optional vocabulary word id.
pub type CameraMeasurement = (u64, Vector3<f64>, Option<u32>);

/// A relocalization request.
#[derive(Debug, Clone)]
pub struct RelocRequest {
    pub stamp_us: u64,
    /// Query pose in the requester's (landmark) world frame.
    pub t_worldlm_baselink: Pose3D,
    /// Optional query cloud in the baselink frame.
    pub lidar: Option<PointCloud3D>,
}

/// Outcome of a relocalization request.
#[derive(Debug, Clone)]
pub enum RelocResult {
    /// The query matched the currently active submap; nothing to do.
    NoUpdate,
    /// No submap could be refined against the query.
    NotFound,
    /// A submap matched.
    Matched {
        offline: bool,
        submap_index: usize,
        /// Refined `T_match_query`.
        t_match_query: Pose3D,
    },
}

/// World-frame submap contents published on loop closure or reloc.
#[derive(Debug, Clone)]
pub struct SubmapMessage {
    pub anchor_stamp_us: u64,
    pub t_world_submap: Pose3D,
    pub lidar: PointCloud3D,
    pub loam: LoamFeatureClouds,
    pub keypoints: Vec<(u64, Vector3<f64>)>,
    pub word_ids: Vec<Option<u32>>,
}

/// The global map: online submaps, loop closure, and relocalization.
pub struct GlobalMap {
    params: GlobalMapSection,
    online_submaps: Vec<Submap>,
    offline_submaps: Vec<Submap>,
    candidate_search: Box<dyn CandidateSearcher>,
    refinement: Box<dyn Refiner>,
    /// (match, query) pairs already constrained, one constraint per pair.
    closed_pairs: HashSet<(usize, usize)>,
    /// Alignment of the offline map frame, cached from the first successful
    /// offline reloc.
    t_worldlm_worldoff: Option<Pose3D>,
}

impl GlobalMap {
    /// Create a global map with the configured search and refinement.
    pub fn new(params: GlobalMapSection) -> Result<Self, SlamError> {
        let candidate_search = create_candidate_search(&params)?;
        let refinement = create_refiner(&params)?;
        Ok(Self {
            params,
            online_submaps: Vec::new(),
            offline_submaps: Vec::new(),
            candidate_search,
            refinement,
            closed_pairs: HashSet::new(),
            t_worldlm_worldoff: None,
        })
    }

    /// Online submaps, oldest first.
    pub fn submaps(&self) -> &[Submap] {
        &self.online_submaps
    }

    /// Replace the offline submaps (loaded from a previous run).
    pub fn set_offline_submaps(&mut self, submaps: Vec<Submap>) {
        self.offline_submaps = submaps;
    }

    /// Cached offline frame alignment, if established.
    pub fn offline_alignment(&self) -> Option<Pose3D> {
        self.t_worldlm_worldoff
    }

    /// Take mutable access to a submap (persistence and tests).
    pub fn submap_mut(&mut self, index: usize) -> Option<&mut Submap> {
        self.online_submaps.get_mut(index)
    }

    /// Submap the baselink currently belongs to.
    ///
    /// The previous submap wins when the position lies within `submap_size`
    /// of both the previous and the current anchor. Distances use the
    /// initial anchors, which never move.
    pub fn get_submap_id(&self, t_world_baselink: &Pose3D) -> Option<usize> {
        let position = &t_world_baselink.translation;
        let n = self.online_submaps.len();
        match n {
            0 => None,
            1 => (self.online_submaps[0].distance_to_initial_anchor(position)
                < self.params.submap_size)
                .then_some(0),
            _ => {
                let previous = n - 2;
                let current = n - 1;
                if self.online_submaps[previous].distance_to_initial_anchor(position)
                    < self.params.submap_size
                {
                    Some(previous)
                } else if self.online_submaps[current].distance_to_initial_anchor(position)
                    < self.params.submap_size
                {
                    Some(current)
                } else {
                    None
                }
            }
        }
    }

    /// Route a measurement into the global map.
    ///
    /// Creates a new submap when the pose leaves the current one; the
    /// returned transaction then carries the new anchor variable, its
    /// prior or anchor-to-anchor constraint, and any loop-closure
    /// constraints found for the just-completed submap.
    pub fn add_measurement(
        &mut self,
        cam_measurements: &[CameraMeasurement],
        lidar_cloud: Option<&PointCloud3D>,
        loam: Option<&LoamFeatureClouds>,
        t_world_baselink: Pose3D,
        stamp_us: u64,
    ) -> Transaction {
        let mut tx = Transaction::new(stamp_us);

        let submap_id = match self.get_submap_id(&t_world_baselink) {
            Some(id) => id,
            None => {
                self.online_submaps
                    .push(Submap::new(stamp_us, t_world_baselink));
                tx.merge(self.initiate_new_submap_pose());

                // The submap before the new one is now complete; look for
                // loops closing onto it.
                if self.online_submaps.len() >= 2 {
                    if let Some(loops) = self.run_loop_closure(self.online_submaps.len() - 2) {
                        tx.merge(loops);
                    }
                }
                self.online_submaps.len() - 1
            }
        };

        let submap = &mut self.online_submaps[submap_id];
        submap.add_keyframe_pose(stamp_us, &t_world_baselink);
        if let Some(cloud) = lidar_cloud {
            submap.add_lidar_measurement(cloud, loam, &t_world_baselink);
        }
        for (landmark_id, position_world, word_id) in cam_measurements {
            submap.add_camera_measurement(*landmark_id, position_world, *word_id);
        }

        tx
    }

    /// Transaction introducing the newest submap's anchor into the graph.
    ///
    /// The first anchor gets a prior; every later one is tied to its
    /// predecessor with the local-mapper covariance.
    fn initiate_new_submap_pose(&self) -> Transaction {
        let covariance = covariance_from_diagonal(&self.params.local_mapper_covariance_diag);
        let current = self
            .online_submaps
            .last()
            .expect("called with at least one submap");
        let mut tx = Transaction::new(current.anchor_stamp_us);
        tx.add_pose_variable(current.anchor_stamp_us, current.t_world_submap());

        if self.online_submaps.len() == 1 {
            tx.add_pose_prior(
                current.anchor_stamp_us,
                current.t_world_submap(),
                covariance,
                FIRST_SUBMAP_SOURCE,
            );
        } else {
            let previous = &self.online_submaps[self.online_submaps.len() - 2];
            let delta = previous.t_world_submap().between(&current.t_world_submap());
            tx.add_relative_pose_constraint(
                previous.anchor_stamp_us,
                current.anchor_stamp_us,
                delta,
                covariance,
                LOCAL_MAPPER_SOURCE,
            );
        }
        tx
    }

    /// Search and refine loop closures for the submap at `query_index`.
    ///
    /// Adjacent submaps (q−1, q, q+1) are never candidates; failed
    /// refinements are skipped silently; at most one constraint is emitted
    /// per (match, query) pair over the submap's lifetime. Successful loops
    /// are merged into a single transaction.
    pub fn run_loop_closure(&mut self, query_index: usize) -> Option<Transaction> {
        if query_index >= self.online_submaps.len() {
            return None;
        }

        let query_pose = self.online_submaps[query_index].t_world_submap();
        let candidates = self
            .candidate_search
            .find(&self.online_submaps, &query_pose);

        let covariance = covariance_from_diagonal(&self.params.reloc_covariance_diag);
        let mut tx = Transaction::new(self.online_submaps[query_index].anchor_stamp_us);
        let mut found = false;

        for (match_index, estimate) in candidates {
            if match_index.abs_diff(query_index) <= 1 {
                continue;
            }
            let pair = (
                match_index.min(query_index),
                match_index.max(query_index),
            );
            if self.closed_pairs.contains(&pair) {
                continue;
            }

            let refined = match self.refinement.refine(
                &self.online_submaps[match_index],
                &self.online_submaps[query_index],
                &estimate,
            ) {
                Ok(refined) => refined,
                Err(err) => {
                    log::debug!(
                        "loop refinement {} -> {} skipped: {}",
                        match_index,
                        query_index,
                        err
                    );
                    continue;
                }
            };

            tx.add_relative_pose_constraint(
                self.online_submaps[match_index].anchor_stamp_us,
                self.online_submaps[query_index].anchor_stamp_us,
                refined,
                covariance,
                LOOP_CLOSURE_SOURCE,
            );
            self.closed_pairs.insert(pair);
            found = true;
        }

        found.then_some(tx)
    }

    /// Answer a relocalization request.
    ///
    /// Offline submaps are searched first, then online ones; the first
    /// successful refinement wins. The offline frame alignment is computed
    /// and cached from the first offline success. A match against the
    /// currently active submap reports no update.
    pub fn process_reloc_request(&mut self, request: &RelocRequest) -> RelocResult {
        let mut query = Submap::new(request.stamp_us, request.t_worldlm_baselink);
        if let Some(cloud) = &request.lidar {
            query.add_lidar_measurement(cloud, None, &request.t_worldlm_baselink);
        }

        // Offline map, expressed in its own frame through the cached
        // alignment (identity until established).
        let alignment = self.t_worldlm_worldoff.unwrap_or_else(Pose3D::identity);
        let t_worldoff_query = alignment.inverse().compose(&request.t_worldlm_baselink);
        let offline_candidates = self
            .candidate_search
            .find(&self.offline_submaps, &t_worldoff_query);
        for (index, estimate) in offline_candidates {
            if let Ok(refined) =
                self.refinement
                    .refine(&self.offline_submaps[index], &query, &estimate)
            {
                if self.t_worldlm_worldoff.is_none() {
                    let t_worldoff_match = self.offline_submaps[index].t_world_submap();
                    self.t_worldlm_worldoff = Some(
                        request
                            .t_worldlm_baselink
                            .compose(&refined.inverse())
                            .compose(&t_worldoff_match.inverse()),
                    );
                }
                return RelocResult::Matched {
                    offline: true,
                    submap_index: index,
                    t_match_query: refined,
                };
            }
        }

        let online_candidates = self
            .candidate_search
            .find(&self.online_submaps, &request.t_worldlm_baselink);
        let active = self.online_submaps.len().checked_sub(1);
        for (index, estimate) in online_candidates {
            if let Ok(refined) =
                self.refinement
                    .refine(&self.online_submaps[index], &query, &estimate)
            {
                if Some(index) == active {
                    return RelocResult::NoUpdate;
                }
                return RelocResult::Matched {
                    offline: false,
                    submap_index: index,
                    t_match_query: refined,
                };
            }
        }

        RelocResult::NotFound
    }

    /// Refresh all anchor poses after optimization.
    pub fn update_from_graph(&mut self, graph: &FactorGraph) {
        for submap in self.online_submaps.iter_mut() {
            submap.update_from_graph(graph);
        }
    }

    /// Assemble the world-frame message for a submap.
    pub fn submap_message(&self, index: usize) -> Option<SubmapMessage> {
        let submap = self.online_submaps.get(index)?;
        Some(SubmapMessage {
            anchor_stamp_us: submap.anchor_stamp_us,
            t_world_submap: submap.t_world_submap(),
            lidar: submap.lidar_points_in_world(),
            loam: submap.loam.transform(&submap.t_world_submap()),
            keypoints: submap.keypoints_in_world(),
            word_ids: submap.keypoints.iter().map(|kp| kp.word_id).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn global_map() -> GlobalMap {
        GlobalMap::new(GlobalMapSection::default()).unwrap()
    }

    fn pose_at(x: f64) -> Pose3D {
        Pose3D::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    #[test]
    fn first_measurement_creates_submap_with_prior() {
        let mut map = global_map();
        let tx = map.add_measurement(&[], None, None, Pose3D::identity(), 0);
        assert_eq!(map.submaps().len(), 1);
        assert_eq!(tx.constraints().len(), 1);
        assert_eq!(tx.constraints()[0].source, FIRST_SUBMAP_SOURCE);
    }

    #[test]
    fn straight_trajectory_slices_into_submaps() {
        let mut map = global_map();
        // 50 m at 1 m spacing with submap_size = 10.
        for k in 0..50u64 {
            map.add_measurement(&[], None, None, pose_at(k as f64), k * 1_000_000);
        }
        assert_eq!(map.submaps().len(), 5);
        for (i, submap) in map.submaps().iter().enumerate() {
            assert_relative_eq!(
                submap.t_world_submap_initial().translation.x,
                i as f64 * 10.0,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn assignment_prefers_previous_submap() {
        let mut map = global_map();
        for k in 0..=12u64 {
            map.add_measurement(&[], None, None, pose_at(k as f64), k * 1_000_000);
        }
        assert_eq!(map.submaps().len(), 2);

        // Within range of both anchors (0 and 10): previous wins.
        assert_eq!(map.get_submap_id(&pose_at(9.5)), Some(0));
        // Only within the current anchor.
        assert_eq!(map.get_submap_id(&pose_at(12.0)), Some(1));
        // Outside both.
        assert_eq!(map.get_submap_id(&pose_at(25.0)), None);
    }

    #[test]
    fn anchor_transactions_chain_submaps() {
        let mut map = global_map();
        for k in 0..=10u64 {
            let tx = map.add_measurement(&[], None, None, pose_at(k as f64), k * 1_000_000);
            if k == 10 {
                // The second submap's anchor is tied to the first.
                assert!(tx
                    .constraints()
                    .iter()
                    .any(|c| c.source == LOCAL_MAPPER_SOURCE));
            }
        }
    }

    #[test]
    fn loop_closure_skips_adjacent_submaps() {
        let mut map = global_map();
        for k in 0..=20u64 {
            map.add_measurement(&[], None, None, pose_at(k as f64), k * 1_000_000);
        }
        // Two submaps: the only candidates are adjacent, so no loops.
        assert!(map.run_loop_closure(1).is_none());
        assert!(map.run_loop_closure(0).is_none());
    }

    #[test]
    fn measurements_land_in_assigned_submap() {
        let mut map = global_map();
        let cloud = PointCloud3D::from_points(vec![Vector3::new(1.0, 0.0, 0.0)]);
        map.add_measurement(&[], Some(&cloud), None, pose_at(0.0), 0);
        map.add_measurement(
            &[(7, Vector3::new(2.0, 1.0, 0.0), Some(42))],
            Some(&cloud),
            None,
            pose_at(1.0),
            1_000_000,
        );

        let submap = &map.submaps()[0];
        assert_eq!(submap.lidar_points.len(), 2);
        assert_eq!(submap.keypoints.len(), 1);
        assert_eq!(submap.keyframe_trajectory.len(), 2);
    }
}
