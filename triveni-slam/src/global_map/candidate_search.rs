//! Loop-closure candidate search capability.

use triveni_core::Pose3D;

use crate::config::{CandidateSearchType, GlobalMapSection};
use crate::error::SlamError;

use super::Submap;

/// Finds submaps likely to close a loop with the query.
///
/// Returns `(submap index, T_match_query estimate)` pairs ordered by
/// likelihood, the estimate derived from the current anchor poses.
pub trait CandidateSearcher: Send {
    fn find(&self, submaps: &[Submap], t_world_query: &Pose3D) -> Vec<(usize, Pose3D)>;
}

/// Candidate search by Euclidean distance between anchor positions.
pub struct EucDistCandidateSearch {
    distance_threshold_m: f64,
}

impl EucDistCandidateSearch {
    pub fn new(distance_threshold_m: f64) -> Self {
        Self {
            distance_threshold_m,
        }
    }
}

impl CandidateSearcher for EucDistCandidateSearch {
    fn find(&self, submaps: &[Submap], t_world_query: &Pose3D) -> Vec<(usize, Pose3D)> {
        let mut candidates: Vec<(usize, f64)> = submaps
            .iter()
            .enumerate()
            .filter_map(|(index, submap)| {
                let distance =
                    (submap.t_world_submap().translation - t_world_query.translation).norm();
                (distance < self.distance_threshold_m).then_some((index, distance))
            })
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        candidates
            .into_iter()
            .map(|(index, _)| {
                let estimate = submaps[index].t_world_submap().between(t_world_query);
                (index, estimate)
            })
            .collect()
    }
}

/// Instantiate the configured candidate search.
pub fn create_candidate_search(
    params: &GlobalMapSection,
) -> Result<Box<dyn CandidateSearcher>, SlamError> {
    match params.reloc_candidate_search_type {
        CandidateSearchType::EuclideanDistance => Ok(Box::new(EucDistCandidateSearch::new(
            params.candidate_search_distance_m,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn candidates_are_ordered_by_distance() {
        let submaps = vec![
            Submap::new(0, Pose3D::from_translation(Vector3::new(4.0, 0.0, 0.0))),
            Submap::new(1, Pose3D::from_translation(Vector3::new(1.0, 0.0, 0.0))),
            Submap::new(2, Pose3D::from_translation(Vector3::new(50.0, 0.0, 0.0))),
        ];
        let search = EucDistCandidateSearch::new(10.0);
        let found = search.find(&submaps, &Pose3D::identity());

        let indices: Vec<usize> = found.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![1, 0]);

        // Estimate maps the query into the match frame.
        let (_, estimate) = found[0];
        approx::assert_relative_eq!(
            estimate.translation,
            Vector3::new(-1.0, 0.0, 0.0),
            epsilon = 1e-12
        );
    }
}
