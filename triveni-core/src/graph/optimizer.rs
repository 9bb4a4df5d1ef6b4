//! Levenberg-Marquardt optimization over the factor graph.
//!
//! Minimizes the sum of whitened squared residuals
//!
//! ```text
//! F(x) = Σ e_k(x)ᵀ Σ_k⁻¹ e_k(x)
//! ```
//!
//! by iteratively solving the damped normal equations `(H + λD) Δx = -b`
//! with `H = JᵀJ` and `b = Jᵀe`. The system is dense; sliding-window graphs
//! stay small enough that sparsity bookkeeping would not pay for itself.

use std::collections::HashMap;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};

use super::{FactorGraph, VariableKey};

/// Configuration for graph optimization.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of iterations.
    pub max_iterations: u32,
    /// Convergence threshold for relative error change.
    pub convergence_threshold: f64,
    /// Initial Levenberg-Marquardt damping factor.
    pub damping_factor: f64,
    /// Minimum error improvement to continue.
    pub min_improvement: f64,
    /// Wall-clock budget in seconds; `None` means unbounded.
    pub max_time_s: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-6,
            damping_factor: 1e-3,
            min_improvement: 1e-9,
            max_time_s: None,
        }
    }
}

/// Result of graph optimization.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Number of iterations performed.
    pub iterations: u32,
    /// Initial chi-squared error.
    pub initial_error: f64,
    /// Final chi-squared error.
    pub final_error: f64,
    /// Whether the optimization converged.
    pub converged: bool,
    /// Reason for termination.
    pub termination_reason: TerminationReason,
}

/// Reason for optimization termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Converged (error change below threshold).
    Converged,
    /// Maximum iterations reached.
    MaxIterations,
    /// Error kept increasing at maximum damping.
    Diverged,
    /// Linear system solve failed.
    SolveFailed,
    /// Nothing to optimize.
    NoConstraints,
    /// Wall-clock budget exhausted; best state so far is kept.
    TimedOut,
}

/// Run Levenberg-Marquardt on the graph in place.
pub(super) fn optimize(graph: &mut FactorGraph, config: &OptimizerConfig) -> OptimizationResult {
    let started = Instant::now();

    if graph.num_constraints() == 0 || graph.num_variables() == 0 {
        return OptimizationResult {
            iterations: 0,
            initial_error: 0.0,
            final_error: 0.0,
            converged: true,
            termination_reason: TerminationReason::NoConstraints,
        };
    }

    // Stable variable ordering: key order of the underlying map.
    let mut offsets: HashMap<VariableKey, usize> = HashMap::new();
    let mut dim = 0usize;
    for (key, value) in graph.variables() {
        offsets.insert(*key, dim);
        dim += value.local_dim();
    }

    let initial_error = total_chi2(graph);
    let mut current_error = initial_error;
    let mut lambda = config.damping_factor;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        if let Some(budget) = config.max_time_s {
            if started.elapsed().as_secs_f64() > budget {
                return result(
                    iterations,
                    initial_error,
                    current_error,
                    false,
                    TerminationReason::TimedOut,
                );
            }
        }

        let (h, b) = build_normal_equations(graph, &offsets, dim);

        // Marquardt damping on the diagonal.
        let mut h_damped = h.clone();
        for i in 0..dim {
            let d = h[(i, i)];
            h_damped[(i, i)] = d + lambda * d.max(1e-12);
        }

        let dx = match solve(&h_damped, &b) {
            Some(dx) => dx,
            None => {
                return result(
                    iterations,
                    initial_error,
                    current_error,
                    false,
                    TerminationReason::SolveFailed,
                );
            }
        };

        let snapshot = graph.values_snapshot();
        apply_update(graph, &offsets, &dx);
        let new_error = total_chi2(graph);

        if new_error > current_error {
            // Step made things worse: revert and raise damping.
            graph.restore_values(snapshot);
            lambda *= 10.0;
            if lambda > 1e10 {
                return result(
                    iterations,
                    initial_error,
                    current_error,
                    false,
                    TerminationReason::Diverged,
                );
            }
            continue;
        }

        lambda = (lambda * 0.1).max(1e-10);

        let relative_change = (current_error - new_error).abs() / current_error.max(1e-10);
        current_error = new_error;

        if relative_change < config.convergence_threshold
            || relative_change < config.min_improvement
        {
            return result(
                iterations,
                initial_error,
                current_error,
                true,
                TerminationReason::Converged,
            );
        }
    }

    result(
        iterations,
        initial_error,
        current_error,
        false,
        TerminationReason::MaxIterations,
    )
}

fn result(
    iterations: u32,
    initial_error: f64,
    final_error: f64,
    converged: bool,
    termination_reason: TerminationReason,
) -> OptimizationResult {
    OptimizationResult {
        iterations,
        initial_error,
        final_error,
        converged,
        termination_reason,
    }
}

/// Sum of whitened squared residuals over all constraints.
fn total_chi2(graph: &FactorGraph) -> f64 {
    graph.constraints().map(|c| c.chi2(graph)).sum()
}

fn build_normal_equations(
    graph: &FactorGraph,
    offsets: &HashMap<VariableKey, usize>,
    dim: usize,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut h = DMatrix::zeros(dim, dim);
    let mut b = DVector::zeros(dim);

    for constraint in graph.constraints() {
        let block = match constraint.linearize(graph) {
            Some(block) => block,
            None => continue,
        };

        for (key_a, jac_a) in &block.jacobians {
            let offset_a = offsets[key_a];
            let cols_a = jac_a.ncols();

            let jt_r = jac_a.transpose() * &block.residual;
            for r in 0..cols_a {
                b[offset_a + r] += jt_r[r];
            }

            for (key_b, jac_b) in &block.jacobians {
                let offset_b = offsets[key_b];
                let cols_b = jac_b.ncols();
                let jt_j = jac_a.transpose() * jac_b;
                for r in 0..cols_a {
                    for c in 0..cols_b {
                        h[(offset_a + r, offset_b + c)] += jt_j[(r, c)];
                    }
                }
            }
        }
    }

    (h, b)
}

fn solve(h: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let rhs = -b;
    match h.clone().cholesky() {
        Some(chol) => Some(chol.solve(&rhs)),
        None => h.clone().lu().solve(&rhs),
    }
}

fn apply_update(graph: &mut FactorGraph, offsets: &HashMap<VariableKey, usize>, dx: &DVector<f64>) {
    let keys: Vec<VariableKey> = graph.variables().map(|(k, _)| *k).collect();
    for key in keys {
        let offset = offsets[&key];
        let mut value = *graph.get(&key).expect("variable vanished mid-update");
        let dim = value.local_dim();
        value.retract(&dx.as_slice()[offset..offset + dim]);
        graph.set_value(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Matrix6, Transaction};
    use crate::types::Pose3D;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn empty_graph_is_trivially_converged() {
        let mut graph = FactorGraph::new();
        let result = graph.optimize(&OptimizerConfig::default());
        assert!(result.converged);
        assert_eq!(result.termination_reason, TerminationReason::NoConstraints);
    }

    #[test]
    fn prior_pulls_pose_to_mean() {
        let mean = Pose3D::from_parts(Vector3::new(0.1, -0.2, 0.3), Vector3::new(1.0, 2.0, 3.0));

        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, Pose3D::identity());
        tx.add_pose_prior(0, mean, Matrix6::identity() * 1e-4, "TEST_PRIOR");

        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();

        let result = graph.optimize(&OptimizerConfig::default());
        assert!(result.converged);

        let pose = graph.pose(0).unwrap();
        assert_relative_eq!(pose.translation, mean.translation, epsilon = 1e-6);
        assert_relative_eq!(pose.rotation.angle_to(&mean.rotation), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn chain_of_relative_constraints_recovers_perturbed_pose() {
        let truth_1 = Pose3D::identity();
        let truth_2 = Pose3D::from_parts(Vector3::new(0.0, 0.0, 0.1), Vector3::new(1.0, 0.0, 0.0));
        let delta = truth_1.between(&truth_2);

        let perturbed_2 = Pose3D::from_parts(
            Vector3::new(0.0, 0.0, 0.1 + 0.05),
            Vector3::new(1.03, -0.04, 0.02),
        );

        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, truth_1);
        tx.add_pose_variable(1, perturbed_2);
        tx.add_pose_prior(0, truth_1, Matrix6::identity() * 1e-6, "PRIOR");
        tx.add_relative_pose_constraint(0, 1, delta, Matrix6::identity() * 1e-4, "REL");

        let mut graph = FactorGraph::new();
        graph.apply(&tx).unwrap();
        let result = graph.optimize(&OptimizerConfig::default());
        assert!(result.converged);

        let recovered = graph.pose(1).unwrap();
        assert_relative_eq!(recovered.translation, truth_2.translation, epsilon = 1e-5);
        assert_relative_eq!(
            recovered.rotation.angle_to(&truth_2.rotation),
            0.0,
            epsilon = 1e-5
        );
    }
}
