//! The estimator task.
//!
//! Single writer for the factor graph: front-ends post [`Transaction`]s
//! through a channel and read immutable [`FactorGraph`] snapshots after each
//! optimization. No graph state is ever shared mutably across front-ends.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;

use triveni_core::{FactorGraph, OptimizerConfig, Transaction};

use crate::error::{SlamError, WarnThrottle};

/// Handle held by front-ends: submit transactions, read snapshots.
#[derive(Clone)]
pub struct EstimatorHandle {
    sender: Sender<Transaction>,
    snapshot: Arc<RwLock<Arc<FactorGraph>>>,
}

impl EstimatorHandle {
    /// Enqueue a transaction. Empty transactions are dropped here.
    pub fn submit(&self, transaction: Transaction) {
        if transaction.is_empty() {
            return;
        }
        // The estimator outliving its handles is the normal shutdown order;
        // a closed channel just drops the transaction.
        let _ = self.sender.send(transaction);
    }

    /// The latest post-optimization snapshot.
    pub fn snapshot(&self) -> Arc<FactorGraph> {
        self.snapshot.read().clone()
    }
}

/// The estimator: owns the graph, applies transactions, optimizes,
/// publishes.
pub struct Estimator {
    graph: FactorGraph,
    receiver: Receiver<Transaction>,
    snapshot: Arc<RwLock<Arc<FactorGraph>>>,
    optimizer_config: OptimizerConfig,
    warn: WarnThrottle,
}

impl Estimator {
    /// Create an estimator and its front-end handle.
    pub fn new(optimizer_config: OptimizerConfig) -> (Self, EstimatorHandle) {
        let (sender, receiver) = unbounded();
        let snapshot = Arc::new(RwLock::new(Arc::new(FactorGraph::new())));
        let handle = EstimatorHandle {
            sender,
            snapshot: snapshot.clone(),
        };
        (
            Self {
                graph: FactorGraph::new(),
                receiver,
                snapshot,
                optimizer_config,
                warn: WarnThrottle::default(),
            },
            handle,
        )
    }

    /// Direct access to the graph (synchronous embeddings and tests).
    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    /// Apply one pending batch and optimize. Returns false when the channel
    /// is closed and drained.
    pub fn process_one(&mut self) -> bool {
        let first = match self.receiver.recv() {
            Ok(tx) => tx,
            Err(_) => return false,
        };
        self.apply(first);
        // Drain whatever arrived while waiting so one optimization covers
        // the batch.
        while let Ok(tx) = self.receiver.try_recv() {
            self.apply(tx);
        }

        let result = self.graph.optimize(&self.optimizer_config);
        log::debug!(
            "optimization: {:?} in {} iterations, error {:.3e} -> {:.3e}",
            result.termination_reason,
            result.iterations,
            result.initial_error,
            result.final_error
        );

        *self.snapshot.write() = Arc::new(self.graph.clone());
        true
    }

    /// Run until every handle is dropped.
    pub fn run(mut self) {
        while self.process_one() {}
    }

    /// Spawn the estimator loop on its own thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("triveni-estimator".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn estimator thread")
    }

    fn apply(&mut self, transaction: Transaction) {
        if let Err(err) = self.graph.apply(&transaction) {
            // A rejected transaction means a producer referenced state the
            // graph does not hold yet; the producer retries after the next
            // snapshot.
            self.warn.warn(&SlamError::NotReady {
                context: "transaction referenced variables missing from the graph",
            });
            log::debug!("transaction rejected: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use triveni_core::{Matrix6, Pose3D};

    #[test]
    fn transactions_flow_into_snapshots() {
        let (mut estimator, handle) = Estimator::new(OptimizerConfig::default());

        let mean = Pose3D::from_translation(Vector3::new(1.0, 2.0, 3.0));
        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, Pose3D::identity());
        tx.add_pose_prior(0, mean, Matrix6::identity() * 1e-4, "TEST");
        handle.submit(tx);

        assert!(estimator.process_one());

        let snapshot = handle.snapshot();
        let pose = snapshot.pose(0).unwrap();
        approx::assert_relative_eq!(pose.translation, mean.translation, epsilon = 1e-6);
    }

    #[test]
    fn empty_transactions_are_dropped_at_the_handle() {
        let (estimator, handle) = Estimator::new(OptimizerConfig::default());
        handle.submit(Transaction::new(0));
        assert!(estimator.receiver.is_empty());
    }

    #[test]
    fn threaded_estimator_shuts_down_with_handles() {
        let (estimator, handle) = Estimator::new(OptimizerConfig::default());
        let join = estimator.spawn();

        let mut tx = Transaction::new(0);
        tx.add_pose_variable(0, Pose3D::identity());
        tx.add_pose_prior(0, Pose3D::identity(), Matrix6::identity(), "TEST");
        handle.submit(tx);

        drop(handle);
        join.join().unwrap();
    }
}
