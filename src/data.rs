//! Task instances and the per-worker epoch scheduler.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TrainError;

/// One task instance issued by a dataset partition. Immutable once issued.
/// The scene payload is opaque to the trainer; the simulator interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datapoint {
    pub id: usize,
    pub instruction: Vec<i64>,
    pub scene: serde_json::Value,
    /// Reference action sequence for teacher forcing, without the stop action.
    pub demonstration: Option<Vec<i64>>,
}

/// Iterates a worker-exclusive slice of datapoints. `get_next` returns `None`
/// exactly once at exhaustion; the caller runs its epoch-boundary work
/// (checkpoint, held-out evaluation) and then calls `advance_epoch` to restart
/// the partition. The epoch counter is instance-local, never shared.
pub struct EpochScheduler {
    partition: Vec<Datapoint>,
    cursor: usize,
    epoch: u64,
    worker_id: usize,
    log_every: usize,
}

impl EpochScheduler {
    pub fn new(worker_id: usize, partition: Vec<Datapoint>) -> Result<Self, TrainError> {
        if partition.is_empty() {
            return Err(TrainError::Config(format!(
                "worker {worker_id} was assigned an empty dataset partition"
            )));
        }
        Ok(Self {
            partition,
            cursor: 0,
            epoch: 1,
            worker_id,
            log_every: 100,
        })
    }

    pub fn get_next(&mut self) -> Option<Datapoint> {
        if self.cursor == self.partition.len() {
            return None;
        }
        let datapoint = self.partition[self.cursor].clone();
        self.cursor += 1;
        if self.cursor % self.log_every == 0 {
            info!(
                worker = self.worker_id,
                "done {} out of {}",
                self.cursor,
                self.partition.len()
            );
        }
        Some(datapoint)
    }

    pub fn advance_epoch(&mut self) {
        self.cursor = 0;
        self.epoch += 1;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.partition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partition.is_empty()
    }
}
