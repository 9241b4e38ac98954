use tch::{Device, Kind, Tensor};

use crate::env::session::{Instruction, Observation};

/// Recurrent state threaded through `evaluate` calls within one episode.
/// Always an explicit value, never stored inside the model, so one model can
/// serve any number of episodes. Zeroed at every episode start; `detached`
/// cuts the backprop graph at window boundaries.
pub struct RecurrentContext {
    pub hidden: Tensor,
    pub cell: Tensor,
    /// Episode-local step counter, feeds the model's time embedding.
    pub steps: i64,
}

impl RecurrentContext {
    pub fn zero(lstm_size: i64, device: Device) -> Self {
        Self {
            hidden: Tensor::zeros([1, 1, lstm_size], (Kind::Float, device)),
            cell: Tensor::zeros([1, 1, lstm_size], (Kind::Float, device)),
            steps: 0,
        }
    }

    pub fn detached(&self) -> Self {
        Self {
            hidden: self.hidden.detach(),
            cell: self.cell.detach(),
            steps: self.steps,
        }
    }

    pub fn shallow(&self) -> Self {
        Self {
            hidden: self.hidden.shallow_clone(),
            cell: self.cell.shallow_clone(),
            steps: self.steps,
        }
    }
}

pub struct PolicyEval {
    /// Unnormalized action preferences, shape `[1, n_actions]`.
    pub logits: Tensor,
    /// State-value estimate, shape `[1, 1]`.
    pub value: Tensor,
    pub context: RecurrentContext,
}

pub trait RecurrentPolicy {
    fn evaluate(
        &self,
        obs: &Observation,
        instruction: &Instruction,
        ctx: &RecurrentContext,
    ) -> PolicyEval;

    fn device(&self) -> Device;
    fn lstm_size(&self) -> i64;
}
