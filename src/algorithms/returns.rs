//! Credit assignment: bootstrapped returns, advantages, and loss assembly.

use tch::{Device, Kind, Tensor};

use crate::algorithms::rollout::TrajectorySegment;

/// Walks a trajectory segment in reverse and assembles the scalar losses.
/// Advantage selection is a run-level tag: full generalized advantage
/// estimation, or the contextual-bandit simplification where only the
/// immediate reward carries signal.
pub struct ReturnEstimator {
    gamma: f64,
    tau: f64,
}

impl ReturnEstimator {
    pub fn new(gamma: f64, tau: f64) -> Self {
        Self { gamma, tau }
    }

    fn zeros_on(segment: &TrajectorySegment) -> Tensor {
        let device = segment
            .steps
            .first()
            .map(|t| t.log_prob.device())
            .unwrap_or(Device::Cpu);
        Tensor::zeros([1, 1], (Kind::Float, device))
    }

    /// Reverse-pass return and advantage computation:
    /// `R_t = r_t + gamma * R_{t+1}` with `R_{T+1} = bootstrap`, value loss
    /// `0.5 * (R_t - V_t)^2`, and either GAE
    /// (`gae = gae * gamma * tau + (r_t + gamma * V_{t+1} - V_t)`) or the
    /// immediate reward as the policy advantage. Gradients flow through the
    /// recorded value and log-prob tensors only; the advantage itself is a
    /// constant to the policy term.
    pub fn compute_loss(
        &self,
        segment: TrajectorySegment,
        bootstrap: f64,
        entropy_coef: f64,
        contextual_bandit: bool,
    ) -> (Tensor, Tensor) {
        let mut policy_loss = Self::zeros_on(&segment);
        let mut value_loss = Self::zeros_on(&segment);

        let mut running_return = bootstrap;
        let mut next_value = bootstrap;
        let mut gae = 0f64;

        for t in segment.steps.iter().rev() {
            let reward = t.reward as f64;
            running_return = reward + self.gamma * running_return;

            let value = t
                .value
                .as_ref()
                .expect("advantage training records a value estimate per step");
            let residual = value - running_return;
            value_loss = value_loss + 0.5 * &residual * &residual;

            let value_scalar = f64::try_from(&value.detach()).unwrap();
            let advantage = if contextual_bandit {
                reward
            } else {
                let delta = reward + self.gamma * next_value - value_scalar;
                gae = gae * self.gamma * self.tau + delta;
                gae
            };

            policy_loss = policy_loss - &t.log_prob * advantage - &t.entropy * entropy_coef;
            next_value = value_scalar;
        }

        (policy_loss, value_loss)
    }

    /// Teacher-forced loss: cross-entropy on the replayed actions plus an
    /// entropy bonus. No value term exists in this regime.
    pub fn imitation_loss(&self, segment: TrajectorySegment, entropy_coef: f64) -> Tensor {
        let mut policy_loss = Self::zeros_on(&segment);
        for t in segment.steps.iter().rev() {
            policy_loss = policy_loss - &t.log_prob - &t.entropy * entropy_coef;
        }
        policy_loss
    }
}
