//! Bounded rollout collection against one environment session.

use tch::{Kind, Tensor};

use crate::env::session::{EnvironmentSession, Instruction, Observation, SessionError};
use crate::models::model_base::{RecurrentContext, RecurrentPolicy};

/// One recorded transition. `value` is absent in teacher-forced replay where
/// no value function is trained.
pub struct TransitionRecord {
    pub value: Option<Tensor>,
    pub log_prob: Tensor,
    pub entropy: Tensor,
    pub reward: f32,
}

/// Append-only during collection, consumed exactly once by the return
/// estimator, then dropped.
#[derive(Default)]
pub struct TrajectorySegment {
    pub steps: Vec<TransitionRecord>,
}

impl TrajectorySegment {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_reward(&self) -> f32 {
        self.steps.iter().map(|t| t.reward).sum()
    }

    pub fn mean_entropy(&self) -> f64 {
        let total: f64 = self
            .steps
            .iter()
            .map(|t| f64::try_from(&t.entropy.detach()).unwrap())
            .sum();
        total / self.len().max(1) as f64
    }
}

/// Live episode state carried between windows: current observation, the
/// episode's instruction, and the recurrent context.
pub struct EpisodeCursor {
    pub obs: Observation,
    pub instruction: Instruction,
    pub ctx: RecurrentContext,
    pub episode_len: i64,
}

pub struct WindowOutcome {
    pub segment: TrajectorySegment,
    /// State of the last environment call in the window.
    pub ended_episode: bool,
    pub forced_stop: bool,
    /// Carried episode state when the window ran out of budget mid-episode;
    /// the bootstrap value is evaluated from it.
    pub cursor: Option<EpisodeCursor>,
}

/// Log-probabilities and entropy of an action distribution.
pub fn policy_terms(logits: &Tensor) -> (Tensor, Tensor) {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    let probs = log_probs.exp();
    let entropy = -(&log_probs * &probs).sum_dim_intlist(1, false, Kind::Float);
    (log_probs, entropy)
}

pub struct RolloutWorker {
    step_budget: i64,
    max_episode_len: i64,
}

impl RolloutWorker {
    pub fn new(step_budget: i64, max_episode_len: i64) -> Self {
        Self {
            step_budget,
            max_episode_len,
        }
    }

    /// Runs up to `step_budget` sampled steps of the current episode. Actions
    /// are drawn from the categorical distribution, not argmax, to keep
    /// exploring. The window breaks on episode termination; if termination
    /// never happens by `max_episode_len` the stop action is issued for the
    /// agent exactly once and the episode counts as terminal.
    pub fn collect(
        &self,
        model: &dyn RecurrentPolicy,
        session: &mut dyn EnvironmentSession,
        mut cursor: EpisodeCursor,
    ) -> Result<WindowOutcome, SessionError> {
        let mut segment = TrajectorySegment::default();
        let mut ended_episode = false;
        let mut forced_stop = false;

        for _ in 0..self.step_budget {
            let eval = model.evaluate(&cursor.obs, &cursor.instruction, &cursor.ctx);
            cursor.ctx = eval.context;

            let (log_probs, entropy) = policy_terms(&eval.logits);
            let action_t = log_probs.exp().multinomial(1, true);
            let log_prob = log_probs.gather(1, &action_t.detach(), false);
            let action = action_t.int64_value(&[0, 0]);

            let feedback = session.step(action)?;
            cursor.episode_len += 1;
            let mut done = feedback.done;

            if !done && cursor.episode_len >= self.max_episode_len {
                // the simulator never sees a silently truncated episode; the
                // forced stop's feedback is discarded
                let _ = session.force_stop()?;
                done = true;
                forced_stop = true;
            }

            segment.steps.push(TransitionRecord {
                value: Some(eval.value),
                log_prob,
                entropy,
                reward: feedback.reward,
            });

            if done {
                ended_episode = true;
                break;
            }
            cursor.obs = feedback.obs;
        }

        let cursor = if ended_episode { None } else { Some(cursor) };
        Ok(WindowOutcome {
            segment,
            ended_episode,
            forced_stop,
            cursor,
        })
    }

    /// Teacher forcing: replays `actions` verbatim, recording the policy's
    /// log-probability and entropy for each. No value estimates are kept.
    pub fn replay(
        &self,
        model: &dyn RecurrentPolicy,
        session: &mut dyn EnvironmentSession,
        mut cursor: EpisodeCursor,
        actions: &[i64],
    ) -> Result<TrajectorySegment, SessionError> {
        let mut segment = TrajectorySegment::default();
        for &action in actions {
            let eval = model.evaluate(&cursor.obs, &cursor.instruction, &cursor.ctx);
            cursor.ctx = eval.context;

            let (log_probs, entropy) = policy_terms(&eval.logits);
            let index = Tensor::from_slice(&[action])
                .view([1, 1])
                .to_device(model.device());
            let log_prob = log_probs.gather(1, &index, false);

            let feedback = session.step(action)?;
            cursor.episode_len += 1;

            segment.steps.push(TransitionRecord {
                value: None,
                log_prob,
                entropy,
                reward: feedback.reward,
            });

            if feedback.done {
                break;
            }
            cursor.obs = feedback.obs;
        }
        Ok(segment)
    }
}
