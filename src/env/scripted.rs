//! Test-only session with a fixed reward script and call accounting.

use crate::data::Datapoint;
use crate::env::session::{
    ActionSpace, EnvironmentSession, Feedback, Instruction, Observation, SessionError,
};

pub struct ScriptedSession {
    space: ActionSpace,
    /// Reward issued per step call; reused cyclically once exhausted.
    pub rewards: Vec<f32>,
    /// Natural termination after this many step calls within an episode.
    pub done_after: Option<usize>,
    /// Step index (across the session lifetime) that raises a transport fault.
    pub fail_on_call: Option<usize>,
    steps_in_episode: usize,
    total_calls: usize,
    pub actions_seen: Vec<i64>,
    pub force_stops: usize,
    pub resets: usize,
}

impl ScriptedSession {
    pub fn new(space: ActionSpace) -> Self {
        Self {
            space,
            rewards: vec![0.],
            done_after: None,
            fail_on_call: None,
            steps_in_episode: 0,
            total_calls: 0,
            actions_seen: Vec::new(),
            force_stops: 0,
            resets: 0,
        }
    }

    fn obs(&self) -> Observation {
        Observation {
            features: vec![0.; 4],
        }
    }

    fn next_reward(&self) -> f32 {
        self.rewards[self.steps_in_episode % self.rewards.len()]
    }
}

impl EnvironmentSession for ScriptedSession {
    fn action_space(&self) -> ActionSpace {
        self.space
    }

    fn reset(&mut self, task: &Datapoint) -> Result<(Observation, Instruction), SessionError> {
        self.resets += 1;
        self.steps_in_episode = 0;
        Ok((self.obs(), task.instruction.clone()))
    }

    fn step(&mut self, action: i64) -> Result<Feedback, SessionError> {
        self.total_calls += 1;
        if self.fail_on_call == Some(self.total_calls) {
            return Err(SessionError::Transport("connection dropped".to_owned()));
        }
        self.actions_seen.push(action);
        let reward = self.next_reward();
        self.steps_in_episode += 1;
        let done = action == self.space.stop_action
            || self.done_after.is_some_and(|n| self.steps_in_episode >= n);
        Ok(Feedback {
            obs: self.obs(),
            reward,
            done,
        })
    }

    fn force_stop(&mut self) -> Result<Feedback, SessionError> {
        self.force_stops += 1;
        self.steps_in_episode += 1;
        Ok(Feedback {
            obs: self.obs(),
            reward: 0.,
            done: true,
        })
    }
}
