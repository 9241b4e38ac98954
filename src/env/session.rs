//! Session-level contract against the episodic simulator. The wire protocol,
//! image transport and reconnection logic live behind implementations of
//! `EnvironmentSession`; the trainer only sees reset/step/force_stop.

use thiserror::Error;

use crate::data::Datapoint;

/// Feature vector rendered by the simulator for the agent's current view.
#[derive(Debug, Clone)]
pub struct Observation {
    pub features: Vec<f32>,
}

/// Token ids of the natural-language instruction bound to the episode.
pub type Instruction = Vec<i64>;

/// Discrete action space with a distinguished stop action.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpace {
    pub n_actions: i64,
    pub stop_action: i64,
}

impl ActionSpace {
    pub fn contains(&self, action: i64) -> bool {
        (0..self.n_actions).contains(&action)
    }
}

/// One environment transition as reported by the simulator.
#[derive(Debug)]
pub struct Feedback {
    pub obs: Observation,
    pub reward: f32,
    pub done: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("simulator transport failure: {0}")]
    Transport(String),
    #[error("malformed feedback from simulator: {0}")]
    Malformed(String),
}

/// Per-worker handle to one remote episode at a time. Calls may block for a
/// network round trip; timeouts are the implementation's problem, the trainer
/// only distinguishes "episode ended" from "call failed".
pub trait EnvironmentSession {
    fn action_space(&self) -> ActionSpace;

    /// Binds the session to a task and starts a fresh episode.
    fn reset(&mut self, task: &Datapoint) -> Result<(Observation, Instruction), SessionError>;

    fn step(&mut self, action: i64) -> Result<Feedback, SessionError>;

    /// Issues the stop action on the agent's behalf; always terminal.
    fn force_stop(&mut self) -> Result<Feedback, SessionError>;
}
