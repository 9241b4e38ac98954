//! Local corridor simulator. Stands in for the remote episode server so the
//! trainer runs self-contained; the real simulator sits behind the same
//! `EnvironmentSession` trait.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::data::Datapoint;
use crate::env::session::{
    ActionSpace, EnvironmentSession, Feedback, Instruction, Observation, SessionError,
};

pub const LEFT: i64 = 0;
pub const RIGHT: i64 = 1;
pub const STOP: i64 = 2;

pub const ACTION_SPACE: ActionSpace = ActionSpace {
    n_actions: 3,
    stop_action: STOP,
};

/// Rendered observation size, see `CorridorSim::render`.
pub const OBS_DIM: i64 = 4;

const BASE_WORDS: [&str; 3] = ["walk", "to", "cell"];

fn base_vocab() -> FxHashMap<&'static str, i64> {
    BASE_WORDS
        .iter()
        .enumerate()
        .map(|(ix, word)| (*word, ix as i64))
        .collect()
}

/// Base words plus one token per cell index.
pub fn vocab_size(length: i64) -> i64 {
    BASE_WORDS.len() as i64 + length
}

/// "walk to cell <goal>" as token ids.
pub fn instruction_for(goal: i64) -> Instruction {
    let vocab = base_vocab();
    vec![
        vocab["walk"],
        vocab["to"],
        vocab["cell"],
        BASE_WORDS.len() as i64 + goal,
    ]
}

/// Procedural task generation: random start/goal pairs with the shortest
/// move sequence as the reference demonstration.
pub fn generate_tasks(count: usize, length: i64, seed: u64) -> Vec<Datapoint> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|id| {
            let start = rng.gen_range(0..length);
            let goal = rng.gen_range(0..length);
            let action = if goal >= start { RIGHT } else { LEFT };
            let demonstration = vec![action; (goal - start).unsigned_abs() as usize];
            Datapoint {
                id,
                instruction: instruction_for(goal),
                scene: serde_json::json!({ "start": start, "goal": goal }),
                demonstration: Some(demonstration),
            }
        })
        .collect()
}

pub struct CorridorSim {
    length: i64,
    noise: f32,
    rng: SmallRng,
    pos: i64,
    goal: i64,
    active: bool,
}

impl CorridorSim {
    pub fn new(length: i64, noise: f32, seed: u64) -> Self {
        Self {
            length,
            noise,
            rng: SmallRng::seed_from_u64(seed),
            pos: 0,
            goal: 0,
            active: false,
        }
    }

    fn render(&mut self) -> Observation {
        let span = (self.length - 1).max(1) as f32;
        let mut features = vec![
            self.pos as f32 / span,
            self.goal as f32 / span,
            (self.goal - self.pos) as f32 / span,
            1.0,
        ];
        if self.noise > 0. {
            for f in features.iter_mut().take(3) {
                *f += (self.rng.gen::<f32>() * 2. - 1.) * self.noise;
            }
        }
        Observation { features }
    }

    fn halt(&mut self) -> Feedback {
        self.active = false;
        let reward = if self.pos == self.goal {
            1.0
        } else {
            -((self.goal - self.pos).abs() as f32) / self.length as f32
        };
        Feedback {
            obs: self.render(),
            reward,
            done: true,
        }
    }
}

impl EnvironmentSession for CorridorSim {
    fn action_space(&self) -> ActionSpace {
        ACTION_SPACE
    }

    fn reset(&mut self, task: &Datapoint) -> Result<(Observation, Instruction), SessionError> {
        let goal = task
            .scene
            .get("goal")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| SessionError::Malformed(format!("task {} has no goal cell", task.id)))?;
        if !(0..self.length).contains(&goal) {
            return Err(SessionError::Malformed(format!(
                "goal cell {goal} outside corridor of length {}",
                self.length
            )));
        }
        self.pos = match task.scene.get("start").and_then(serde_json::Value::as_i64) {
            Some(start) => start.clamp(0, self.length - 1),
            None => self.rng.gen_range(0..self.length),
        };
        self.goal = goal;
        self.active = true;
        Ok((self.render(), task.instruction.clone()))
    }

    fn step(&mut self, action: i64) -> Result<Feedback, SessionError> {
        if !self.active {
            return Err(SessionError::Malformed("step before reset".to_owned()));
        }
        match action {
            LEFT => {
                self.pos = (self.pos - 1).max(0);
            }
            RIGHT => {
                self.pos = (self.pos + 1).min(self.length - 1);
            }
            STOP => return Ok(self.halt()),
            other => {
                return Err(SessionError::Malformed(format!(
                    "action {other} outside action space"
                )))
            }
        }
        Ok(Feedback {
            obs: self.render(),
            reward: -0.01,
            done: false,
        })
    }

    fn force_stop(&mut self) -> Result<Feedback, SessionError> {
        if !self.active {
            return Err(SessionError::Malformed("force_stop before reset".to_owned()));
        }
        Ok(self.halt())
    }
}
