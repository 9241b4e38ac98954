use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::algorithms::shared_store::PublishPolicy;
use crate::error::TrainError;

/// Advantage source for the run, picked once per training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainRegime {
    /// Sampled rollouts with generalized advantage estimation.
    Advantage,
    /// Sampled rollouts where only the immediate reward carries signal.
    ContextualBandit,
    /// Teacher forcing over reference action sequences.
    Imitation,
}

/// What a worker does with a session fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    Skip,
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    pub mode: TrainRegime,
    #[serde(default = "default_device")]
    pub device: String,
    pub n_workers: usize,
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub model: ModelSettings,
    pub env: EnvSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default = "default_fault_policy")]
    pub on_session_fault: FaultPolicy,
    #[serde(default = "default_publish_policy")]
    pub publish: PublishPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hyperparameters {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_tau")]
    pub tau: f64,
    #[serde(default = "default_num_steps")]
    pub num_steps: i64,
    #[serde(default = "default_max_episode_length")]
    pub max_episode_length: i64,
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,
    #[serde(default = "default_rl_entropy_coef")]
    pub rl_entropy_coef: f64,
    #[serde(default = "default_imitation_entropy_coef")]
    pub imitation_entropy_coef: f64,
    pub updates: i64,
    #[serde(default = "default_loss_window")]
    pub loss_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_emb_dim")]
    pub emb_dim: i64,
    #[serde(default = "default_lstm_size")]
    pub lstm_size: i64,
    #[serde(default = "default_time_emb_dim")]
    pub time_emb_dim: i64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            emb_dim: default_emb_dim(),
            lstm_size: default_lstm_size(),
            time_emb_dim: default_time_emb_dim(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvSettings {
    #[serde(default = "default_corridor_length")]
    pub corridor_length: i64,
    pub train_tasks: usize,
    #[serde(default)]
    pub tune_tasks: usize,
    #[serde(default = "default_obs_noise")]
    pub obs_noise: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,
    /// Parameter blob to restore at startup; a missing file falls back to
    /// fresh initialization.
    #[serde(default)]
    pub load: Option<String>,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            load: None,
        }
    }
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}

fn default_fault_policy() -> FaultPolicy {
    FaultPolicy::Abort
}

fn default_publish_policy() -> PublishPolicy {
    PublishPolicy::WholeCallSkip
}

fn default_lr() -> f64 {
    0.00025
}

fn default_gamma() -> f64 {
    0.99
}

fn default_tau() -> f64 {
    1.0
}

fn default_num_steps() -> i64 {
    20
}

fn default_max_episode_length() -> i64 {
    40
}

fn default_grad_clip() -> f64 {
    40.0
}

fn default_rl_entropy_coef() -> f64 {
    0.02
}

fn default_imitation_entropy_coef() -> f64 {
    0.01
}

fn default_loss_window() -> usize {
    1000
}

fn default_emb_dim() -> i64 {
    32
}

fn default_lstm_size() -> i64 {
    256
}

fn default_time_emb_dim() -> i64 {
    8
}

fn default_corridor_length() -> i64 {
    16
}

fn default_obs_noise() -> f32 {
    0.05
}

fn default_seed() -> u64 {
    7
}

impl Configuration {
    pub fn load_configuration(config_file: &Path) -> Result<Configuration, serde_json::Error> {
        let mut file = match File::open(config_file) {
            Ok(file) => file,
            Err(error) => {
                panic!("Error opening file {}: {}", config_file.display(), error);
            }
        };
        let mut contents = String::new();
        match file.read_to_string(&mut contents) {
            Ok(_) => (), // Reading was successful
            Err(error) => {
                panic!("Error reading contents of {}: {}", config_file.display(), error);
            }
        };
        serde_json::from_str(&contents)
    }

    /// Startup validation; any failure here is fatal before training begins.
    pub fn validate(&self) -> Result<(), TrainError> {
        let hp = &self.hyperparameters;
        if self.n_workers == 0 {
            return Err(TrainError::Config("n_workers must be at least 1".into()));
        }
        if hp.updates < 1 {
            return Err(TrainError::Config("updates must be at least 1".into()));
        }
        if hp.num_steps < 1 {
            return Err(TrainError::Config("num_steps must be at least 1".into()));
        }
        if hp.max_episode_length < 2 {
            return Err(TrainError::Config(
                "max_episode_length must be at least 2".into(),
            ));
        }
        if !(0. ..=1.).contains(&hp.gamma) || !(0. ..=1.).contains(&hp.tau) {
            return Err(TrainError::Config(
                "gamma and tau must lie in [0, 1]".into(),
            ));
        }
        if self.env.corridor_length < 2 {
            return Err(TrainError::Config(
                "corridor_length must be at least 2".into(),
            ));
        }
        if self.env.train_tasks < self.n_workers {
            return Err(TrainError::Config(format!(
                "{} train tasks cannot cover {} workers",
                self.env.train_tasks, self.n_workers
            )));
        }
        Ok(())
    }
}

/// Small, fast settings shared by the unit tests.
#[cfg(test)]
pub fn test_configuration() -> Configuration {
    let dir = std::env::temp_dir().join(format!("nav_a3c_test_{}", std::process::id()));
    serde_json::from_value(serde_json::json!({
        "mode": "advantage",
        "n_workers": 1,
        "hyperparameters": {
            "updates": 2,
            "num_steps": 8,
            "max_episode_length": 6,
            "loss_window": 16
        },
        "env": { "corridor_length": 8, "train_tasks": 4, "obs_noise": 0.0 },
        "checkpoint": { "dir": dir.to_string_lossy() }
    }))
    .unwrap()
}
