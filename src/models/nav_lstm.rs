use tch::nn::RNN;
use tch::{nn, Device, Kind, Tensor};

use crate::env::session::{Instruction, Observation};
use crate::models::model_base::{PolicyEval, RecurrentContext, RecurrentPolicy};

#[derive(Debug, Clone)]
pub struct NavLstmConfig {
    pub obs_dim: i64,
    pub vocab_size: i64,
    pub n_actions: i64,
    pub emb_dim: i64,
    pub lstm_size: i64,
    /// Largest episode step fed to the time embedding; longer episodes clamp.
    pub time_horizon: i64,
    pub time_emb_dim: i64,
}

/// Multimodal recurrent policy: observation features and the mean-pooled
/// instruction embedding are fused with an episode-step embedding, pushed
/// through one LSTM step, then read out by actor and critic heads. Parameters
/// live on the caller's `VarStore` path.
pub struct NavLstm {
    obs_encoder: nn::Linear,
    instr_embedding: nn::Embedding,
    time_embedding: nn::Embedding,
    fusion: nn::Linear,
    lstm: nn::LSTM,
    actor: nn::Linear,
    critic: nn::Linear,
    device: Device,
    lstm_size: i64,
    time_horizon: i64,
}

impl NavLstm {
    pub fn new(p: &nn::Path, config: &NavLstmConfig) -> Self {
        let obs_encoder = nn::linear(p / "obs_enc", config.obs_dim, config.emb_dim, Default::default());
        let instr_embedding = nn::embedding(p / "instr_emb", config.vocab_size, config.emb_dim, Default::default());
        let time_embedding = nn::embedding(p / "time_emb", config.time_horizon + 1, config.time_emb_dim, Default::default());
        let fused_dim = 2 * config.emb_dim + config.time_emb_dim;
        let fusion = nn::linear(p / "fusion", fused_dim, config.lstm_size, Default::default());
        let lstm = nn::lstm(p / "lstm", config.lstm_size, config.lstm_size, Default::default());
        let actor = nn::linear(p / "actor", config.lstm_size, config.n_actions, Default::default());
        let critic = nn::linear(p / "critic", config.lstm_size, 1, Default::default());
        let device = p.device();

        Self {
            obs_encoder,
            instr_embedding,
            time_embedding,
            fusion,
            lstm,
            actor,
            critic,
            device,
            lstm_size: config.lstm_size,
            time_horizon: config.time_horizon,
        }
    }
}

impl RecurrentPolicy for NavLstm {
    fn evaluate(
        &self,
        obs: &Observation,
        instruction: &Instruction,
        ctx: &RecurrentContext,
    ) -> PolicyEval {
        let obs_t = Tensor::from_slice(&obs.features)
            .view([1, -1])
            .to_device(self.device);
        let obs_emb = obs_t.apply(&self.obs_encoder).relu();

        let instr_t = Tensor::from_slice(instruction)
            .view([1, -1])
            .to_device(self.device);
        let instr_emb = instr_t
            .apply(&self.instr_embedding)
            .mean_dim(1, false, Kind::Float);

        let tx = Tensor::from_slice(&[ctx.steps.min(self.time_horizon)]).to_device(self.device);
        let time_emb = tx.apply(&self.time_embedding);

        let fused = Tensor::cat(&[obs_emb, instr_emb, time_emb], 1)
            .apply(&self.fusion)
            .relu();

        let state = nn::LSTMState((ctx.hidden.shallow_clone(), ctx.cell.shallow_clone()));
        let state = self.lstm.step(&fused, &state);
        let features = state.h().squeeze_dim(0);

        let logits = features.apply(&self.actor);
        let value = features.apply(&self.critic);

        PolicyEval {
            logits,
            value,
            context: RecurrentContext {
                hidden: state.h(),
                cell: state.c(),
                steps: ctx.steps + 1,
            },
        }
    }

    fn device(&self) -> Device {
        self.device
    }

    fn lstm_size(&self) -> i64 {
        self.lstm_size
    }
}
