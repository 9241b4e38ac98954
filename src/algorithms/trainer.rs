//! Per-worker training loop: SYNC -> COLLECT -> ESTIMATE -> BACKWARD ->
//! PUBLISH, for both the reward-driven and the teacher-forced regime.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::ProgressBar;
use tch::nn;
use tracing::{info, warn};

use crate::algorithms::returns::ReturnEstimator;
use crate::algorithms::rollout::{EpisodeCursor, RolloutWorker};
use crate::algorithms::shared_store::SharedParameterStore;
use crate::config::{Configuration, FaultPolicy, TrainRegime};
use crate::data::{Datapoint, EpochScheduler};
use crate::env::session::{EnvironmentSession, SessionError};
use crate::error::TrainError;
use crate::models::model_base::{RecurrentContext, RecurrentPolicy};
use crate::models::nav_lstm::{NavLstm, NavLstmConfig};
use crate::telemetry::{LossWindow, TelemetrySink};

pub struct TrainingOrchestrator {
    worker_id: usize,
    regime: TrainRegime,
    store: Arc<SharedParameterStore>,
    local_vs: nn::VarStore,
    model: NavLstm,
    session: Box<dyn EnvironmentSession>,
    scheduler: EpochScheduler,
    tune: Vec<Datapoint>,
    rollout: RolloutWorker,
    estimator: ReturnEstimator,
    telemetry: Option<Box<dyn TelemetrySink>>,
    progress: Option<ProgressBar>,
    stop: Arc<AtomicBool>,
    policy_window: LossWindow,
    value_window: LossWindow,
    /// Episode carried over from the previous window, if it has not ended.
    pending: Option<EpisodeCursor>,
    checkpoint_dir: PathBuf,
    fault_policy: FaultPolicy,
    max_episode_len: i64,
    rl_entropy_coef: f64,
    imitation_entropy_coef: f64,
    updates: i64,
    updates_done: i64,
}

impl TrainingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        config: &Configuration,
        model_config: &NavLstmConfig,
        store: Arc<SharedParameterStore>,
        session: Box<dyn EnvironmentSession>,
        partition: Vec<Datapoint>,
        tune: Vec<Datapoint>,
        telemetry: Option<Box<dyn TelemetrySink>>,
        progress: Option<ProgressBar>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, TrainError> {
        let space = session.action_space();
        if space.n_actions != model_config.n_actions {
            return Err(TrainError::Config(format!(
                "model emits {} actions but the session exposes {}",
                model_config.n_actions, space.n_actions
            )));
        }
        if !space.contains(space.stop_action) {
            return Err(TrainError::Config(format!(
                "stop action {} outside action space",
                space.stop_action
            )));
        }
        if config.mode == TrainRegime::Imitation {
            if let Some(bad) = partition.iter().find(|d| d.demonstration.is_none()) {
                return Err(TrainError::Config(format!(
                    "imitation training needs a reference action sequence, datapoint {} has none",
                    bad.id
                )));
            }
        }

        let hp = &config.hyperparameters;
        let mut local_vs = nn::VarStore::new(store.device());
        let model = NavLstm::new(&local_vs.root(), model_config);
        // first SYNC happens here; the run loop syncs from the second window on
        store.snapshot(&mut local_vs)?;

        Ok(Self {
            worker_id,
            regime: config.mode,
            store,
            local_vs,
            model,
            session,
            scheduler: EpochScheduler::new(worker_id, partition)?,
            tune,
            rollout: RolloutWorker::new(hp.num_steps, hp.max_episode_length),
            estimator: ReturnEstimator::new(hp.gamma, hp.tau),
            telemetry,
            progress,
            stop,
            policy_window: LossWindow::new(hp.loss_window),
            value_window: LossWindow::new(hp.loss_window),
            pending: None,
            checkpoint_dir: PathBuf::from(&config.checkpoint.dir),
            fault_policy: config.on_session_fault,
            max_episode_len: hp.max_episode_length,
            rl_entropy_coef: hp.rl_entropy_coef,
            imitation_entropy_coef: hp.imitation_entropy_coef,
            updates: hp.updates,
            updates_done: 0,
        })
    }

    pub fn run(&mut self) -> Result<(), TrainError> {
        let mut first = true;
        while self.updates_done < self.updates {
            // the only clean cancellation point: nothing is half-published here
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if !first {
                self.store.snapshot(&mut self.local_vs)?;
            }
            first = false;

            let outcome = match self.regime {
                TrainRegime::Imitation => self.imitation_window(),
                _ => self.advantage_window(),
            };
            match outcome {
                Ok(()) => {
                    self.updates_done += 1;
                    if let Some(bar) = &self.progress {
                        bar.inc(1);
                    }
                }
                Err(TrainError::Session(fault)) => match self.fault_policy {
                    FaultPolicy::Skip => {
                        warn!(
                            worker = self.worker_id,
                            "session fault, skipping datapoint: {fault}"
                        );
                        self.pending = None;
                    }
                    FaultPolicy::Abort => return Err(TrainError::Session(fault)),
                },
                Err(other) => return Err(other),
            }
        }
        if let Some(bar) = &self.progress {
            bar.finish_and_clear();
        }
        Ok(())
    }

    /// Fetches the next task (running epoch-boundary work when the partition
    /// is exhausted), resets the session and zeroes the recurrent context.
    fn begin_episode(&mut self) -> Result<(EpisodeCursor, Datapoint), TrainError> {
        let task = match self.scheduler.get_next() {
            Some(task) => task,
            None => {
                let finished = self.scheduler.epoch();
                info!(worker = self.worker_id, epoch = finished, "end of epoch");
                self.save_checkpoint(finished)?;
                if !self.tune.is_empty() {
                    self.evaluate_tune()?;
                }
                self.scheduler.advance_epoch();
                self.scheduler
                    .get_next()
                    .expect("partition was validated non-empty")
            }
        };
        let (obs, instruction) = self.session.reset(&task)?;
        let cursor = EpisodeCursor {
            obs,
            instruction,
            ctx: RecurrentContext::zero(self.model.lstm_size(), self.model.device()),
            episode_len: 0,
        };
        Ok((cursor, task))
    }

    fn advantage_window(&mut self) -> Result<(), TrainError> {
        // COLLECT
        let cursor = match self.pending.take() {
            Some(cursor) => cursor,
            None => self.begin_episode()?.0,
        };
        let window = self
            .rollout
            .collect(&self.model, self.session.as_mut(), cursor)?;

        // bootstrap from the state after the last call, then prime the next
        // episode so its first observation is ready before the update
        let bootstrap = if window.ended_episode {
            0.
        } else {
            let carried = window.cursor.as_ref().unwrap();
            tch::no_grad(|| {
                let eval = self
                    .model
                    .evaluate(&carried.obs, &carried.instruction, &carried.ctx);
                f64::try_from(&eval.value.detach()).unwrap()
            })
        };
        self.pending = match window.cursor {
            Some(mut carried) => {
                carried.ctx = carried.ctx.detached();
                Some(carried)
            }
            None => Some(self.begin_episode()?.0),
        };

        // ESTIMATE
        let total_reward = window.segment.total_reward();
        let mean_entropy = window.segment.mean_entropy();
        let bandit = self.regime == TrainRegime::ContextualBandit;
        let (policy_loss, value_loss) =
            self.estimator
                .compute_loss(window.segment, bootstrap, self.rl_entropy_coef, bandit);

        let policy_scalar = f32::try_from(&policy_loss.detach()).unwrap();
        let value_scalar = f32::try_from(&value_loss.detach()).unwrap();
        if let Some(sink) = self.telemetry.as_mut() {
            sink.scalar("TotalReward", total_reward as f64);
            sink.scalar("MeanEntropy", mean_entropy);
            sink.scalar("PolicyLoss", policy_scalar as f64);
        }

        // BACKWARD against the local copy only
        self.zero_local_grads();
        let loss = &policy_loss + &value_loss * 0.5;
        loss.backward();
        self.track_losses(policy_scalar, Some(value_scalar));

        // PUBLISH
        self.store.publish_gradients(&self.local_vs);
        self.store.step();
        Ok(())
    }

    fn imitation_window(&mut self) -> Result<(), TrainError> {
        let (cursor, task) = self.begin_episode()?;
        let demonstration = task
            .demonstration
            .as_ref()
            .expect("validated at construction");
        let actions = teacher_forced_actions(
            demonstration,
            self.max_episode_len,
            self.session.action_space().stop_action,
        );

        let segment =
            self.rollout
                .replay(&self.model, self.session.as_mut(), cursor, &actions)?;

        let total_reward = segment.total_reward();
        let mean_entropy = segment.mean_entropy();
        let policy_loss = self
            .estimator
            .imitation_loss(segment, self.imitation_entropy_coef);
        let policy_scalar = f32::try_from(&policy_loss.detach()).unwrap();
        if let Some(sink) = self.telemetry.as_mut() {
            sink.scalar("TotalReward", total_reward as f64);
            sink.scalar("MeanEntropy", mean_entropy);
            sink.scalar("PolicyLoss", policy_scalar as f64);
        }

        // no value function in this regime
        self.zero_local_grads();
        policy_loss.backward();
        self.track_losses(policy_scalar, None);

        self.store.publish_gradients(&self.local_vs);
        self.store.step();
        self.pending = None;
        Ok(())
    }

    fn zero_local_grads(&mut self) {
        for (_, mut var) in self.local_vs.variables() {
            var.zero_grad();
        }
    }

    fn track_losses(&mut self, policy: f32, value: Option<f32>) {
        let policy_avg = self.policy_window.push(policy);
        let value_avg = value.and_then(|v| self.value_window.push(v));
        if let Some(avg) = policy_avg {
            info!(
                worker = self.worker_id,
                iters = self.policy_window.flushes,
                avg_policy_loss = avg,
                avg_value_loss = ?value_avg,
                "rolling losses"
            );
        }
    }

    fn save_checkpoint(&self, epoch: u64) -> Result<(), TrainError> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        let path = self
            .checkpoint_dir
            .join(format!("model_worker{}_epoch{}.ot", self.worker_id, epoch));
        info!(worker = self.worker_id, "saving model in {}", path.display());
        self.local_vs.save(&path)?;
        Ok(())
    }

    /// Deterministic pass over the held-out partition: argmax action
    /// selection, no exploration, no gradients.
    fn evaluate_tune(&mut self) -> Result<(), TrainError> {
        let mut total_reward = 0f32;
        let mut completed = 0usize;
        for task in &self.tune {
            match eval_episode(
                &self.model,
                self.session.as_mut(),
                task,
                self.max_episode_len,
            ) {
                Ok(reward) => {
                    total_reward += reward;
                    completed += 1;
                }
                Err(fault) => match self.fault_policy {
                    FaultPolicy::Skip => {
                        warn!(
                            worker = self.worker_id,
                            "session fault during evaluation, skipping: {fault}"
                        );
                    }
                    FaultPolicy::Abort => return Err(fault.into()),
                },
            }
        }
        info!(
            worker = self.worker_id,
            epoch = self.scheduler.epoch(),
            episodes = completed,
            mean_reward = total_reward / completed.max(1) as f32,
            "held-out evaluation"
        );
        Ok(())
    }

    pub fn epoch(&self) -> u64 {
        self.scheduler.epoch()
    }

    pub fn updates_done(&self) -> i64 {
        self.updates_done
    }
}

/// The replayed sequence: the demonstration capped at `max_episode_len - 1`
/// moves, with the stop action appended so the episode always ends explicitly.
fn teacher_forced_actions(demonstration: &[i64], max_episode_len: i64, stop_action: i64) -> Vec<i64> {
    let cap = (max_episode_len - 1).max(0) as usize;
    let mut actions: Vec<i64> = demonstration.iter().copied().take(cap).collect();
    actions.push(stop_action);
    actions
}

fn eval_episode(
    model: &dyn RecurrentPolicy,
    session: &mut dyn EnvironmentSession,
    task: &Datapoint,
    max_episode_len: i64,
) -> Result<f32, SessionError> {
    let (mut obs, instruction) = session.reset(task)?;
    let mut ctx = RecurrentContext::zero(model.lstm_size(), model.device());
    let mut episode_reward = 0f32;
    let mut steps = 0i64;
    loop {
        let action = tch::no_grad(|| {
            let eval = model.evaluate(&obs, &instruction, &ctx);
            let action = eval.logits.argmax(-1, false).int64_value(&[0]);
            ctx = eval.context;
            action
        });
        let feedback = session.step(action)?;
        steps += 1;
        episode_reward += feedback.reward;
        if feedback.done {
            break;
        }
        if steps >= max_episode_len {
            let halt = session.force_stop()?;
            episode_reward += halt.reward;
            break;
        }
        obs = feedback.obs;
    }
    Ok(episode_reward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_configuration;
    use crate::env::corridor::{self, CorridorSim};
    use crate::env::scripted::ScriptedSession;
    use crate::env::session::ActionSpace;
    use tch::Device;

    fn model_config() -> NavLstmConfig {
        NavLstmConfig {
            obs_dim: corridor::OBS_DIM,
            vocab_size: corridor::vocab_size(8),
            n_actions: 3,
            emb_dim: 8,
            lstm_size: 12,
            time_horizon: 10,
            time_emb_dim: 4,
        }
    }

    fn shared_store(config: &Configuration, model_config: &NavLstmConfig) -> Arc<SharedParameterStore> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = NavLstm::new(&vs.root(), model_config);
        Arc::new(SharedParameterStore::new(
            vs,
            config.hyperparameters.lr,
            config.hyperparameters.grad_clip,
            config.publish,
        ))
    }

    fn orchestrator(
        config: &Configuration,
        session: Box<dyn EnvironmentSession>,
        partition: Vec<Datapoint>,
        tune: Vec<Datapoint>,
    ) -> TrainingOrchestrator {
        let mc = model_config();
        let store = shared_store(config, &mc);
        TrainingOrchestrator::new(
            0,
            config,
            &mc,
            store,
            session,
            partition,
            tune,
            None,
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn test_advantage_training_runs_on_corridor() {
        let mut config = test_configuration();
        config.hyperparameters.updates = 6;
        let tasks = corridor::generate_tasks(4, 8, 21);
        let session = Box::new(CorridorSim::new(8, 0.01, 5));
        let mut orch = orchestrator(&config, session, tasks, Vec::new());
        orch.run().unwrap();
        assert_eq!(orch.updates_done(), 6);
        assert_eq!(orch.store.optimizer_steps(), 6);
    }

    #[test]
    fn test_imitation_replays_demo_plus_stop() {
        let mut config = test_configuration();
        config.mode = TrainRegime::Imitation;
        config.hyperparameters.updates = 1;
        config.hyperparameters.max_episode_length = 10;
        let demo = vec![1, 1, 1];
        let partition = vec![Datapoint {
            id: 0,
            instruction: vec![0, 1],
            scene: serde_json::json!({}),
            demonstration: Some(demo.clone()),
        }];
        let mut session = Box::new(ScriptedSession::new(ActionSpace {
            n_actions: 3,
            stop_action: 2,
        }));
        session.rewards = vec![0.5];
        let mut orch = orchestrator(&config, session, partition, Vec::new());
        orch.run().unwrap();
        // exactly L + 1 actions were replayed and no value loss was tracked
        assert_eq!(orch.value_window.mean(), None);
        assert_eq!(orch.updates_done(), 1);
    }

    #[test]
    fn test_teacher_forced_actions_cap_and_stop() {
        // short demonstration: all L moves plus the appended stop
        assert_eq!(teacher_forced_actions(&[1, 1, 0], 10, 2), vec![1, 1, 0, 2]);
        // long demonstration: capped at max_episode_len - 1 moves
        let actions = teacher_forced_actions(&[1; 20], 4, 2);
        assert_eq!(actions.len(), 4);
        assert_eq!(actions[..3], [1, 1, 1]);
        assert_eq!(*actions.last().unwrap(), 2);
    }

    #[test]
    fn test_imitation_without_demonstration_is_config_fault() {
        let mut config = test_configuration();
        config.mode = TrainRegime::Imitation;
        let partition = vec![Datapoint {
            id: 3,
            instruction: vec![0],
            scene: serde_json::json!({}),
            demonstration: None,
        }];
        let mc = model_config();
        let store = shared_store(&config, &mc);
        let session = Box::new(ScriptedSession::new(ActionSpace {
            n_actions: 3,
            stop_action: 2,
        }));
        let err = TrainingOrchestrator::new(
            0,
            &config,
            &mc,
            store,
            session,
            partition,
            Vec::new(),
            None,
            None,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(err, Err(TrainError::Config(_))));
    }

    #[test]
    fn test_epoch_rollover_writes_checkpoint() {
        let dir = std::env::temp_dir().join(format!("nav_a3c_ckpt_{}", std::process::id()));
        let mut config = test_configuration();
        config.checkpoint.dir = dir.to_string_lossy().into_owned();
        // one task and enough updates to exhaust the partition repeatedly
        config.hyperparameters.updates = 8;
        config.hyperparameters.num_steps = 4;
        let tasks = corridor::generate_tasks(1, 8, 33);
        let session = Box::new(CorridorSim::new(8, 0., 9));
        let mut orch = orchestrator(&config, session, tasks, Vec::new());
        orch.run().unwrap();
        assert!(orch.epoch() > 1, "partition of one must roll epochs");
        assert!(dir.join("model_worker0_epoch1.ot").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_session_fault_skip_policy_continues() {
        let mut config = test_configuration();
        config.on_session_fault = FaultPolicy::Skip;
        config.hyperparameters.updates = 3;
        let mut session = Box::new(ScriptedSession::new(ActionSpace {
            n_actions: 3,
            stop_action: 2,
        }));
        session.done_after = Some(2);
        session.fail_on_call = Some(3);
        let partition = corridor::generate_tasks(4, 8, 1);
        let mut orch = orchestrator(&config, session, partition, Vec::new());
        orch.run().unwrap();
        assert_eq!(orch.updates_done(), 3);
    }

    #[test]
    fn test_session_fault_abort_policy_terminates() {
        let mut config = test_configuration();
        config.on_session_fault = FaultPolicy::Abort;
        config.hyperparameters.updates = 5;
        let mut session = Box::new(ScriptedSession::new(ActionSpace {
            n_actions: 3,
            stop_action: 2,
        }));
        session.fail_on_call = Some(2);
        let partition = corridor::generate_tasks(4, 8, 1);
        let mut orch = orchestrator(&config, session, partition, Vec::new());
        assert!(matches!(orch.run(), Err(TrainError::Session(_))));
    }

    #[test]
    fn test_stop_flag_halts_at_sync() {
        let config = test_configuration();
        let tasks = corridor::generate_tasks(4, 8, 2);
        let session = Box::new(CorridorSim::new(8, 0., 5));
        let mc = model_config();
        let store = shared_store(&config, &mc);
        let stop = Arc::new(AtomicBool::new(true));
        let mut orch = TrainingOrchestrator::new(
            0,
            &config,
            &mc,
            store,
            session,
            tasks,
            Vec::new(),
            None,
            None,
            stop,
        )
        .unwrap();
        orch.run().unwrap();
        assert_eq!(orch.updates_done(), 0);
    }
}
