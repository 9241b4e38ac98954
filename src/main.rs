use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use tch::{nn, Device};
use tracing::{error, info, warn};

use nav_a3c::algorithms::shared_store::SharedParameterStore;
use nav_a3c::algorithms::trainer::TrainingOrchestrator;
use nav_a3c::config::Configuration;
use nav_a3c::data::Datapoint;
use nav_a3c::env::corridor::{self, CorridorSim};
use nav_a3c::models::nav_lstm::{NavLstm, NavLstmConfig};
use nav_a3c::telemetry::{LogSink, TelemetrySink};

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Configuration::load_configuration(Path::new(&config_path))
        .with_context(|| format!("loading configuration from '{config_path}'"))?;
    config.validate()?;

    let device = if config.device.to_lowercase() == "cuda" {
        Device::cuda_if_available()
    } else {
        Device::Cpu
    };
    tch::manual_seed(config.env.seed as i64);

    let train = corridor::generate_tasks(
        config.env.train_tasks,
        config.env.corridor_length,
        config.env.seed,
    );
    let tune = corridor::generate_tasks(
        config.env.tune_tasks,
        config.env.corridor_length,
        config.env.seed + 1,
    );
    info!(
        train = train.len(),
        tune = tune.len(),
        "generated corridor tasks"
    );

    let model_config = NavLstmConfig {
        obs_dim: corridor::OBS_DIM,
        vocab_size: corridor::vocab_size(config.env.corridor_length),
        n_actions: corridor::ACTION_SPACE.n_actions,
        emb_dim: config.model.emb_dim,
        lstm_size: config.model.lstm_size,
        time_horizon: config.hyperparameters.max_episode_length,
        time_emb_dim: config.model.time_emb_dim,
    };

    // shared parameters, optionally restored from a checkpoint
    let mut shared_vs = nn::VarStore::new(device);
    let _ = NavLstm::new(&shared_vs.root(), &model_config);
    if let Some(load) = &config.checkpoint.load {
        if Path::new(load).exists() {
            shared_vs
                .load(load)
                .with_context(|| format!("loading checkpoint '{load}'"))?;
            info!("restored parameters from {load}");
        } else {
            warn!("checkpoint {load} not found, starting from fresh parameters");
        }
    }
    let store = Arc::new(SharedParameterStore::new(
        shared_vs,
        config.hyperparameters.lr,
        config.hyperparameters.grad_clip,
        config.publish,
    ));

    // worker-exclusive partitions, round robin
    let mut partitions: Vec<Vec<Datapoint>> = vec![Vec::new(); config.n_workers];
    for (ix, task) in train.into_iter().enumerate() {
        partitions[ix % config.n_workers].push(task);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
    let mut handles = Vec::new();
    for (worker_id, partition) in partitions.into_iter().enumerate() {
        let config = config.clone();
        let model_config = model_config.clone();
        let store = store.clone();
        let tune = tune.clone();
        let stop = stop.clone();
        let exit_tx = exit_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let session = Box::new(CorridorSim::new(
                    config.env.corridor_length,
                    config.env.obs_noise,
                    config.env.seed + 1000 + worker_id as u64,
                ));
                // the first worker owns telemetry and the progress bar so
                // metrics are not emitted once per worker
                let telemetry: Option<Box<dyn TelemetrySink>> = if worker_id == 0 {
                    Some(Box::new(LogSink::new(worker_id)))
                } else {
                    None
                };
                let progress = if worker_id == 0 {
                    let bar = ProgressBar::new(config.hyperparameters.updates as u64);
                    bar.set_style(ProgressStyle::with_template("[{pos}/{len} {per_sec}]").unwrap());
                    Some(bar)
                } else {
                    None
                };
                let result = TrainingOrchestrator::new(
                    worker_id,
                    &config,
                    &model_config,
                    store,
                    session,
                    partition,
                    tune,
                    telemetry,
                    progress,
                    stop,
                )
                .and_then(|mut orchestrator| orchestrator.run());
                let _ = exit_tx.send((worker_id, result));
            })?;
        handles.push(handle);
    }
    drop(exit_tx);

    for (worker_id, result) in exit_rx.iter() {
        match result {
            Ok(()) => info!("worker {worker_id} finished"),
            // other workers keep running; they share nothing but the store
            Err(fault) => error!("worker {worker_id} terminated: {fault}"),
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}
