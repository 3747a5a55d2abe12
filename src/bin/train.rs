use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use breakout_dqn::breakout::environment::BreakoutEnvironment;
use breakout_dqn::log::init_logging;
use breakout_dqn::ql::checkpoint::CheckpointStore;
use breakout_dqn::ql::learner::{DqnLearner, Parameter};
use breakout_dqn::ql::model::MlpQNet;

fn main() -> Result<()> {
    init_logging();

    let checkpoint_dir = std::env::args().nth(1).unwrap_or_else(|| "checkpoints".to_string());
    let store = CheckpointStore::new(&checkpoint_dir)?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || {
        log::info!("interrupt received - finishing the current update before shutdown");
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("cannot install the interrupt handler")?;

    let mut learner = DqnLearner::new(
        BreakoutEnvironment::new(),
        Parameter::default(),
        MlpQNet::new,
        store,
        PathBuf::from("train-log.csv"),
        stop_flag,
    )?;

    log::info!("training starts - checkpoints under '{}', stop with Ctrl-C", checkpoint_dir);
    learner.run()?;
    log::info!(
        "training stopped after {} episodes / {} steps",
        learner.episode_count(),
        learner.step_count()
    );
    Ok(())
}
