//! Thin viewer: loads a trained checkpoint and lets the greedy policy play a
//! few headless episodes, reporting score, level and lives per episode.

use anyhow::{bail, Result};

use breakout_dqn::breakout::environment::{BreakoutEnvironment, PaddleAction};
use breakout_dqn::log::init_logging;
use breakout_dqn::ql::checkpoint::{CheckpointStore, Slot};
use breakout_dqn::ql::model::{argmax_first, MlpQNet, QFunction};

const EPISODES: usize = 10;
const STEP_CAP: usize = 10_000;

fn main() -> Result<()> {
    init_logging();

    let checkpoint_dir = std::env::args().nth(1).unwrap_or_else(|| "checkpoints".to_string());
    let store = CheckpointStore::new(&checkpoint_dir)?;

    // prefer the best net over the most recent one
    let (weights, state) = match store.load(Slot::Best)? {
        Some(checkpoint) => checkpoint,
        None => match store.load(Slot::Latest)? {
            Some(checkpoint) => checkpoint,
            None => bail!("no checkpoint found under '{}' - run training first", checkpoint_dir),
        },
    };
    log::info!(
        "loaded checkpoint from episode {} ({} steps trained)",
        state.episode,
        state.total_steps
    );

    let mut net = MlpQNet::new(0.001);
    net.set_weights(weights)?;

    let mut environment = BreakoutEnvironment::new();
    for episode in 1..=EPISODES {
        let mut obs = environment.reset();
        environment.launch();

        let mut reward_sum = 0.0;
        let mut steps = 0;
        for _ in 0..STEP_CAP {
            let action = PaddleAction::try_from_numeric(argmax_first(net.predict(&obs)) as u8)?;
            let step = environment.step(action);
            obs = step.obs;
            reward_sum += step.reward;
            steps += 1;
            if step.done {
                break;
            }
        }
        log::info!(
            "episode {}: score {}, level {}, reward {:.1}, {} steps",
            episode,
            environment.score(),
            environment.level(),
            reward_sum,
            steps
        );
    }
    Ok(())
}
