use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use num_format::ToFormattedString;
use rand::prelude::ThreadRng;
use rand::Rng;

use crate::breakout::environment::{BreakoutEnvironment, Observation, PaddleAction, ACTION_SPACE};
use crate::ql::checkpoint::{CheckpointStore, Slot, TrainingState};
use crate::ql::model::{argmax_first, QFunction};
use crate::ql::replay_buffer::{ReplayBuffer, Transition};
use crate::util;

const RECENT_LOSS_WINDOW: usize = 100;

pub struct Parameter {
    /// base learning rate; decays on a coarse episode schedule
    pub learning_rate: f32,
    pub batch_size: usize,
    /// Discount factor (0 <= 𝛾 <= 1) for future rewards. The bigger, the more farsighted the agent becomes
    pub gamma: f32,
    pub replay_buffer_capacity: usize,
    /// Epsilon greedy start value
    pub epsilon_start: f32,
    /// multiplicative decay per completed episode
    pub epsilon_decay: f32,
    pub epsilon_min: f32,
    /// Attempt a training update every n environment steps
    pub update_after_steps: usize,
    /// Hard-copy online weights into the target net every n environment steps
    pub sync_target_after_steps: usize,
    pub checkpoint_after_steps: usize,
    /// Forced episode truncation, not environment-signaled
    pub max_steps_per_episode: usize,
    pub lr_decay: f32,
    pub lr_min: f32,
    /// learning rate schedule boundary, in episodes
    pub lr_decay_episodes: usize,
    pub episode_reward_history_len: usize,
    /// decouple action selection (online net) from value evaluation (target net)
    pub double_dqn: bool,
    pub status_after_episodes: usize,
    pub status_min_interval: Duration,
}

impl Default for Parameter {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            batch_size: 64,
            gamma: 0.99,
            replay_buffer_capacity: 50_000,
            epsilon_start: 1.0,
            epsilon_decay: 0.9995,
            epsilon_min: 0.01,
            update_after_steps: 4,
            sync_target_after_steps: 1000,
            checkpoint_after_steps: 1000,
            max_steps_per_episode: 10_000,
            lr_decay: 0.95,
            lr_min: 0.0001,
            lr_decay_episodes: 1000,
            episode_reward_history_len: 100,
            double_dqn: true,
            status_after_episodes: 10,
            status_min_interval: Duration::from_secs(1),
        }
    }
}

impl Parameter {
    /// configuration errors are fatal at startup, before any training proceeds
    pub fn validate(&self) -> Result<()> {
        ensure!(self.learning_rate > 0.0, "learning_rate must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!((0.0..=1.0).contains(&self.gamma), "gamma must lie in [0,1]");
        ensure!(self.replay_buffer_capacity >= self.batch_size, "replay buffer capacity below batch size");
        ensure!((0.0..=1.0).contains(&self.epsilon_start), "epsilon_start must lie in [0,1]");
        ensure!((0.0..=1.0).contains(&self.epsilon_decay), "epsilon_decay must lie in [0,1]");
        ensure!(self.epsilon_min <= self.epsilon_start, "epsilon_min above epsilon_start");
        ensure!(self.update_after_steps > 0, "update_after_steps must be positive");
        ensure!(self.sync_target_after_steps > 0, "sync_target_after_steps must be positive");
        ensure!(self.checkpoint_after_steps > 0, "checkpoint_after_steps must be positive");
        ensure!(self.max_steps_per_episode > 0, "max_steps_per_episode must be positive");
        ensure!(self.lr_min > 0.0 && self.lr_min <= self.learning_rate, "lr_min out of range");
        ensure!(self.lr_decay_episodes > 0, "lr_decay_episodes must be positive");
        ensure!(self.episode_reward_history_len > 0, "episode_reward_history_len must be positive");
        Ok(())
    }
}

/// A self-driving Q-learner.
///
/// Drives one [BreakoutEnvironment] through episodes, feeds the replay buffer,
/// performs the dual-net learning updates and takes care of all periodic
/// bookkeeping: target sync, epsilon decay, checkpoint flushes with best-model
/// tracking, status logging. Single logical thread of control - one environment
/// step, one learning update and one checkpoint decision happen strictly in
/// sequence.
pub struct DqnLearner<M: QFunction> {
    param: Parameter,
    environment: BreakoutEnvironment,
    model: M,
    target_model: M,
    store: CheckpointStore,
    train_log: PathBuf,
    replay_buffer: ReplayBuffer,
    episode_rewards: VecDeque<f32>,
    recent_losses: VecDeque<f32>,
    epsilon: f32,
    step_count: usize,
    episode_count: usize,
    best_avg_reward: Option<f32>,
    started: Instant,
    last_status: Instant,
    steps_at_last_status: usize,
    episodes_at_last_status: usize,
    stop_flag: Arc<AtomicBool>,
    rng: ThreadRng,
}

impl<M: QFunction> DqnLearner<M> {
    /// Builds the learner with a fresh online/target net pair and resumes from
    /// the "latest" checkpoint slot when one is present. A corrupt checkpoint
    /// degrades to a fresh start with a warning, never aborts the run.
    pub fn new(
        environment: BreakoutEnvironment,
        param: Parameter,
        model_init: impl Fn(f32) -> M,
        store: CheckpointStore,
        train_log: PathBuf,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<Self> {
        param.validate()?;

        let mut model = model_init(param.learning_rate);
        let mut target_model = model_init(param.learning_rate);
        let mut epsilon = param.epsilon_start;
        let mut step_count = 0;
        let mut episode_count = 0;
        let mut best_avg_reward = None;

        match store.load(Slot::Latest) {
            Ok(Some((weights, state))) => {
                model.set_weights(weights.clone())?;
                target_model.set_weights(weights)?;
                epsilon = state.epsilon;
                step_count = state.total_steps;
                episode_count = state.episode;
                best_avg_reward = state.best_avg_reward;
                log::info!(
                    "resuming from checkpoint: episode {}, {} steps, 𝜀={:.3}",
                    episode_count,
                    step_count.to_formatted_string(&util::number_format()),
                    epsilon
                );
            }
            Ok(None) => log::info!("no checkpoint found - starting from scratch"),
            Err(e) => log::warn!("checkpoint unreadable, starting from scratch: {:#}", e),
        }

        let mut learner = Self {
            replay_buffer: ReplayBuffer::new(param.replay_buffer_capacity),
            param,
            environment,
            model,
            target_model,
            store,
            train_log,
            episode_rewards: VecDeque::new(),
            recent_losses: VecDeque::new(),
            epsilon,
            step_count,
            episode_count,
            best_avg_reward,
            started: Instant::now(),
            last_status: Instant::now(),
            steps_at_last_status: step_count,
            episodes_at_last_status: episode_count,
            stop_flag,
            rng: rand::thread_rng(),
        };
        learner.apply_lr_schedule();
        Ok(learner)
    }

    pub fn episode_count(&self) -> usize {
        self.episode_count
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Runs episodes until the stop flag is raised, then performs one
    /// best-effort final save to the "latest" slot.
    pub fn run(&mut self) -> Result<()> {
        while !self.stop_flag.load(Ordering::Relaxed) {
            let episodes_before = self.episode_count;
            let episode_reward = self.learn_episode()?;
            if self.episode_count == episodes_before {
                // interrupted mid-episode, nothing completed to record
                break;
            }
            self.episode_rewards.push_back(episode_reward);
            if self.episode_rewards.len() > self.param.episode_reward_history_len {
                self.episode_rewards.pop_front();
            }
            self.maybe_emit_status(episode_reward);
        }

        log::info!("stop signal received - saving final checkpoint");
        if let Err(e) = self.store.save(Slot::Latest, &self.model.weights(), &self.training_state()) {
            log::error!("final checkpoint save failed: {:#}", e);
        }
        Ok(())
    }

    /// One episode: reset, launch immediately, then select/step/store/learn
    /// until done or the step cap. Returns the undiscounted reward sum.
    ///
    /// A shutdown interrupt cuts the episode short without counting it: no
    /// epsilon decay, no episode increment.
    pub fn learn_episode(&mut self) -> Result<f32> {
        self.environment.reset();
        self.environment.launch();
        let mut state = self.environment.observation();
        let mut episode_reward = 0.0;

        for _ in 0..self.param.max_steps_per_episode {
            if self.stop_flag.load(Ordering::Relaxed) {
                return Ok(episode_reward);
            }
            self.step_count += 1;

            let action = self.select_action(&state)?;
            let step = self.environment.step(action);
            episode_reward += step.reward;

            self.replay_buffer.push(Transition {
                state,
                action,
                reward: step.reward,
                next_state: step.obs,
                done: step.done,
            });
            state = step.obs;

            if self.step_count % self.param.update_after_steps == 0
                && self.replay_buffer.len() >= self.param.batch_size
            {
                let loss = self.train_batch()?;
                if self.recent_losses.len() >= RECENT_LOSS_WINDOW {
                    self.recent_losses.pop_front();
                }
                self.recent_losses.push_back(loss);
            }

            if self.step_count % self.param.sync_target_after_steps == 0 {
                self.target_model.set_weights(self.model.weights())?;
                log::debug!("target net synced at step {}", self.step_count);
            }

            if self.step_count % self.param.checkpoint_after_steps == 0 {
                self.flush_checkpoint();
            }

            if step.done {
                break;
            }
        }

        self.epsilon = (self.epsilon * self.param.epsilon_decay).max(self.param.epsilon_min);
        self.episode_count += 1;
        if self.episode_count % self.param.lr_decay_episodes == 0 {
            self.apply_lr_schedule();
        }
        Ok(episode_reward)
    }

    /// Epsilon-greedy over the online net. The greedy branch is deterministic
    /// per call: ties break towards the first maximum.
    fn select_action(&mut self, state: &Observation) -> Result<PaddleAction> {
        if self.rng.gen::<f32>() < self.epsilon {
            PaddleAction::try_from_numeric(self.rng.gen_range(0..ACTION_SPACE))
        } else {
            let q_values = self.model.predict(state);
            PaddleAction::try_from_numeric(argmax_first(q_values) as u8)
        }
    }

    /// One gradient step on one uniformly sampled batch.
    ///
    /// The online prediction forms the base target matrix; only the taken-action
    /// column is overwritten with `reward + 𝛾 * bootstrapped_estimate`, so the
    /// gradient flows through the taken action alone. Terminal transitions use
    /// the reward as-is.
    fn train_batch(&mut self) -> Result<f32> {
        let samples: Vec<Transition> = self
            .replay_buffer
            .sample(self.param.batch_size, &mut self.rng)
            .into_iter()
            .copied()
            .collect();
        let states: Vec<Observation> = samples.iter().map(|t| t.state).collect();
        let next_states: Vec<Observation> = samples.iter().map(|t| t.next_state).collect();

        let mut targets = self.model.predict_batch(&states);
        let next_q_target = self.target_model.predict_batch(&next_states);
        let next_q_online = if self.param.double_dqn {
            Some(self.model.predict_batch(&next_states))
        } else {
            None
        };

        for (i, transition) in samples.iter().enumerate() {
            let bootstrapped = if transition.done {
                0.0
            } else {
                match &next_q_online {
                    // Double DQN: action selected by the online net, value taken
                    // from the target net - counters the max-operator overestimation
                    Some(online) => {
                        let best = argmax_first(online.row(i).iter().copied());
                        next_q_target[[i, best]]
                    }
                    None => next_q_target.row(i).iter().copied().fold(f32::NEG_INFINITY, f32::max),
                }
            };
            let column = transition.action.numeric() as usize;
            targets[[i, column]] = transition.reward + self.param.gamma * bootstrapped;
        }

        self.model.fit_batch(&states, &targets)
    }

    fn training_state(&self) -> TrainingState {
        TrainingState {
            epsilon: self.epsilon,
            total_steps: self.step_count,
            episode: self.episode_count,
            best_avg_reward: self.best_avg_reward,
        }
    }

    /// Periodic flush to "latest"; additionally persists to "best" when the
    /// rolling average improved. Save failures are recoverable - skip this
    /// cycle, retry on the next one.
    fn flush_checkpoint(&mut self) {
        if let Err(e) = self.store.save(Slot::Latest, &self.model.weights(), &self.training_state()) {
            log::warn!("checkpoint save skipped: {:#}", e);
            return;
        }

        if self.episode_rewards.len() >= self.param.episode_reward_history_len {
            let avg = self.avg_episode_reward();
            if self.best_avg_reward.map_or(true, |best| avg > best) {
                self.best_avg_reward = Some(avg);
                match self.store.save(Slot::Best, &self.model.weights(), &self.training_state()) {
                    Ok(()) => log::info!("new best rolling average reward: {:.1}", avg),
                    Err(e) => log::warn!("best checkpoint save failed: {:#}", e),
                }
            }
        }
    }

    fn avg_episode_reward(&self) -> f32 {
        self.episode_rewards.iter().sum::<f32>() / self.episode_rewards.len().max(1) as f32
    }

    fn mean_recent_loss(&self) -> f32 {
        if self.recent_losses.is_empty() {
            0.0
        } else {
            self.recent_losses.iter().sum::<f32>() / self.recent_losses.len() as f32
        }
    }

    fn apply_lr_schedule(&mut self) {
        let decayed = self.param.learning_rate
            * self.param.lr_decay.powi((self.episode_count / self.param.lr_decay_episodes) as i32);
        self.model.set_learning_rate(decayed.max(self.param.lr_min));
    }

    /// status line + append-only train-log record, at least once per second of
    /// wall time or every n episodes, whichever comes first
    fn maybe_emit_status(&mut self, episode_reward: f32) {
        let due_by_episodes =
            self.episode_count - self.episodes_at_last_status >= self.param.status_after_episodes;
        let due_by_time = self.last_status.elapsed() >= self.param.status_min_interval;
        if !due_by_episodes && !due_by_time {
            return;
        }

        let elapsed_since_last = self.last_status.elapsed().as_secs_f32().max(f32::EPSILON);
        let steps_per_sec = (self.step_count - self.steps_at_last_status) as f32 / elapsed_since_last;
        let avg = self.avg_episode_reward();
        let elapsed_total = self.started.elapsed().as_secs_f32();

        let number_format = util::number_format();
        log::info!(
            "episode {}: reward {:.1}, avg100 {:.1}, best {}, 𝜀={:.3}, {:.0} steps/s, loss {:.4}, buffer {}",
            self.episode_count.to_formatted_string(&number_format),
            episode_reward,
            avg,
            self.best_avg_reward.map_or_else(|| "-".to_string(), |b| format!("{:.1}", b)),
            self.epsilon,
            steps_per_sec,
            self.mean_recent_loss(),
            self.replay_buffer.len().to_formatted_string(&number_format),
        );
        if let Err(e) = self.append_train_log(episode_reward, avg, steps_per_sec, elapsed_total) {
            log::warn!("train log write failed: {:#}", e);
        }

        self.last_status = Instant::now();
        self.steps_at_last_status = self.step_count;
        self.episodes_at_last_status = self.episode_count;
    }

    /// one delimited record per status emission; open-append-close per write
    fn append_train_log(
        &self,
        episode_reward: f32,
        avg: f32,
        steps_per_sec: f32,
        elapsed_total: f32,
    ) -> Result<()> {
        let write_header = !self.train_log.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.train_log)?;
        if write_header {
            writeln!(file, "episode,reward,avg100,best_avg,epsilon,steps_per_sec,loss,buffer,elapsed")?;
        }
        writeln!(
            file,
            "{},{:.2},{:.2},{},{:.4},{:.1},{:.5},{},{:.1}",
            self.episode_count,
            episode_reward,
            avg,
            self.best_avg_reward.map_or_else(String::new, |b| format!("{:.2}", b)),
            self.epsilon,
            steps_per_sec,
            self.mean_recent_loss(),
            self.replay_buffer.len(),
            elapsed_total,
        )?;
        Ok(())
    }
}
