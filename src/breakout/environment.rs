use std::fmt::{Display, Formatter};

use anyhow::{bail, Result};

use crate::breakout::mechanics::{
    BreakoutMechanics, PaddleControl, BRICK_COLS, BRICK_ROWS, FIELD_HEIGHT, FIELD_WIDTH, PADDLE_WIDTH,
    START_LIVES,
};

/// fixed-length observation vector, every component normalized to ~[0,1]
pub const OBSERVATION_LEN: usize = 8 + BRICK_ROWS;
pub type Observation = [f32; OBSERVATION_LEN];

pub const ACTION_SPACE: u8 = 3;

const LIFE_LOSS_PENALTY: f32 = -100.0;
const LEVEL_CLEAR_BONUS: f32 = 500.0;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PaddleAction {
    Left,
    Hold,
    Right,
}

impl PaddleAction {
    pub fn numeric(&self) -> u8 {
        match self {
            PaddleAction::Left => 0,
            PaddleAction::Hold => 1,
            PaddleAction::Right => 2,
        }
    }

    pub fn try_from_numeric(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PaddleAction::Left),
            1 => Ok(PaddleAction::Hold),
            2 => Ok(PaddleAction::Right),
            _ => bail!("action value {} out of range (0..{})", value, ACTION_SPACE),
        }
    }
}

impl Display for PaddleAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PaddleAction::Left => write!(f, "left"),
            PaddleAction::Hold => write!(f, "hold"),
            PaddleAction::Right => write!(f, "right"),
        }
    }
}

/// Frame outcome details besides the raw reward
#[derive(Copy, Clone, Debug, Default)]
pub struct StepInfo {
    pub life_lost: bool,
    pub level_cleared: bool,
    pub score: u32,
    pub lives: u32,
    pub level: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct Step {
    pub obs: Observation,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

/// One headless Breakout game instance behind the RL-standard reset/step contract.
///
/// Deterministic except for the launch-angle jitter, which comes from a seedable
/// random source inside the mechanics.
pub struct BreakoutEnvironment {
    mechanics: BreakoutMechanics,
}

impl BreakoutEnvironment {
    pub fn new() -> Self {
        Self {
            mechanics: BreakoutMechanics::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            mechanics: BreakoutMechanics::with_seed(seed),
        }
    }

    /// Re-initializes all game state. Must be called before first use and after
    /// a terminal step. The ball starts glued to the paddle, un-launched.
    pub fn reset(&mut self) -> Observation {
        self.mechanics.reset();
        self.observation()
    }

    pub fn launch(&mut self) {
        self.mechanics.launch();
    }

    /// Advances the simulation by one frame.
    ///
    /// Reward for a non-terminal frame is the score delta from brick kills,
    /// -100 on a lost life and +500 on a cleared level, additive within the
    /// frame. The terminal frame (last life lost) carries exactly -100.
    pub fn step(&mut self, action: PaddleAction) -> Step {
        let score_before = self.mechanics.score;
        let events = self.mechanics.time_step(map_action_to_control(action));

        let done = events.life_lost && self.mechanics.lives == 0;
        let mut reward = (self.mechanics.score - score_before) as f32;
        if events.life_lost {
            reward += LIFE_LOSS_PENALTY;
        }
        if events.level_cleared {
            reward += LEVEL_CLEAR_BONUS;
        }

        Step {
            obs: self.observation(),
            reward,
            done,
            info: StepInfo {
                life_lost: events.life_lost,
                level_cleared: events.level_cleared,
                score: self.mechanics.score,
                lives: self.mechanics.lives,
                level: self.mechanics.level,
            },
        }
    }

    /// Pure read of the current derived observation; no side effects.
    pub fn observation(&self) -> Observation {
        let m = &self.mechanics;
        let mut obs = [0.0_f32; OBSERVATION_LEN];
        obs[0] = m.ball.x / FIELD_WIDTH;
        obs[1] = m.ball.y / FIELD_HEIGHT;
        obs[2] = m.ball.dx / 10.0;
        obs[3] = m.ball.dy / 10.0;
        obs[4] = m.paddle.x / FIELD_WIDTH;
        obs[5] = if m.ball_launched { 1.0 } else { 0.0 };
        obs[6] = m.lives as f32 / START_LIVES as f32;
        obs[7] = m.level.min(10) as f32 / 10.0;
        for row in 0..BRICK_ROWS {
            obs[8 + row] = m.alive_bricks_in_row(row) as f32 / BRICK_COLS as f32;
        }
        obs
    }

    pub fn score(&self) -> u32 {
        self.mechanics.score
    }

    pub fn lives(&self) -> u32 {
        self.mechanics.lives
    }

    pub fn level(&self) -> u32 {
        self.mechanics.level
    }
}

impl Default for BreakoutEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

fn map_action_to_control(action: PaddleAction) -> PaddleControl {
    match action {
        PaddleAction::Left => PaddleControl::Left,
        PaddleAction::Hold => PaddleControl::Hold,
        PaddleAction::Right => PaddleControl::Right,
    }
}
