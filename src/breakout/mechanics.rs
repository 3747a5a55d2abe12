use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// TOP / LEFT corner is 0/0, y grows downwards
pub const FIELD_WIDTH: f32 = 800.0;
pub const FIELD_HEIGHT: f32 = 600.0;

pub const PADDLE_WIDTH: f32 = 100.0;
pub const PADDLE_HEIGHT: f32 = 14.0;
pub const PADDLE_SPEED: f32 = 8.0;
/// y of the paddle's upper edge (the face the ball bounces off)
pub const PADDLE_FACE_Y: f32 = 570.0;

pub const BALL_RADIUS: f32 = 7.0;
pub const BALL_START_SPEED: f32 = 5.0;
/// horizontal jitter range on launch
const LAUNCH_MAX_DX: f32 = 3.0;
/// outgoing dx at the outermost paddle edge
const PADDLE_BOUNCE_MAX_DX: f32 = 5.0;
/// permanent ball speed gain per cleared level
const LEVEL_SPEED_GAIN: f32 = 0.5;

pub const BRICK_ROWS: usize = 5;
pub const BRICK_COLS: usize = 10;
pub const BRICK_WIDTH: f32 = 70.0;
pub const BRICK_HEIGHT: f32 = 20.0;
const BRICK_SPACING: f32 = 8.0;
const BRICK_FIRST_ROW_TOP_Y: f32 = 60.0;
/// grid horizontally centered in the field
const BRICK_LEFT_X: f32 =
    (FIELD_WIDTH - (BRICK_COLS as f32 * BRICK_WIDTH + (BRICK_COLS - 1) as f32 * BRICK_SPACING)) / 2.0;
/// rows 0..TWO_HIT_ROWS take two hits, the rest one
const TWO_HIT_ROWS: usize = 2;

pub const START_LIVES: u32 = 3;
const BRICK_SCORE_BASE: u32 = 10;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PaddleControl {
    Left,
    Hold,
    Right,
}

#[derive(Clone, Debug)]
pub struct Paddle {
    /// left edge; invariant: 0 <= x <= FIELD_WIDTH - PADDLE_WIDTH
    pub x: f32,
}

impl Paddle {
    fn shift(&mut self, dx: f32) {
        self.x = (self.x + dx).clamp(0.0, FIELD_WIDTH - PADDLE_WIDTH);
    }

    pub fn center_x(&self) -> f32 {
        self.x + PADDLE_WIDTH / 2.0
    }
}

#[derive(Clone, Debug)]
pub struct Ball {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    /// magnitude of the vertical launch velocity; grows on level-clear
    pub speed: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Brick {
    pub x: f32,
    pub y: f32,
    pub hits: u8,
    pub alive: bool,
}

/// Per-frame events relevant for reward shaping
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameEvents {
    pub life_lost: bool,
    pub level_cleared: bool,
}

pub struct BreakoutMechanics {
    pub paddle: Paddle,
    pub ball: Ball,
    pub bricks: Vec<Brick>,
    pub ball_launched: bool,
    pub score: u32,
    pub lives: u32,
    pub level: u32,
    /// consecutive brick kills since the last paddle bounce
    pub combo: u32,
    rng: StdRng,
}

impl BreakoutMechanics {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// deterministic variant for tests and replays
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let mut mechanics = Self {
            paddle: Self::initial_paddle(),
            ball: Self::initial_ball(),
            bricks: Self::initial_bricks(),
            ball_launched: false,
            score: 0,
            lives: START_LIVES,
            level: 1,
            combo: 0,
            rng,
        };
        mechanics.dock_ball();
        mechanics
    }

    pub fn reset(&mut self) {
        self.paddle = Self::initial_paddle();
        self.ball = Self::initial_ball();
        self.bricks = Self::initial_bricks();
        self.ball_launched = false;
        self.score = 0;
        self.lives = START_LIVES;
        self.level = 1;
        self.combo = 0;
        self.dock_ball();
    }

    fn initial_paddle() -> Paddle {
        Paddle {
            x: (FIELD_WIDTH - PADDLE_WIDTH) / 2.0,
        }
    }

    fn initial_ball() -> Ball {
        Ball {
            x: FIELD_WIDTH / 2.0,
            y: PADDLE_FACE_Y - BALL_RADIUS,
            dx: 0.0,
            dy: 0.0,
            speed: BALL_START_SPEED,
        }
    }

    pub fn initial_bricks() -> Vec<Brick> {
        (0..BRICK_ROWS)
            .cartesian_product(0..BRICK_COLS)
            .map(|(row, col)| Brick {
                x: BRICK_LEFT_X + col as f32 * (BRICK_WIDTH + BRICK_SPACING),
                y: BRICK_FIRST_ROW_TOP_Y + row as f32 * (BRICK_HEIGHT + BRICK_SPACING),
                hits: if row < TWO_HIT_ROWS { 2 } else { 1 },
                alive: true,
            })
            .collect()
    }

    /// glue the ball onto the paddle center
    fn dock_ball(&mut self) {
        self.ball.x = self.paddle.center_x();
        self.ball.y = PADDLE_FACE_Y - BALL_RADIUS;
        self.ball.dx = 0.0;
        self.ball.dy = 0.0;
    }

    /// Gives the docked ball an upward velocity with randomized horizontal jitter.
    /// No-op once the ball is in flight.
    pub fn launch(&mut self) {
        if !self.ball_launched {
            self.ball_launched = true;
            self.set_launch_velocity();
        }
    }

    fn set_launch_velocity(&mut self) {
        self.ball.dx = self.rng.gen_range(-LAUNCH_MAX_DX..=LAUNCH_MAX_DX);
        self.ball.dy = -self.ball.speed;
    }

    /// re-launch after a life loss or level clear; the game never pauses mid-run
    fn relaunch_ball(&mut self) {
        self.dock_ball();
        self.set_launch_velocity();
    }

    pub fn alive_bricks_in_row(&self, row: usize) -> usize {
        self.bricks[row * BRICK_COLS..(row + 1) * BRICK_COLS]
            .iter()
            .filter(|b| b.alive)
            .count()
    }

    /// Advances the simulation by one frame.
    ///
    /// Returns the per-frame events; the caller derives the reward from them
    /// together with the score delta. A frame with a lost ball ends early:
    /// no paddle or brick collision checks happen after a bottom-wall miss.
    pub fn time_step(&mut self, control: PaddleControl) -> FrameEvents {
        let mut events = FrameEvents::default();

        match control {
            PaddleControl::Left => self.paddle.shift(-PADDLE_SPEED),
            PaddleControl::Hold => {}
            PaddleControl::Right => self.paddle.shift(PADDLE_SPEED),
        }

        if !self.ball_launched {
            // physics suspended, ball follows the paddle
            self.dock_ball();
            return events;
        }

        self.ball.x += self.ball.dx;
        self.ball.y += self.ball.dy;
        self.reflect_off_walls();

        if self.ball.y - BALL_RADIUS > FIELD_HEIGHT {
            self.lives -= 1;
            self.combo = 0;
            events.life_lost = true;
            if self.lives > 0 {
                self.relaunch_ball();
            }
            return events;
        }

        self.bounce_off_paddle();
        self.hit_bricks();

        if self.bricks.iter().all(|b| !b.alive) {
            self.level += 1;
            self.ball.speed += LEVEL_SPEED_GAIN;
            self.bricks = Self::initial_bricks();
            self.relaunch_ball();
            events.level_cleared = true;
        }
        events
    }

    fn reflect_off_walls(&mut self) {
        if self.ball.x - BALL_RADIUS < 0.0 {
            self.ball.x = BALL_RADIUS;
            self.ball.dx = self.ball.dx.abs();
        } else if self.ball.x + BALL_RADIUS > FIELD_WIDTH {
            self.ball.x = FIELD_WIDTH - BALL_RADIUS;
            self.ball.dx = -self.ball.dx.abs();
        }
        if self.ball.y - BALL_RADIUS < 0.0 {
            self.ball.y = BALL_RADIUS;
            self.ball.dy = self.ball.dy.abs();
        }
    }

    /// Reflects a downward ball upward off the paddle face. The outgoing dx is a
    /// linear function of the impact offset: left edge -> -PADDLE_BOUNCE_MAX_DX,
    /// center -> 0, right edge -> PADDLE_BOUNCE_MAX_DX. An already-upward ball is
    /// never re-reflected downward.
    fn bounce_off_paddle(&mut self) {
        if self.ball.dy <= 0.0 {
            return;
        }
        let overlaps = self.ball.x + BALL_RADIUS > self.paddle.x
            && self.ball.x - BALL_RADIUS < self.paddle.x + PADDLE_WIDTH
            && self.ball.y + BALL_RADIUS > PADDLE_FACE_Y
            && self.ball.y - BALL_RADIUS < PADDLE_FACE_Y + PADDLE_HEIGHT;
        if overlaps {
            let offset = ((self.ball.x - self.paddle.center_x()) / (PADDLE_WIDTH / 2.0)).clamp(-1.0, 1.0);
            self.ball.dx = offset * PADDLE_BOUNCE_MAX_DX;
            self.ball.dy = -self.ball.dy.abs();
            self.combo = 0;
        }
    }

    /// Tests every alive brick for AABB overlap with the ball; several bricks can
    /// be hit within the same frame, each resolved independently. The bounce axis
    /// is the one with the smaller penetration depth.
    fn hit_bricks(&mut self) {
        for brick in self.bricks.iter_mut().filter(|b| b.alive) {
            let overlap_left = self.ball.x + BALL_RADIUS - brick.x;
            let overlap_right = brick.x + BRICK_WIDTH - (self.ball.x - BALL_RADIUS);
            let overlap_top = self.ball.y + BALL_RADIUS - brick.y;
            let overlap_bottom = brick.y + BRICK_HEIGHT - (self.ball.y - BALL_RADIUS);
            if overlap_left <= 0.0 || overlap_right <= 0.0 || overlap_top <= 0.0 || overlap_bottom <= 0.0 {
                continue;
            }

            if overlap_left.min(overlap_right) < overlap_top.min(overlap_bottom) {
                self.ball.dx = -self.ball.dx;
            } else {
                self.ball.dy = -self.ball.dy;
            }

            brick.hits -= 1;
            if brick.hits == 0 {
                brick.alive = false;
                self.combo += 1;
                self.score += BRICK_SCORE_BASE * self.combo * self.level;
            }
        }
    }
}

impl Default for BreakoutMechanics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn initial_brick_grid() {
        let bricks = BreakoutMechanics::initial_bricks();
        assert_eq!(bricks.len(), BRICK_ROWS * BRICK_COLS);
        assert!(bricks.iter().all(|b| b.alive));
        assert!(bricks.iter().all(|b| b.x >= 0.0 && b.x + BRICK_WIDTH <= FIELD_WIDTH));
        // two-hit rows on top
        assert_eq!(bricks[0].hits, 2);
        assert_eq!(bricks[(TWO_HIT_ROWS - 1) * BRICK_COLS].hits, 2);
        assert_eq!(bricks[TWO_HIT_ROWS * BRICK_COLS].hits, 1);
        assert_eq!(bricks.last().unwrap().hits, 1);
    }

    #[rstest]
    #[case(PaddleControl::Left)]
    #[case(PaddleControl::Right)]
    fn paddle_stays_within_field(#[case] control: PaddleControl) {
        let mut mechanics = BreakoutMechanics::with_seed(0);
        for _ in 0..500 {
            mechanics.time_step(control);
            assert!(mechanics.paddle.x >= 0.0);
            assert!(mechanics.paddle.x <= FIELD_WIDTH - PADDLE_WIDTH);
        }
        match control {
            PaddleControl::Left => assert_eq!(mechanics.paddle.x, 0.0),
            PaddleControl::Right => assert_eq!(mechanics.paddle.x, FIELD_WIDTH - PADDLE_WIDTH),
            PaddleControl::Hold => unreachable!(),
        }
    }

    #[test]
    fn docked_ball_follows_paddle() {
        let mut mechanics = BreakoutMechanics::with_seed(0);
        mechanics.time_step(PaddleControl::Left);
        assert_eq!(mechanics.ball.x, mechanics.paddle.center_x());
        assert_eq!(mechanics.ball.dy, 0.0);
    }

    #[test]
    fn launch_is_idempotent() {
        let mut mechanics = BreakoutMechanics::with_seed(42);
        mechanics.launch();
        let (dx, dy) = (mechanics.ball.dx, mechanics.ball.dy);
        assert_eq!(dy, -BALL_START_SPEED);
        assert!((-LAUNCH_MAX_DX..=LAUNCH_MAX_DX).contains(&dx));
        mechanics.launch();
        assert_eq!(mechanics.ball.dx, dx);
        assert_eq!(mechanics.ball.dy, dy);
    }

    #[test]
    fn missed_ball_costs_a_life_and_relaunches() {
        let mut mechanics = BreakoutMechanics::with_seed(7);
        mechanics.launch();
        // drive the ball straight down past the paddle
        mechanics.ball.x = 10.0;
        mechanics.ball.y = FIELD_HEIGHT - 1.0;
        mechanics.ball.dx = 0.0;
        mechanics.ball.dy = mechanics.ball.speed;

        let mut events = FrameEvents::default();
        for _ in 0..20 {
            events = mechanics.time_step(PaddleControl::Hold);
            if events.life_lost {
                break;
            }
        }
        assert!(events.life_lost);
        assert_eq!(mechanics.lives, START_LIVES - 1);
        assert_eq!(mechanics.combo, 0);
        // auto-relaunched, not docked
        assert!(mechanics.ball_launched);
        assert_eq!(mechanics.ball.dy, -mechanics.ball.speed);
    }

    #[test]
    fn paddle_bounce_reflects_upward_and_angles_by_offset() {
        let mut mechanics = BreakoutMechanics::with_seed(0);
        mechanics.launch();
        // impact on the right half of the paddle face
        mechanics.ball.x = mechanics.paddle.center_x() + PADDLE_WIDTH / 4.0;
        mechanics.ball.y = PADDLE_FACE_Y - BALL_RADIUS - 1.0;
        mechanics.ball.dx = 0.0;
        mechanics.ball.dy = mechanics.ball.speed;

        mechanics.time_step(PaddleControl::Hold);

        assert!(mechanics.ball.dy < 0.0);
        assert!(mechanics.ball.dx > 0.0 && mechanics.ball.dx <= 5.0);
        assert_eq!(mechanics.combo, 0);
    }

    #[test]
    fn brick_kill_scores_with_combo_and_level() {
        let mut mechanics = BreakoutMechanics::with_seed(0);
        mechanics.launch();
        // aim at a one-hit brick of the bottom row
        let target = mechanics.bricks[TWO_HIT_ROWS * BRICK_COLS].clone();
        mechanics.ball.x = target.x + BRICK_WIDTH / 2.0;
        mechanics.ball.y = target.y + BRICK_HEIGHT + BALL_RADIUS + 2.0;
        mechanics.ball.dx = 0.0;
        mechanics.ball.dy = -3.0;

        let score_before = mechanics.score;
        mechanics.time_step(PaddleControl::Hold);

        assert!(!mechanics.bricks[TWO_HIT_ROWS * BRICK_COLS].alive);
        assert_eq!(mechanics.combo, 1);
        assert_eq!(mechanics.score - score_before, 10 * mechanics.combo * mechanics.level);
        // bounced back down
        assert!(mechanics.ball.dy > 0.0);
    }

    #[test]
    fn two_hit_brick_survives_first_hit() {
        let mut mechanics = BreakoutMechanics::with_seed(0);
        mechanics.launch();
        let target = mechanics.bricks[0].clone();
        mechanics.ball.x = target.x + BRICK_WIDTH / 2.0;
        mechanics.ball.y = target.y + BRICK_HEIGHT + BALL_RADIUS + 2.0;
        mechanics.ball.dx = 0.0;
        mechanics.ball.dy = -3.0;

        mechanics.time_step(PaddleControl::Hold);

        assert!(mechanics.bricks[0].alive);
        assert_eq!(mechanics.bricks[0].hits, 1);
        assert_eq!(mechanics.score, 0);
        assert_eq!(mechanics.combo, 0);
    }

    #[test]
    fn level_clear_ramps_difficulty() {
        let mut mechanics = BreakoutMechanics::with_seed(0);
        mechanics.launch();
        for brick in mechanics.bricks.iter_mut().skip(1) {
            brick.alive = false;
        }
        let last = mechanics.bricks[0].clone();
        mechanics.ball.x = last.x + BRICK_WIDTH / 2.0;
        mechanics.ball.y = last.y + BRICK_HEIGHT + BALL_RADIUS + 2.0;
        mechanics.ball.dx = 0.0;
        mechanics.ball.dy = -3.0;
        mechanics.bricks[0].hits = 1;

        let events = mechanics.time_step(PaddleControl::Hold);

        assert!(events.level_cleared);
        assert_eq!(mechanics.level, 2);
        assert_eq!(mechanics.ball.speed, BALL_START_SPEED + LEVEL_SPEED_GAIN);
        assert_eq!(mechanics.bricks.len(), BRICK_ROWS * BRICK_COLS);
        assert!(mechanics.bricks.iter().all(|b| b.alive));
        assert_eq!(mechanics.ball.dy, -mechanics.ball.speed);
    }

    #[test]
    fn wall_reflection_keeps_ball_inside() {
        let mut mechanics = BreakoutMechanics::with_seed(3);
        mechanics.launch();
        for _ in 0..2000 {
            mechanics.time_step(PaddleControl::Hold);
            assert!(mechanics.ball.x >= BALL_RADIUS - 0.01);
            assert!(mechanics.ball.x <= FIELD_WIDTH - BALL_RADIUS + 0.01);
            assert!(mechanics.ball.y >= BALL_RADIUS - 0.01);
            if mechanics.lives == 0 {
                break;
            }
        }
    }
}
