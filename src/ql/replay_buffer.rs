use rand::Rng;

use crate::breakout::environment::{Observation, PaddleAction};

/// One environment transition; owned by the buffer after insertion
#[derive(Copy, Clone, Debug)]
pub struct Transition {
    pub state: Observation,
    pub action: PaddleAction,
    pub reward: f32,
    pub next_state: Observation,
    pub done: bool,
}

/// Fixed-capacity experience store with FIFO overwrite.
///
/// Ring semantics via a wraparound write index: once full, each push evicts the
/// oldest-inserted slot. `push` is O(1) and never fails.
pub struct ReplayBuffer {
    capacity: usize,
    buffer: Vec<Transition>,
    write_pos: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            buffer: Vec::with_capacity(capacity),
            write_pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn push(&mut self, transition: Transition) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(transition);
        } else {
            self.buffer[self.write_pos] = transition;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
    }

    /// Draws `k` transitions independently and uniformly, with replacement.
    /// Caller must guarantee a non-empty buffer.
    pub fn sample<'a, R: Rng>(&'a self, k: usize, rng: &mut R) -> Vec<&'a Transition> {
        assert!(!self.buffer.is_empty(), "sample() on an empty replay buffer");
        (0..k).map(|_| &self.buffer[rng.gen_range(0..self.buffer.len())]).collect()
    }
}
