use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::breakout::environment::{Observation, ACTION_SPACE, OBSERVATION_LEN};

pub const NUM_ACTIONS: usize = ACTION_SPACE as usize;
const HIDDEN_1: usize = 64;
const HIDDEN_2: usize = 64;

/// Q-value function approximator: observation -> per-action value estimate.
///
/// The online and the target net are two independent instances of the same
/// implementation; copying weights across is the only synchronization primitive.
pub trait QFunction {
    fn predict(&self, obs: &Observation) -> [f32; NUM_ACTIONS];

    /// row i of the result holds the per-action values for `states[i]`
    fn predict_batch(&self, states: &[Observation]) -> Array2<f32>;

    /// One gradient step towards `targets` (shape `[states.len(), NUM_ACTIONS]`).
    /// Returns the scalar loss. A non-finite loss is a fatal error.
    fn fit_batch(&mut self, states: &[Observation], targets: &Array2<f32>) -> Result<f32>;

    fn weights(&self) -> NetWeights;
    fn set_weights(&mut self, weights: NetWeights) -> Result<()>;

    fn learning_rate(&self) -> f32;
    fn set_learning_rate(&mut self, learning_rate: f32);
}

/// Complete, transferable parameter set of an [MlpQNet]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetWeights {
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,
    pub w3: Array2<f32>,
    pub b3: Array1<f32>,
}

/// Feed-forward regressor 13 -> 64 -> 64 -> 3, ReLU hidden layers, linear output,
/// trained with plain SGD on the mean squared error.
pub struct MlpQNet {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
    w3: Array2<f32>,
    b3: Array1<f32>,
    learning_rate: f32,
}

impl MlpQNet {
    pub fn new(learning_rate: f32) -> Self {
        Self::with_rng(learning_rate, &mut StdRng::from_entropy())
    }

    pub fn with_seed(learning_rate: f32, seed: u64) -> Self {
        Self::with_rng(learning_rate, &mut StdRng::seed_from_u64(seed))
    }

    fn with_rng(learning_rate: f32, rng: &mut StdRng) -> Self {
        Self {
            w1: he_uniform(OBSERVATION_LEN, HIDDEN_1, rng),
            b1: Array1::zeros(HIDDEN_1),
            w2: he_uniform(HIDDEN_1, HIDDEN_2, rng),
            b2: Array1::zeros(HIDDEN_2),
            w3: he_uniform(HIDDEN_2, NUM_ACTIONS, rng),
            b3: Array1::zeros(NUM_ACTIONS),
            learning_rate,
        }
    }

    /// net with all-zero parameters; every input predicts [0, 0, 0]
    pub fn zeroed(learning_rate: f32) -> Self {
        Self {
            w1: Array2::zeros((OBSERVATION_LEN, HIDDEN_1)),
            b1: Array1::zeros(HIDDEN_1),
            w2: Array2::zeros((HIDDEN_1, HIDDEN_2)),
            b2: Array1::zeros(HIDDEN_2),
            w3: Array2::zeros((HIDDEN_2, NUM_ACTIONS)),
            b3: Array1::zeros(NUM_ACTIONS),
            learning_rate,
        }
    }

    fn batch_input(states: &[Observation]) -> Array2<f32> {
        let flat: Vec<f32> = states.iter().flatten().copied().collect();
        Array2::from_shape_vec((states.len(), OBSERVATION_LEN), flat)
            .expect("observation batch has a fixed row length")
    }

    /// forward pass keeping the intermediates needed for backprop
    fn forward(&self, x: &Array2<f32>) -> (Array2<f32>, Array2<f32>, Array2<f32>, Array2<f32>, Array2<f32>) {
        let z1 = x.dot(&self.w1) + &self.b1;
        let a1 = z1.mapv(|v| v.max(0.0));
        let z2 = a1.dot(&self.w2) + &self.b2;
        let a2 = z2.mapv(|v| v.max(0.0));
        let out = a2.dot(&self.w3) + &self.b3;
        (z1, a1, z2, a2, out)
    }
}

impl QFunction for MlpQNet {
    fn predict(&self, obs: &Observation) -> [f32; NUM_ACTIONS] {
        let x = Self::batch_input(std::slice::from_ref(obs));
        let (_, _, _, _, out) = self.forward(&x);
        let row = out.row(0);
        [row[0], row[1], row[2]]
    }

    fn predict_batch(&self, states: &[Observation]) -> Array2<f32> {
        let x = Self::batch_input(states);
        let (_, _, _, _, out) = self.forward(&x);
        out
    }

    fn fit_batch(&mut self, states: &[Observation], targets: &Array2<f32>) -> Result<f32> {
        let n = states.len();
        if targets.dim() != (n, NUM_ACTIONS) {
            bail!("target matrix shape {:?} does not match batch size {}", targets.dim(), n);
        }

        let x = Self::batch_input(states);
        let (z1, a1, z2, a2, out) = self.forward(&x);

        let diff = &out - targets;
        let loss = diff.mapv(|v| v * v).mean().unwrap_or(0.0);
        if !loss.is_finite() {
            bail!("non-finite training loss: {}", loss);
        }

        let grad_out = diff.mapv(|v| 2.0 * v / (n * NUM_ACTIONS) as f32);

        let grad_w3 = a2.t().dot(&grad_out);
        let grad_b3 = grad_out.sum_axis(Axis(0));
        let delta2 = grad_out.dot(&self.w3.t()) * z2.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let grad_w2 = a1.t().dot(&delta2);
        let grad_b2 = delta2.sum_axis(Axis(0));
        let delta1 = delta2.dot(&self.w2.t()) * z1.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let grad_w1 = x.t().dot(&delta1);
        let grad_b1 = delta1.sum_axis(Axis(0));

        let lr = self.learning_rate;
        self.w3.scaled_add(-lr, &grad_w3);
        self.b3.scaled_add(-lr, &grad_b3);
        self.w2.scaled_add(-lr, &grad_w2);
        self.b2.scaled_add(-lr, &grad_b2);
        self.w1.scaled_add(-lr, &grad_w1);
        self.b1.scaled_add(-lr, &grad_b1);

        Ok(loss)
    }

    fn weights(&self) -> NetWeights {
        NetWeights {
            w1: self.w1.clone(),
            b1: self.b1.clone(),
            w2: self.w2.clone(),
            b2: self.b2.clone(),
            w3: self.w3.clone(),
            b3: self.b3.clone(),
        }
    }

    fn set_weights(&mut self, weights: NetWeights) -> Result<()> {
        if weights.w1.dim() != self.w1.dim()
            || weights.b1.dim() != self.b1.dim()
            || weights.w2.dim() != self.w2.dim()
            || weights.b2.dim() != self.b2.dim()
            || weights.w3.dim() != self.w3.dim()
            || weights.b3.dim() != self.b3.dim()
        {
            bail!("weight shapes do not match the net architecture");
        }
        self.w1 = weights.w1;
        self.b1 = weights.b1;
        self.w2 = weights.w2;
        self.b2 = weights.b2;
        self.w3 = weights.w3;
        self.b3 = weights.b3;
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

fn he_uniform(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Array2<f32> {
    let limit = (6.0 / fan_in as f32).sqrt();
    Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit))
}

/// Index of the first maximum; deterministic tie-break towards the lower index.
pub fn argmax_first(values: impl IntoIterator<Item = f32>) -> usize {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (i, v) in values.into_iter().enumerate() {
        if v > best {
            best = v;
            best_idx = i;
        }
    }
    best_idx
}
