// Prioritized experience replay buffer

use rand::Rng;
use std::collections::VecDeque;

/// One transition observed by the engine.
#[derive(Debug, Clone)]
pub struct Experience {
    pub context_hash: String,
    pub tool_name: String,
    pub reward: f64,
    pub next_context_hash: Option<String>,
    /// True when no next state exists (end of session or single-step mode).
    pub terminal: bool,
}

/// Fixed-capacity replay buffer with proportional prioritization.
///
/// Sampling weight is `priority ^ exponent`; an exponent of 0 degrades to
/// uniform sampling. The random source is injected by the caller.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    priority_exponent: f64,
    buffer: VecDeque<Experience>,
    priorities: VecDeque<f64>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, priority_exponent: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            priority_exponent,
            buffer: VecDeque::new(),
            priorities: VecDeque::new(),
        }
    }

    /// Push an experience, evicting the oldest at capacity. A missing
    /// priority defaults to the current maximum so fresh experiences are
    /// sampled at least once.
    pub fn add(&mut self, experience: Experience, priority: Option<f64>) {
        let priority = priority
            .unwrap_or_else(|| self.priorities.iter().copied().fold(1.0, f64::max))
            .max(0.0);

        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
            self.priorities.pop_front();
        }
        self.buffer.push_back(experience);
        self.priorities.push_back(priority);
    }

    /// Sample up to `batch_size` distinct experiences, weighted by priority.
    pub fn sample(&self, batch_size: usize, rng: &mut impl Rng) -> Vec<Experience> {
        if self.buffer.len() <= batch_size {
            return self.buffer.iter().cloned().collect();
        }

        // Zero out a weight once its experience is picked, so draws stay
        // distinct within the batch.
        let mut weights: Vec<f64> = self
            .priorities
            .iter()
            .map(|p| p.powf(self.priority_exponent))
            .collect();
        let mut picked = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let total: f64 = weights.iter().sum();
            let index = if total > 0.0 {
                weighted_draw(&weights, rng.gen::<f64>() * total)
            } else {
                // Every remaining weight is zero: uniform over the rest.
                let remaining: Vec<usize> = weights
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| !picked_index(&picked, i))
                    .map(|(i, _)| i)
                    .collect();
                if remaining.is_empty() {
                    break;
                }
                Some(remaining[rng.gen_range(0..remaining.len())])
            };

            let Some(index) = index else { break };
            weights[index] = 0.0;
            picked.push((index, self.buffer[index].clone()));
        }

        picked.into_iter().map(|(_, experience)| experience).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn picked_index(picked: &[(usize, Experience)], index: usize) -> bool {
    picked.iter().any(|&(i, _)| i == index)
}

/// Walk the cumulative weights until the draw is exhausted.
fn weighted_draw(weights: &[f64], mut draw: f64) -> Option<usize> {
    let mut chosen = None;
    for (i, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        chosen = Some(i);
        draw -= weight;
        if draw <= 0.0 {
            break;
        }
    }
    chosen
}
