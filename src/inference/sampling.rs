//! Token selection
//!
//! Turns a score distribution into one token id, either greedily or through
//! the stochastic chain: repetition penalty, top-k, top-p, temperature, then
//! a seeded draw.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::TokenId;
use crate::inference::params::GenerationConfig;

/// How many recently generated tokens the repetition penalty looks at
pub const REPEAT_LAST_N: usize = 64;

/// Token selection strategy for one generate call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// Penalty, top-k, top-p and temperature, then a random draw
    StochasticChain,
    /// Highest score wins; ties go to the lowest token id
    Greedy,
}

impl SamplingPolicy {
    /// Greedy for non-positive temperatures, the stochastic chain otherwise.
    pub fn for_config(config: &GenerationConfig) -> Self {
        if config.temperature <= 0.0 {
            SamplingPolicy::Greedy
        } else {
            SamplingPolicy::StochasticChain
        }
    }
}

/// Stateful sampler for a single generate call
///
/// Holds the repetition history and RNG, so a fresh sampler per call keeps
/// calls independent of each other.
#[derive(Debug, Clone)]
pub struct Sampler {
    policy: SamplingPolicy,
    config: GenerationConfig,
    history: VecDeque<TokenId>,
    rng: StdRng,
}

impl Sampler {
    pub fn new(policy: SamplingPolicy, config: &GenerationConfig, seed: u64) -> Self {
        Self {
            policy,
            config: *config,
            history: VecDeque::with_capacity(REPEAT_LAST_N),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    /// Picks the next token, or `None` for an empty distribution.
    pub fn sample(&mut self, scores: &[f32]) -> Option<TokenId> {
        let index = match self.policy {
            SamplingPolicy::Greedy => greedy(scores),
            SamplingPolicy::StochasticChain => self.sample_chain(scores),
        }?;
        TokenId::try_from(index).ok()
    }

    /// Records a generated token for the repetition penalty.
    pub fn accept(&mut self, token: TokenId) {
        if self.history.len() == REPEAT_LAST_N {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    fn sample_chain(&mut self, scores: &[f32]) -> Option<usize> {
        if scores.is_empty() {
            return None;
        }
        let mut candidates: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();

        apply_repeat_penalty(&mut candidates, &self.history, self.config.repeat_penalty);
        apply_top_k(&mut candidates, self.config.top_k);
        apply_top_p(&mut candidates, self.config.top_p);
        if self.config.temperature <= 0.0 {
            return candidates.first().map(|&(index, _)| index);
        }
        // Shifting by the best logit first keeps tiny temperatures from
        // overflowing every candidate to infinity.
        let best = candidates
            .iter()
            .map(|&(_, l)| l)
            .fold(f32::NEG_INFINITY, f32::max);
        let shift = if best.is_finite() { best } else { 0.0 };
        for (_, logit) in candidates.iter_mut() {
            *logit = (*logit - shift) / self.config.temperature;
        }

        let probs = softmax(&candidates);
        let r: f32 = self.rng.random();
        let mut cumsum = 0.0;
        for (&(index, _), prob) in candidates.iter().zip(&probs) {
            cumsum += prob;
            if r < cumsum {
                return Some(index);
            }
        }
        // Rounding left the cumulative mass just below `r`.
        candidates.last().map(|&(index, _)| index)
    }
}

/// Index of the highest score, lowest index on ties. NaN never wins.
pub fn greedy(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        match best {
            Some((_, best_score)) if !(score > best_score) => {}
            None if score.is_nan() => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index).or(if scores.is_empty() { None } else { Some(0) })
}

/// Makes recently generated tokens less likely, whatever their sign.
fn apply_repeat_penalty(candidates: &mut [(usize, f32)], history: &VecDeque<TokenId>, penalty: f32) {
    if penalty == 1.0 || history.is_empty() {
        return;
    }
    for (index, logit) in candidates.iter_mut() {
        let seen = history
            .iter()
            .any(|&t| usize::try_from(t).is_ok_and(|t| t == *index));
        if !seen {
            continue;
        }
        if *logit <= 0.0 {
            *logit *= penalty;
        } else {
            *logit /= penalty;
        }
    }
}

/// Sorts candidates by descending score and keeps the best `k`.
fn apply_top_k(candidates: &mut Vec<(usize, f32)>, k: i32) {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    if let Ok(k) = usize::try_from(k) {
        if k > 0 && k < candidates.len() {
            candidates.truncate(k);
        }
    }
}

/// Keeps the smallest prefix of sorted candidates whose probability mass
/// reaches `p`, never fewer than one.
fn apply_top_p(candidates: &mut Vec<(usize, f32)>, p: f32) {
    if p >= 1.0 || candidates.is_empty() {
        return;
    }
    let probs = softmax(candidates);
    let mut cumsum = 0.0;
    let mut keep = candidates.len();
    for (i, prob) in probs.iter().enumerate() {
        cumsum += prob;
        if cumsum >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

fn softmax(candidates: &[(usize, f32)]) -> Vec<f32> {
    let max_logit = candidates
        .iter()
        .map(|&(_, l)| l)
        .fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::INFINITY {
        // Infinite logits take all of the mass.
        let winners = candidates.iter().filter(|&&(_, l)| l == f32::INFINITY).count();
        return candidates
            .iter()
            .map(|&(_, l)| if l == f32::INFINITY { 1.0 / winners as f32 } else { 0.0 })
            .collect();
    }
    if !max_logit.is_finite() {
        return vec![1.0 / candidates.len() as f32; candidates.len()];
    }
    let exps: Vec<f32> = candidates
        .iter()
        .map(|&(_, l)| (l - max_logit).exp())
        .map(|e| if e.is_nan() { 0.0 } else { e })
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}
