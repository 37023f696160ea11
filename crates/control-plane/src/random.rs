//! Random decisions driving the lifecycle simulation

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::VecDeque;

/// Source of every random choice the scheduler makes
pub trait RandomSource: Send + Sync {
    /// True with the given probability
    fn chance(&mut self, probability: f64) -> bool;

    /// Uniform integer in `low..=high`
    fn between(&mut self, low: usize, high: usize) -> usize;

    /// Uniform float in `low..=high`
    fn uniform(&mut self, low: f64, high: f64) -> f64;

    /// Index into `weights`, drawn proportionally to the weights
    fn weighted(&mut self, weights: &[u32]) -> usize;
}

/// `StdRng`-backed source; reproducible when seeded
pub struct StdRandom {
    rng: StdRng,
}

impl StdRandom {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl RandomSource for StdRandom {
    fn chance(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn between(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..=high)
    }

    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..=high)
    }

    fn weighted(&mut self, weights: &[u32]) -> usize {
        match WeightedIndex::new(weights) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0,
        }
    }
}

/// Deterministic source that replays scripted answers.
///
/// `chance` pops queued answers and falls back to `default_chance` once the
/// queue is empty. Counts, offsets and weighted picks return fixed values,
/// clamped to the requested range.
#[derive(Debug, Clone)]
pub struct ScriptedRandom {
    chances: VecDeque<bool>,
    default_chance: bool,
    count: usize,
    offset: f64,
    pick: usize,
}

impl ScriptedRandom {
    pub fn new(default_chance: bool) -> Self {
        Self {
            chances: VecDeque::new(),
            default_chance,
            count: 1,
            offset: 0.0,
            pick: 0,
        }
    }

    /// Answers returned by the next `chance` calls, in order
    pub fn with_chances(mut self, chances: impl IntoIterator<Item = bool>) -> Self {
        self.chances.extend(chances);
        self
    }

    /// Value returned by `between`
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Value returned by `uniform`
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Index returned by `weighted`
    pub fn with_pick(mut self, pick: usize) -> Self {
        self.pick = pick;
        self
    }
}

impl RandomSource for ScriptedRandom {
    fn chance(&mut self, _probability: f64) -> bool {
        self.chances.pop_front().unwrap_or(self.default_chance)
    }

    fn between(&mut self, low: usize, high: usize) -> usize {
        self.count.clamp(low, high.max(low))
    }

    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        self.offset.clamp(low, high.max(low))
    }

    fn weighted(&mut self, weights: &[u32]) -> usize {
        self.pick.min(weights.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_sources_agree() {
        let mut a = StdRandom::new(Some(42));
        let mut b = StdRandom::new(Some(42));

        for _ in 0..32 {
            assert_eq!(a.between(1, 3), b.between(1, 3));
            assert_eq!(a.chance(0.3), b.chance(0.3));
        }
    }

    #[test]
    fn test_std_random_ranges() {
        let mut random = StdRandom::new(Some(7));
        for _ in 0..1000 {
            let n = random.between(1, 3);
            assert!((1..=3).contains(&n));
            let x = random.uniform(-5.0, 5.0);
            assert!((-5.0..=5.0).contains(&x));
            assert!(random.weighted(&[80, 15, 5]) < 3);
        }
        assert!(!random.chance(0.0));
        assert!(random.chance(1.0));
    }

    #[test]
    fn test_scripted_replays_then_falls_back() {
        let mut random = ScriptedRandom::new(false).with_chances([true, true]);
        assert!(random.chance(0.1));
        assert!(random.chance(0.1));
        assert!(!random.chance(0.9));
    }

    #[test]
    fn test_scripted_clamps() {
        let mut random = ScriptedRandom::new(true)
            .with_count(9)
            .with_offset(-20.0)
            .with_pick(7);
        assert_eq!(random.between(1, 3), 3);
        assert_eq!(random.uniform(-5.0, 5.0), -5.0);
        assert_eq!(random.weighted(&[80, 15, 5]), 2);
    }
}
