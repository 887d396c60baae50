//! Token sampling: greedy at temperature zero, otherwise softmax with
//! temperature followed by top-p nucleus truncation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct Sampler {
    temperature: f32,
    topp: f32,
    rng: StdRng,
}

/// Numerically stable in-place softmax.
pub fn softmax(values: &mut [f32]) {
    let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best as u32
}

impl Sampler {
    pub fn new(temperature: f32, topp: f32, seed: u64) -> Self {
        Sampler {
            temperature,
            topp,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        if self.temperature == 0.0 {
            return argmax(logits);
        }

        let mut probs: Vec<f32> = logits.iter().map(|&l| l / self.temperature).collect();
        softmax(&mut probs);

        if self.topp <= 0.0 || self.topp >= 1.0 {
            return self.sample_from(&probs);
        }

        // Nucleus: keep the smallest prefix of the sorted distribution
        // whose mass reaches top-p, renormalize, sample within it.
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| {
            probs[b]
                .partial_cmp(&probs[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut cumulative = 0.0f32;
        let mut cut = order.len();
        for (rank, &i) in order.iter().enumerate() {
            cumulative += probs[i];
            if cumulative >= self.topp {
                cut = rank + 1;
                break;
            }
        }
        let nucleus = &order[..cut];
        let mass: f32 = nucleus.iter().map(|&i| probs[i]).sum();
        let mut threshold = self.rng.gen::<f32>() * mass;
        for &i in nucleus {
            threshold -= probs[i];
            if threshold <= 0.0 {
                return i as u32;
            }
        }
        nucleus[nucleus.len() - 1] as u32
    }

    fn sample_from(&mut self, probs: &[f32]) -> u32 {
        let mut threshold = self.rng.gen::<f32>();
        for (i, &p) in probs.iter().enumerate() {
            threshold -= p;
            if threshold <= 0.0 {
                return i as u32;
            }
        }
        probs.len() as u32 - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_temperature_is_argmax() {
        let mut sampler = Sampler::new(0.0, 0.9, 42);
        let logits = [0.1, 3.0, -1.0, 2.9];
        for _ in 0..8 {
            assert_eq!(sampler.sample(&logits), 1);
        }
    }

    #[test]
    fn test_seeded_sampling_is_deterministic() {
        let logits = [1.0, 1.1, 0.9, 1.05];
        let a: Vec<u32> = {
            let mut s = Sampler::new(0.8, 0.9, 7);
            (0..16).map(|_| s.sample(&logits)).collect()
        };
        let b: Vec<u32> = {
            let mut s = Sampler::new(0.8, 0.9, 7);
            (0..16).map(|_| s.sample(&logits)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_topp_excludes_tail() {
        // One token carries almost all mass; a tight nucleus must
        // always pick it.
        let mut sampler = Sampler::new(1.0, 0.5, 3);
        let logits = [10.0, 0.0, 0.0, 0.0];
        for _ in 0..16 {
            assert_eq!(sampler.sample(&logits), 0);
        }
    }
}
