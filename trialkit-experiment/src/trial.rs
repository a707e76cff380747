use rand::Rng;
use rand::seq::SliceRandom;
use std::time::Duration;
use trialkit_core::{Trial, TrialState};

/// Trial currently being presented.
#[derive(Debug, Clone)]
pub struct ActiveTrial {
    pub trial: Trial,
    pub state: TrialState,
    pub timestamps: TrialTimestamps,
}

#[derive(Debug, Clone, Default)]
pub struct TrialTimestamps {
    pub start: Duration,
    pub stimulus_start: Option<Duration>,
    pub response: Option<Duration>,
}

/// Concatenates `trials_per_class` independently shuffled permutations of
/// `classes`. Every aligned block of `classes.len()` trials contains each
/// class exactly once.
pub fn blockwise_order<R: Rng + ?Sized>(
    classes: &[String],
    trials_per_class: usize,
    rng: &mut R,
) -> Vec<Trial> {
    let mut order = Vec::with_capacity(classes.len() * trials_per_class);
    let mut block: Vec<&String> = classes.iter().collect();
    for _ in 0..trials_per_class {
        block.shuffle(rng);
        for label in &block {
            order.push(Trial {
                index: order.len(),
                label: (*label).clone(),
            });
        }
    }
    order
}

/// Uniform inter-trial interval in `[min, max]` seconds.
pub fn sample_iti<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    rng.random_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn every_class_appears_trials_per_class_times() {
        let mut rng = StdRng::seed_from_u64(7);
        for k in 1..6 {
            let classes: Vec<String> = (0..k).map(|i| format!("c{i}")).collect();
            for n in 1..5 {
                let order = blockwise_order(&classes, n, &mut rng);
                assert_eq!(order.len(), k * n);

                let mut counts: HashMap<&str, usize> = HashMap::new();
                for trial in &order {
                    *counts.entry(trial.label.as_str()).or_default() += 1;
                }
                assert_eq!(counts.len(), k);
                assert!(counts.values().all(|&c| c == n));
            }
        }
    }

    #[test]
    fn each_aligned_block_is_a_permutation() {
        let classes = labels(&["up", "down", "left", "right"]);
        let mut rng = StdRng::seed_from_u64(42);
        let order = blockwise_order(&classes, 25, &mut rng);

        let mut sorted_classes = classes.clone();
        sorted_classes.sort();
        for block in order.chunks(classes.len()) {
            let mut seen: Vec<String> = block.iter().map(|t| t.label.clone()).collect();
            seen.sort();
            assert_eq!(seen, sorted_classes);
        }
    }

    #[test]
    fn indices_follow_schedule_position() {
        let mut rng = StdRng::seed_from_u64(1);
        let order = blockwise_order(&labels(&["A", "B", "C"]), 3, &mut rng);
        for (pos, trial) in order.iter().enumerate() {
            assert_eq!(trial.index, pos);
        }
    }

    #[test]
    fn seeded_sources_reproduce_order() {
        let classes = labels(&["A", "B", "C", "D"]);
        let a = blockwise_order(&classes, 5, &mut StdRng::seed_from_u64(99));
        let b = blockwise_order(&classes, 5, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn iti_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for (min, max) in [(0.0, 0.0), (0.5, 1.5), (2.0, 2.0), (0.0, 10.0)] {
            for _ in 0..500 {
                let iti = sample_iti(&mut rng, min, max);
                assert!((min..=max).contains(&iti), "{iti} outside [{min}, {max}]");
            }
        }
    }
}
