//! Train/validation splitting

use rand::rng;
use rand::seq::SliceRandom;
use tracing::debug;

/// Shuffle `dataset` and split off the last `validation_split` fraction.
///
/// The training partition gets `floor(len * (1 - validation_split))`
/// examples. Every call draws a fresh permutation; no seed is kept.
pub fn random_split<E>(mut dataset: Vec<E>, validation_split: f64) -> (Vec<E>, Vec<E>) {
    let len_train = ((dataset.len() as f64) * (1.0 - validation_split)) as usize;
    let len_train = len_train.min(dataset.len());

    dataset.shuffle(&mut rng());
    let valid = dataset.split_off(len_train);
    debug!("random_split: {} train, {} valid", dataset.len(), valid.len());

    (dataset, valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use test_case::test_case;

    #[test_case(100, 0.15, 85, 15 ; "default split")]
    #[test_case(20, 0.15, 17, 3 ; "small dataset")]
    #[test_case(10, 0.5, 5, 5 ; "half")]
    #[test_case(1, 0.15, 0, 1 ; "single example")]
    fn test_split_sizes(total: usize, split: f64, train: usize, valid: usize) {
        let (t, v) = random_split((0..total).collect::<Vec<_>>(), split);
        assert_eq!(t.len(), train);
        assert_eq!(v.len(), valid);
    }

    #[test]
    fn test_split_is_a_partition() {
        let (train, valid) = random_split((0..50).collect::<Vec<_>>(), 0.2);
        let all: HashSet<_> = train.iter().chain(valid.iter()).copied().collect();
        assert_eq!(all.len(), 50);
    }
}
