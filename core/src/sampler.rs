//! Priority-weighted fetch ordering.
//!
//! Each fetch tick, the worker needs an order in which to try its
//! registered job types so that higher-priority types are tried (and thus
//! win ties for available concurrency) more often, while every type still
//! gets a turn — a job type at priority 1 must not starve forever behind
//! one at priority 100. `weighted_order` draws a full priority-weighted
//! permutation without replacement, using the same approach as
//! `rand`'s reservoir/weighted-index sampling rather than a hand-rolled
//! cumulative-sum walk.

use rand::distributions::{Distribution, WeightedIndex};
use rand::thread_rng;

/// Returns `candidates` permuted so that, on average, higher-weight names
/// appear earlier. A name with weight 0 (a paused job type) is only ever
/// placed after every positively-weighted name.
pub fn weighted_order(mut candidates: Vec<(String, u32)>) -> Vec<String> {
    let mut order = Vec::with_capacity(candidates.len());
    let mut rng = thread_rng();

    while !candidates.is_empty() {
        let weights: Vec<u32> = candidates.iter().map(|(_, w)| *w).collect();
        if weights.iter().all(|w| *w == 0) {
            order.extend(candidates.drain(..).map(|(name, _)| name));
            break;
        }

        let dist = WeightedIndex::new(&weights).expect("at least one positive weight checked above");
        let idx = dist.sample(&mut rng);
        let (name, _) = candidates.remove(idx);
        order.push(name);
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn empty_input_yields_empty_order() {
        assert!(weighted_order(Vec::new()).is_empty());
    }

    #[test]
    fn single_candidate_is_returned_alone() {
        let order = weighted_order(vec![("only".into(), 5)]);
        assert_eq!(order, vec!["only".to_string()]);
    }

    #[test]
    fn order_is_a_permutation_of_the_input() {
        let input = vec![("a".into(), 10), ("b".into(), 0), ("c".into(), 3)];
        let names: HashSet<_> = input.iter().map(|(n, _)| n.clone()).collect();
        let order = weighted_order(input);
        let order_set: HashSet<_> = order.into_iter().collect();
        assert_eq!(names, order_set);
    }

    #[test]
    fn zero_weight_candidates_never_precede_positive_weight_ones() {
        for _ in 0..50 {
            let input = vec![("paused_a".into(), 0), ("paused_b".into(), 0), ("active".into(), 7)];
            let order = weighted_order(input);
            assert_eq!(order[0], "active", "the only positively-weighted type should always be drawn first");
        }
    }
}
