//! Backend selection strategies.
//!
//! [`plan`] turns the registered backends into an attempt order: the
//! strategy's pick first, then the remaining eligible backends in fallback
//! chain order. Draining backends are never planned. Health-based and
//! primary-fallback selection also skip unhealthy backends.

use rand::Rng;

use crate::config::SelectionStrategy;

/// Selection inputs for one backend, listed in fallback chain order.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub healthy: bool,
    pub draining: bool,
    pub in_flight: usize,
    pub avg_latency_ms: f64,
    pub weight: u32,
}

pub fn plan<R: Rng + ?Sized>(
    strategy: SelectionStrategy,
    candidates: &[Candidate],
    round_robin: usize,
    rng: &mut R,
) -> Vec<usize> {
    let health_gated = matches!(
        strategy,
        SelectionStrategy::HealthBased | SelectionStrategy::PrimaryFallback
    );
    let eligible: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.draining && (c.healthy || !health_gated))
        .map(|(i, _)| i)
        .collect();
    if eligible.is_empty() {
        return eligible;
    }

    let first = match strategy {
        SelectionStrategy::PrimaryFallback => eligible[0],
        SelectionStrategy::RoundRobin => eligible[round_robin % eligible.len()],
        SelectionStrategy::LeastConnections => min_by(&eligible, candidates, |c| c.in_flight as f64),
        SelectionStrategy::PerformanceBased | SelectionStrategy::HealthBased => {
            min_by(&eligible, candidates, |c| c.avg_latency_ms)
        }
        SelectionStrategy::WeightedRandom => weighted(&eligible, candidates, rng),
    };

    let mut order = Vec::with_capacity(eligible.len());
    order.push(first);
    order.extend(eligible.into_iter().filter(|i| *i != first));
    order
}

/// Lowest key wins; ties keep chain order.
fn min_by(eligible: &[usize], candidates: &[Candidate], key: impl Fn(&Candidate) -> f64) -> usize {
    let mut best = eligible[0];
    for &i in &eligible[1..] {
        if key(&candidates[i]) < key(&candidates[best]) {
            best = i;
        }
    }
    best
}

/// Pick proportionally to weight. All-zero weights fall back to uniform.
fn weighted<R: Rng + ?Sized>(eligible: &[usize], candidates: &[Candidate], rng: &mut R) -> usize {
    let total: u64 = eligible.iter().map(|&i| u64::from(candidates[i].weight)).sum();
    if total == 0 {
        return eligible[rng.gen_range(0..eligible.len())];
    }
    let mut point = rng.gen_range(0..total);
    for &i in eligible {
        let weight = u64::from(candidates[i].weight);
        if point < weight {
            return i;
        }
        point -= weight;
    }
    eligible[eligible.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(name: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            healthy: true,
            draining: false,
            in_flight: 0,
            avg_latency_ms: 0.0,
            weight: 1,
        }
    }

    fn names(order: &[usize], candidates: &[Candidate]) -> Vec<String> {
        order.iter().map(|&i| candidates[i].name.clone()).collect()
    }

    #[test]
    fn primary_fallback_skips_unhealthy_and_draining() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut candidates = vec![candidate("a"), candidate("b"), candidate("c")];
        candidates[0].healthy = false;
        candidates[1].draining = true;
        let order = plan(SelectionStrategy::PrimaryFallback, &candidates, 0, &mut rng);
        assert_eq!(names(&order, &candidates), vec!["c"]);

        candidates[2].healthy = false;
        assert!(plan(SelectionStrategy::PrimaryFallback, &candidates, 0, &mut rng).is_empty());
    }

    #[test]
    fn round_robin_rotates_and_keeps_unhealthy() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut candidates = vec![candidate("a"), candidate("b")];
        candidates[1].healthy = false;
        let first: Vec<String> = (0..3)
            .map(|n| {
                let order = plan(SelectionStrategy::RoundRobin, &candidates, n, &mut rng);
                candidates[order[0]].name.clone()
            })
            .collect();
        assert_eq!(first, vec!["a", "b", "a"]);
    }

    #[test]
    fn least_connections_and_performance_pick_minimum() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut candidates = vec![candidate("a"), candidate("b"), candidate("c")];
        candidates[0].in_flight = 3;
        candidates[1].in_flight = 1;
        candidates[2].in_flight = 1;
        candidates[0].avg_latency_ms = 2.0;
        candidates[1].avg_latency_ms = 9.0;
        candidates[2].avg_latency_ms = 4.0;

        let order = plan(SelectionStrategy::LeastConnections, &candidates, 0, &mut rng);
        assert_eq!(names(&order, &candidates), vec!["b", "a", "c"]);
        let order = plan(SelectionStrategy::PerformanceBased, &candidates, 0, &mut rng);
        assert_eq!(names(&order, &candidates), vec!["a", "b", "c"]);

        candidates[0].healthy = false;
        let order = plan(SelectionStrategy::HealthBased, &candidates, 0, &mut rng);
        assert_eq!(names(&order, &candidates), vec!["c", "b"]);
    }

    #[test]
    fn weighted_random_never_picks_zero_weight() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut candidates = vec![candidate("a"), candidate("b")];
        candidates[0].weight = 0;
        candidates[1].weight = 5;
        for _ in 0..50 {
            let order = plan(SelectionStrategy::WeightedRandom, &candidates, 0, &mut rng);
            assert_eq!(candidates[order[0]].name, "b");
            assert_eq!(order.len(), 2);
        }
    }
}
