use conduit_core::cloud::{ServiceChooser, ServiceDefinition};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates through the candidates.
///
/// The rotation index is a single atomic counter, so concurrent callers each
/// get a distinct position.
#[derive(Debug, Default)]
pub struct RoundRobinServiceChooser {
    next: AtomicUsize,
}

impl RoundRobinServiceChooser {
    /// Start the rotation at the first candidate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }
}

impl ServiceChooser for RoundRobinServiceChooser {
    fn choose(&self, services: &[ServiceDefinition]) -> Option<ServiceDefinition> {
        if services.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % services.len();
        services.get(index).cloned()
    }
}

/// Picks a candidate uniformly at random.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomServiceChooser;

impl ServiceChooser for RandomServiceChooser {
    fn choose(&self, services: &[ServiceDefinition]) -> Option<ServiceDefinition> {
        if services.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..services.len());
        services.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn candidates(count: usize) -> Vec<ServiceDefinition> {
        (0..count)
            .map(|i| ServiceDefinition::new("svc", "127.0.0.1", 8000 + u16::try_from(i).unwrap()))
            .collect()
    }

    #[test]
    fn test_empty_list_yields_none() {
        assert!(RoundRobinServiceChooser::new().choose(&[]).is_none());
        assert!(RandomServiceChooser.choose(&[]).is_none());
    }

    #[test]
    fn test_round_robin_wraps_around() {
        let chooser = RoundRobinServiceChooser::new();
        let services = candidates(2);

        let ports: Vec<u16> = (0..4)
            .map(|_| chooser.choose(&services).unwrap().port())
            .collect();

        assert_eq!(ports, vec![8000, 8001, 8000, 8001]);
    }

    #[test]
    fn test_random_stays_within_candidates() {
        let services = candidates(3);
        for _ in 0..50 {
            let chosen = RandomServiceChooser.choose(&services).unwrap();
            assert!(services.contains(&chosen));
        }
    }

    proptest! {
        #[test]
        fn prop_round_robin_cycle_visits_each_candidate_once(count in 1usize..16, warmup in 0usize..40) {
            let chooser = RoundRobinServiceChooser::new();
            let services = candidates(count);
            for _ in 0..warmup {
                chooser.choose(&services);
            }

            let visited: HashSet<u16> = (0..count)
                .map(|_| chooser.choose(&services).unwrap().port())
                .collect();

            prop_assert_eq!(visited.len(), count);
        }
    }
}
