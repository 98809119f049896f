//! The duplicate guard: the single gate deciding which worker may evaluate
//! a configuration.

use dashmap::DashSet;
use std::collections::HashMap;
use sweep_types::{ConfigKey, Configuration, Trial, TrialState};

/// Set of claimed configurations, keyed canonically.
///
/// A configuration is claimed while its latest trial is pending or running,
/// and forever once any of its trials succeeded. [`DuplicateGuard::claim`]
/// is an atomic test-and-insert, so of any number of concurrent claimers of
/// one configuration exactly one wins.
#[derive(Debug, Default)]
pub struct DuplicateGuard {
    claimed: DashSet<ConfigKey>,
}

impl DuplicateGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the claimed set from recorded trials (in append order).
    pub fn from_trials(trials: &[Trial]) -> Self {
        let mut latest: HashMap<ConfigKey, TrialState> = HashMap::new();
        let guard = Self::new();
        for trial in trials {
            let key = trial.configuration.key();
            if trial.state == TrialState::Succeeded {
                guard.claimed.insert(key.clone());
            }
            latest.insert(key, trial.state);
        }
        for (key, state) in latest {
            if state.is_active() {
                guard.claimed.insert(key);
            }
        }
        guard
    }

    /// Claim `configuration`; `false` means someone already holds it.
    pub fn claim(&self, configuration: &Configuration) -> bool {
        self.claimed.insert(configuration.key())
    }

    /// Give up a claim after a failed evaluation so the configuration can
    /// be retried later.
    pub fn release(&self, configuration: &Configuration) {
        self.claimed.remove(&configuration.key());
    }

    pub fn is_claimed(&self, configuration: &Configuration) -> bool {
        self.claimed.contains(&configuration.key())
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use sweep_types::{FailureKind, TrialFailure, TrialUpdate};

    fn config() -> Configuration {
        Configuration::new()
            .with("universe", "TOP3000")
            .with("delay", 1i64)
    }

    #[test]
    fn construction_order_does_not_matter() {
        let guard = DuplicateGuard::new();
        let a = Configuration::new()
            .with("delay", 1i64)
            .with("universe", "TOP3000");
        assert!(guard.claim(&config()));
        assert!(!guard.claim(&a));
        assert!(guard.is_claimed(&a));
    }

    #[test]
    fn release_makes_configuration_claimable_again() {
        let guard = DuplicateGuard::new();
        assert!(guard.claim(&config()));
        guard.release(&config());
        assert!(!guard.is_claimed(&config()));
        assert!(guard.claim(&config()));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn exactly_one_concurrent_claimer_wins() {
        const CLAIMERS: usize = 16;
        let guard = Arc::new(DuplicateGuard::new());
        let barrier = Arc::new(Barrier::new(CLAIMERS));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..CLAIMERS)
            .map(|_| {
                let guard = guard.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    if guard.claim(&config()) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    fn trial(id: u64, configuration: Configuration, path: &[TrialUpdate]) -> Trial {
        let mut t = Trial::new(id, configuration, Utc::now());
        for update in path {
            t.apply(update.clone(), Utc::now()).unwrap();
        }
        t
    }

    #[test]
    fn rebuilds_from_trials() {
        let failed = TrialUpdate::failed(TrialFailure::new(FailureKind::Permanent, "bad"));
        let a = config();
        let b = config().with("maxTrade", "ON");
        let c = config().with("maxTrade", "OFF");
        let d = config().with("decay", 4i64);

        let trials = vec![
            // a: failed, then retried and still running
            trial(0, a.clone(), &[TrialUpdate::running(), failed.clone()]),
            trial(1, a.clone(), &[TrialUpdate::running()]),
            // b: only failed
            trial(2, b.clone(), &[TrialUpdate::running(), failed]),
            // c: pruned
            trial(3, c.clone(), &[TrialUpdate::pruned()]),
            // d: pending
            trial(4, d.clone(), &[]),
        ];

        let guard = DuplicateGuard::from_trials(&trials);
        assert!(guard.is_claimed(&a));
        assert!(!guard.is_claimed(&b));
        assert!(!guard.is_claimed(&c));
        assert!(guard.is_claimed(&d));
        assert_eq!(guard.len(), 2);
    }
}
