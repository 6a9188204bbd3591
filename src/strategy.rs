//! Domain name selection strategies
//!
//! Every outbound query picks the domain it is issued under from the
//! configured list. Round-robin cycles deterministically; random draws
//! uniformly on each call.

use crate::config::DomainStrategy;
use rand::seq::SliceRandom;

/// Picker over the configured domain list.
///
/// Chosen once at startup and invoked by the codec on every query.
#[derive(Debug)]
pub enum DomainPicker {
    RoundRobin { domains: Vec<String>, next: usize },
    Random { domains: Vec<String> },
}

impl DomainPicker {
    /// Create a picker for the given strategy.
    ///
    /// The domain list must be non-empty; this is enforced by
    /// [`crate::SessionConfig::validate`] before a picker is built.
    pub fn new(strategy: DomainStrategy, domains: Vec<String>) -> Self {
        debug_assert!(!domains.is_empty());
        match strategy {
            DomainStrategy::RoundRobin => DomainPicker::RoundRobin { domains, next: 0 },
            DomainStrategy::Random => DomainPicker::Random { domains },
        }
    }

    /// Select the next domain name to query under.
    pub fn next(&mut self) -> String {
        match self {
            DomainPicker::RoundRobin { domains, next } => {
                let picked = domains[*next].clone();
                *next = (*next + 1) % domains.len();
                picked
            }
            DomainPicker::Random { domains } => {
                let mut rng = rand::thread_rng();
                domains
                    .choose(&mut rng)
                    .expect("domain list is never empty")
                    .clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_alternates_from_first() {
        let mut picker = DomainPicker::new(
            DomainStrategy::RoundRobin,
            vec!["a.example.com".to_string(), "b.example.com".to_string()],
        );

        assert_eq!(picker.next(), "a.example.com");
        assert_eq!(picker.next(), "b.example.com");
        assert_eq!(picker.next(), "a.example.com");
        assert_eq!(picker.next(), "b.example.com");
    }

    #[test]
    fn test_round_robin_single_domain() {
        let mut picker = DomainPicker::new(
            DomainStrategy::RoundRobin,
            vec!["only.example.com".to_string()],
        );

        assert_eq!(picker.next(), "only.example.com");
        assert_eq!(picker.next(), "only.example.com");
    }

    #[test]
    fn test_random_stays_within_set() {
        let domains = vec!["a.example.com".to_string(), "b.example.com".to_string()];
        let mut picker = DomainPicker::new(DomainStrategy::Random, domains.clone());

        for _ in 0..64 {
            assert!(domains.contains(&picker.next()));
        }
    }
}
