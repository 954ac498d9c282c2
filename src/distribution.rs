use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp};
use std::time::Duration;

use crate::config::{ArrivalPolicy, ConfigError};

/// Produces the pause before each request is released.
pub struct ArrivalPacer {
    pacing: Pacing,
    rng: StdRng,
}

enum Pacing {
    Immediate,
    Exponential { exp_dist: Exp<f64> },
}

impl ArrivalPacer {
    /// Create a pacer for the given policy.
    ///
    /// # Arguments
    /// * `policy` - Immediate release or Poisson arrivals at a fixed rate
    /// * `seed` - Seed for the inter-arrival sampler, so runs are reproducible
    ///
    /// Fails with [`ConfigError::InvalidRate`] for a rate that is not positive and finite.
    pub fn new(policy: ArrivalPolicy, seed: u64) -> Result<Self, ConfigError> {
        policy.check()?;
        let pacing = match policy {
            ArrivalPolicy::Immediate => Pacing::Immediate,
            // Poisson arrivals: inter-arrival times follow Exp(λ) with λ = rate.
            ArrivalPolicy::Poisson { rate } => {
                let exp_dist =
                    Exp::new(rate).map_err(|_| ConfigError::InvalidRate(rate.to_string()))?;
                Pacing::Exponential { exp_dist }
            }
        };

        Ok(Self {
            pacing,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Delay to wait before releasing the next request, `None` when it should go out right away.
    pub fn next_delay(&mut self) -> Option<Duration> {
        match &self.pacing {
            Pacing::Immediate => None,
            Pacing::Exponential { exp_dist } => {
                // Sample returns time in seconds
                let wait_secs = exp_dist.sample(&mut self.rng);
                // A draw from the far tail can exceed what a Duration holds.
                Some(Duration::try_from_secs_f64(wait_secs).unwrap_or(Duration::MAX))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.pacing {
            Pacing::Immediate => "Immediate",
            Pacing::Exponential { .. } => "Poisson",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_has_no_delay() {
        let mut pacer = ArrivalPacer::new(ArrivalPolicy::Immediate, 0).unwrap();
        for _ in 0..10 {
            assert_eq!(pacer.next_delay(), None);
        }
        assert_eq!(pacer.name(), "Immediate");
    }

    #[test]
    fn test_poisson_mean_and_variability() {
        let mut pacer = ArrivalPacer::new(ArrivalPolicy::Poisson { rate: 10.0 }, 1).unwrap();
        assert_eq!(pacer.name(), "Poisson");

        let delays: Vec<Duration> = (0..2000).map(|_| pacer.next_delay().unwrap()).collect();

        let all_same = delays.iter().all(|d| *d == delays[0]);
        assert!(!all_same, "Poisson pacing should produce variable delays");

        // Mean of Exp(10) is 0.1s; 2000 samples keep the error well under 0.02s
        let avg_secs: f64 =
            delays.iter().map(|d| d.as_secs_f64()).sum::<f64>() / delays.len() as f64;
        assert!(
            (avg_secs - 0.1).abs() < 0.02,
            "Average delay should be close to 1/rate (0.1s), got {}",
            avg_secs
        );
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let policy = ArrivalPolicy::Poisson { rate: 3.0 };
        let mut a = ArrivalPacer::new(policy, 99).unwrap();
        let mut b = ArrivalPacer::new(policy, 99).unwrap();
        let mut c = ArrivalPacer::new(policy, 100).unwrap();

        let first: Vec<_> = (0..20).map(|_| a.next_delay()).collect();
        let second: Vec<_> = (0..20).map(|_| b.next_delay()).collect();
        let other: Vec<_> = (0..20).map(|_| c.next_delay()).collect();

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_invalid_rate_is_rejected() {
        for rate in [0.0, -1.0, f64::NAN, f64::NEG_INFINITY, f64::INFINITY, 1e-30] {
            assert!(
                matches!(
                    ArrivalPacer::new(ArrivalPolicy::Poisson { rate }, 0),
                    Err(ConfigError::InvalidRate(_))
                ),
                "rate {rate} should be rejected"
            );
        }
    }

    #[test]
    fn test_slow_rate_delays_stay_finite() {
        // Smallest accepted rates still draw tails past Duration::MAX.
        let mut pacer = ArrivalPacer::new(ArrivalPolicy::Poisson { rate: 1e-19 }, 3).unwrap();
        for _ in 0..1000 {
            let delay = pacer.next_delay().unwrap();
            assert!(delay > Duration::ZERO);
        }
    }
}
