use std::time::Duration;

use crate::geo::planar_displacement_m;
use crate::models::location::LocationSample;

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub min_interval: Duration,
    pub min_displacement_m: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            min_displacement_m: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    TooSoon,
    TooClose,
}

/// Throttles a route's sample stream. Both gates measure against the same
/// last accepted sample; a sample must clear both.
#[derive(Debug)]
pub struct SampleFilter {
    config: FilterConfig,
    last_accepted: Option<LocationSample>,
}

impl SampleFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            last_accepted: None,
        }
    }

    pub fn evaluate(&mut self, sample: &LocationSample) -> Verdict {
        let verdict = match &self.last_accepted {
            None => Verdict::Accepted,
            Some(last) => {
                // Out-of-order timestamps count as zero elapsed.
                let elapsed = sample
                    .timestamp
                    .signed_duration_since(last.timestamp)
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                if elapsed < self.config.min_interval {
                    Verdict::TooSoon
                } else if planar_displacement_m(&last.point(), &sample.point())
                    <= self.config.min_displacement_m
                {
                    Verdict::TooClose
                } else {
                    Verdict::Accepted
                }
            }
        };

        if verdict == Verdict::Accepted {
            self.last_accepted = Some(sample.clone());
        }
        verdict
    }

    pub fn accept(&mut self, sample: &LocationSample) -> bool {
        self.evaluate(sample) == Verdict::Accepted
    }

    pub fn reset(&mut self) {
        self.last_accepted = None;
    }

    pub fn last_accepted(&self) -> Option<&LocationSample> {
        self.last_accepted.as_ref()
    }
}
