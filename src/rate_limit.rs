//! Rate limits for calls to the LLM API.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
    Hour,
}

impl RateLimitPeriod {
    /// How long is this period?
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
            RateLimitPeriod::Hour => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self {
            RateLimitPeriod::Second => "s",
            RateLimitPeriod::Minute => "m",
            RateLimitPeriod::Hour => "h",
        };
        f.write_str(suffix)
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            "h" => Ok(RateLimitPeriod::Hour),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A request budget, written as `10/s`, `60/m` or `1000/h`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period.
    pub max_requests: usize,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Build a [`RateLimiter`] that enforces this limit.
    ///
    /// The bucket starts full, so a fresh process may burst up to
    /// `max_requests` before it starts waiting.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(self.max_requests)
            .max(self.max_requests)
            .interval(self.per_period.to_duration())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<Self> {
            let (count, period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected COUNT/PERIOD"))?;
            let max_requests = count.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("rate limit must allow at least one request"));
            }
            let per_period = period.trim().parse::<RateLimitPeriod>()?;
            Ok(Self {
                max_requests,
                per_period,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_periods() {
        let cases = [
            ("10/s", 10, RateLimitPeriod::Second),
            ("60/m", 60, RateLimitPeriod::Minute),
            ("1000/h", 1000, RateLimitPeriod::Hour),
        ];
        for (input, max_requests, per_period) in cases {
            let limit = RateLimit::from_str(input).unwrap();
            assert_eq!(limit.max_requests, max_requests);
            assert_eq!(limit.per_period, per_period);
            assert_eq!(limit.to_string(), input);
        }
    }

    #[test]
    fn rejects_bad_limits() {
        for input in ["10/d", "ten/s", "10", "0/s", ""] {
            assert!(RateLimit::from_str(input).is_err(), "accepted {input:?}");
        }
    }
}
