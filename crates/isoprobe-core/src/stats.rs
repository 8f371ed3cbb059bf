//! Latency sample statistics.
//!
//! Percentiles use the nearest-rank method over the sorted sample:
//! rank `ceil(p * n)`, 1-based. An empty sample yields zero everywhere
//! rather than an error, so a run with no commits still prints a report.

use std::time::Duration;

/// Nearest-rank percentile of a **sorted** sample. `p` in (0, 1].
#[must_use]
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Summary statistics over one run's per-attempt latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub sum: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub p999: Duration,
}

impl LatencySummary {
    /// Consume a sample pool and summarize it. Order is irrelevant.
    #[must_use]
    pub fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort_unstable();
        let count = samples.len();
        let sum: Duration = samples.iter().sum();
        let avg = if count == 0 {
            Duration::ZERO
        } else {
            sum / count as u32
        };
        Self {
            count,
            min: samples.first().copied().unwrap_or(Duration::ZERO),
            max: samples.last().copied().unwrap_or(Duration::ZERO),
            avg,
            sum,
            p50: percentile(&samples, 0.50),
            p95: percentile(&samples, 0.95),
            p99: percentile(&samples, 0.99),
            p999: percentile(&samples, 0.999),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn empty_sample_is_all_zero() {
        assert_eq!(percentile(&[], 0.99), Duration::ZERO);
        let summary = LatencySummary::from_samples(Vec::new());
        assert_eq!(summary.count, 0);
        assert_eq!(summary.max, Duration::ZERO);
        assert_eq!(summary.avg, Duration::ZERO);
    }

    #[test]
    fn nearest_rank_cases() {
        let sorted: Vec<Duration> = (1..=10).map(ms).collect();
        // rank(ceil(0.5 * 10)) = 5 -> 5ms
        assert_eq!(percentile(&sorted, 0.50), ms(5));
        // rank(ceil(0.95 * 10)) = 10 -> 10ms
        assert_eq!(percentile(&sorted, 0.95), ms(10));
        assert_eq!(percentile(&sorted, 1.0), ms(10));
        // single sample: every percentile is that sample
        assert_eq!(percentile(&[ms(7)], 0.01), ms(7));
        assert_eq!(percentile(&[ms(7)], 0.999), ms(7));
    }

    #[test]
    fn summary_over_known_sample() {
        let summary = LatencySummary::from_samples(vec![ms(4), ms(1), ms(3), ms(2)]);
        assert_eq!(summary.count, 4);
        assert_eq!(summary.min, ms(1));
        assert_eq!(summary.max, ms(4));
        assert_eq!(summary.sum, ms(10));
        assert_eq!(summary.avg, Duration::from_micros(2_500));
        assert_eq!(summary.p50, ms(2));
        assert_eq!(summary.p99, ms(4));
    }

    proptest! {
        #[test]
        fn percentile_is_a_sample_member_and_monotone(
            mut raw in prop::collection::vec(0_u64..10_000, 1..200),
            p_lo in 0.01_f64..0.5,
            p_hi in 0.5_f64..1.0,
        ) {
            raw.sort_unstable();
            let sorted: Vec<Duration> = raw.iter().copied().map(ms).collect();
            let lo = percentile(&sorted, p_lo);
            let hi = percentile(&sorted, p_hi);
            prop_assert!(sorted.contains(&lo));
            prop_assert!(sorted.contains(&hi));
            prop_assert!(lo <= hi);
        }
    }
}
