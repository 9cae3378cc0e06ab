//! Self test of the timing apparatus: the same fenced, counter timed load as
//! a probe, always on one scratch word.

use crate::{Error, Result};
use cache_utils::perf::CycleCounter;
use cache_utils::TimingPrimitives;
use std::fmt;

/// Samples above this many cycles most likely spanned a reschedule.
pub const RESCHEDULE_THRESHOLD: u32 = 1000;

pub const DEFAULT_ITERATIONS: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkStats {
    pub samples: usize,
    /// Element `n / 2` of the sorted samples.
    pub median: u32,
    pub mean: f64,
    /// Squared deviation of the largest sample only, over `n - 1`.
    pub variance: f64,
    pub over_threshold: usize,
    pub off_median: usize,
}

impl BenchmarkStats {
    pub fn from_samples(mut samples: Vec<u32>) -> Option<BenchmarkStats> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let n = samples.len();
        let median = samples[n / 2];
        let sum: u64 = samples.iter().map(|&s| s as u64).sum();
        let mean = sum as f64 / n as f64;

        // Only the last visited sample contributes.
        let last = samples[n - 1] as f64;
        let variance = (last - mean).powi(2) / (n as f64 - 1.0);

        let over_threshold = samples
            .iter()
            .filter(|&&s| s > RESCHEDULE_THRESHOLD)
            .count();
        let off_median = samples.iter().filter(|&&s| s != median).count();

        Some(BenchmarkStats {
            samples: n,
            median,
            mean,
            variance,
            over_threshold,
            off_median,
        })
    }

    pub fn off_median_ratio(&self) -> f64 {
        self.off_median as f64 / self.samples as f64
    }
}

impl fmt::Display for BenchmarkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "median: {}", self.median)?;
        writeln!(f, "arithmetic mean: {:.6}", self.mean)?;
        writeln!(f, "empirical variance: {:.6}", self.variance)?;
        writeln!(
            f,
            "{} values are bigger than {} (probably reschedules)",
            self.over_threshold, RESCHEDULE_THRESHOLD
        )?;
        write!(
            f,
            "{} values differ from the median(%{:.6})",
            self.off_median,
            self.off_median_ratio()
        )
    }
}

/// Times `iterations` loads of one scratch word.
pub fn sample<P: TimingPrimitives>(primitives: &P, iterations: usize) -> Vec<u32> {
    let scratch = [0u64; 1];
    let mut samples = vec![0u32; iterations];
    for slot in samples.iter_mut() {
        primitives.serialize();
        let start = primitives.read_cycle_counter_low32();
        unsafe {
            primitives.fenced_read(scratch.as_ptr() as *const u8);
        }
        let end = primitives.read_cycle_counter_low32();
        unsafe {
            primitives.nontemporal_store32(slot, end.wrapping_sub(start));
        }
        primitives.serialize();
    }
    samples
}

/// Samples, stops `counter`, then summarizes.
pub fn run_benchmark<P: TimingPrimitives, C: CycleCounter>(
    primitives: &P,
    iterations: usize,
    counter: C,
) -> Result<BenchmarkStats> {
    let samples = sample(primitives, iterations);
    counter.disable()?;
    BenchmarkStats::from_samples(samples).ok_or(Error::NoSamples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCounter, RecordingPrimitives};

    #[test]
    fn constant_samples() {
        let stats = BenchmarkStats::from_samples(vec![100; 1000]).unwrap();
        assert_eq!(stats.median, 100);
        assert_eq!(stats.mean, 100.0);
        assert_eq!(stats.variance, 0.0);
        assert_eq!(stats.over_threshold, 0);
        assert_eq!(stats.off_median, 0);
    }

    #[test]
    fn variance_only_sees_the_largest_sample() {
        // sorted: 10 20 30 40, mean 25, last deviation 15.
        let stats = BenchmarkStats::from_samples(vec![40, 10, 30, 20]).unwrap();
        assert_eq!(stats.median, 30);
        assert_eq!(stats.mean, 25.0);
        assert_eq!(stats.variance, 225.0 / 3.0);
    }

    #[test]
    fn counts_reschedules_and_median_mismatches() {
        let mut samples = vec![80; 7];
        samples.extend([1001, 5000, 1000]);
        let stats = BenchmarkStats::from_samples(samples).unwrap();
        assert_eq!(stats.median, 80);
        assert_eq!(stats.over_threshold, 2);
        assert_eq!(stats.off_median, 3);
        assert!((stats.off_median_ratio() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn empty_has_no_stats() {
        assert!(BenchmarkStats::from_samples(Vec::new()).is_none());
    }

    #[test]
    fn report_lines() {
        let stats = BenchmarkStats::from_samples(vec![100; 4]).unwrap();
        let report = stats.to_string();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(
            lines,
            [
                "median: 100",
                "arithmetic mean: 100.000000",
                "empirical variance: 0.000000",
                "0 values are bigger than 1000 (probably reschedules)",
                "0 values differ from the median(%0.000000)",
            ]
        );
    }

    #[test]
    fn benchmark_times_one_location_and_stops_the_counter() {
        let primitives = RecordingPrimitives::default();
        let counter = MockCounter::default();
        let stats = run_benchmark(&primitives, 50, counter.clone()).unwrap();

        let reads = primitives.reads.borrow();
        assert_eq!(reads.len(), 50);
        assert!(reads.iter().all(|&a| a == reads[0]));
        // Read k costs k + 1 cycles: 2..=51.
        assert_eq!(stats.median, 27);
        assert_eq!(stats.samples, 50);
        assert_eq!(counter.disables.get(), 1);
    }

    #[test]
    fn zero_iterations_is_an_error() {
        let counter = MockCounter::default();
        assert!(matches!(
            run_benchmark(&RecordingPrimitives::default(), 0, counter.clone()),
            Err(Error::NoSamples)
        ));
        assert_eq!(counter.disables.get(), 1);
    }
}
