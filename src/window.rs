use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use itertools::Itertools;

/// One provider-draw observation.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub const fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Time-weighted share of the window spent below a threshold.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Ratio {
    pub threshold: f64,
    pub below_ratio: f64,
}

/// The offered sample does not advance the window's clock.
///
/// The window is left untouched; the caller should drop the sample as stale.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("sample at {offered} is not after the last stored sample at {last}")]
pub struct OrderingError {
    pub last: DateTime<Utc>,
    pub offered: DateTime<Utc>,
}

/// The window does not hold enough samples for the requested statistic.
///
/// The right reaction is to skip the decision for this cycle, not to assume zero.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("{len} sample(s) in the window, at least 2 are required")]
pub struct InsufficientDataError {
    pub len: usize,
}

/// Time-bounded buffer of samples in strictly ascending timestamp order.
///
/// After every mutation the span between the oldest and the newest sample
/// is strictly less than the configured duration.
#[must_use]
pub struct RollingWindow {
    duration: TimeDelta,
    samples: VecDeque<Sample>,
}

impl RollingWindow {
    pub const fn new(duration: TimeDelta) -> Self {
        Self { duration, samples: VecDeque::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at the 0-based index, negative indexes counting from the end.
    ///
    /// # Panics
    ///
    /// Panics when the index is out of range – that is a caller bug.
    pub fn get(&self, index: isize) -> &Sample {
        let index = if index >= 0 {
            index.unsigned_abs()
        } else {
            self.samples
                .len()
                .checked_sub(index.unsigned_abs())
                .expect("the negative index must not reach before the oldest sample")
        };
        &self.samples[index]
    }

    /// Append the sample and trim the buffer back under the window duration.
    ///
    /// # Errors
    ///
    /// Fails when the sample's timestamp is not strictly greater than that of
    /// the last stored sample, leaving the window unchanged.
    pub fn add(&mut self, sample: Sample) -> Result<(), OrderingError> {
        if let Some(last) = self.samples.back()
            && sample.timestamp <= last.timestamp
        {
            return Err(OrderingError { last: last.timestamp, offered: sample.timestamp });
        }
        let newest = sample.timestamp;
        self.samples.push_back(sample);
        while self
            .samples
            .front()
            .is_some_and(|oldest| newest - oldest.timestamp >= self.duration)
        {
            self.samples.pop_front();
        }
        Ok(())
    }

    /// Time-weighted share of the window during which the value stayed below the threshold.
    ///
    /// Every sample after the first contributes the gap to its predecessor,
    /// so a value that persisted over a long gap counts proportionally more.
    ///
    /// # Errors
    ///
    /// Fails with fewer than 2 samples.
    pub fn ratio(&self, threshold: f64) -> Result<Ratio, InsufficientDataError> {
        self.ensure_enough()?;
        let mut below = TimeDelta::zero();
        for (previous, current) in self.samples.iter().tuple_windows() {
            if current.value < threshold {
                below += current.timestamp - previous.timestamp;
            }
        }
        let total = self.span();
        Ok(Ratio { threshold, below_ratio: below.as_seconds_f64() / total.as_seconds_f64() })
    }

    /// Time-weighted mean over the window.
    ///
    /// The first sample only serves as the left edge of the first interval.
    ///
    /// # Errors
    ///
    /// Fails with fewer than 2 samples.
    pub fn mean(&self) -> Result<f64, InsufficientDataError> {
        self.ensure_enough()?;
        let mut weighted_sum = 0.0;
        for (previous, current) in self.samples.iter().tuple_windows() {
            weighted_sum += current.value * (current.timestamp - previous.timestamp).as_seconds_f64();
        }
        Ok(weighted_sum / self.span().as_seconds_f64())
    }

    /// Plain unweighted median over all held sample values.
    ///
    /// # Errors
    ///
    /// Fails with fewer than 2 samples, mirroring the other statistics.
    pub fn median(&self) -> Result<f64, InsufficientDataError> {
        self.ensure_enough()?;
        let sorted: Vec<f64> = self
            .samples
            .iter()
            .map(|sample| sample.value)
            .sorted_by(f64::total_cmp)
            .collect();
        let middle = sorted.len() / 2;
        Ok(if sorted.len() % 2 == 0 {
            f64::midpoint(sorted[middle - 1], sorted[middle])
        } else {
            sorted[middle]
        })
    }

    fn span(&self) -> TimeDelta {
        match (self.samples.front(), self.samples.back()) {
            (Some(oldest), Some(newest)) => newest.timestamp - oldest.timestamp,
            _ => TimeDelta::zero(),
        }
    }

    fn ensure_enough(&self) -> Result<(), InsufficientDataError> {
        let len = self.samples.len();
        if len < 2 { Err(InsufficientDataError { len }) } else { Ok(()) }
    }
}
