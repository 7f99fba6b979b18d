use crate::Sink;

/// Fixed-bin histogram over a closed interval.
///
/// Implements [`Sink<f64>`](crate::Sink), so a coincidence scan can
/// accumulate directly into bins instead of materializing the full
/// time-difference array. Differences outside `[min, max]` are dropped; the
/// top edge lands in the last bin.
///
/// # Examples
///
/// ```
/// use rossi::{Histogram, Sink};
///
/// let mut histogram = Histogram::new(4, 0.0, 8.0);
/// histogram.record(1.0);
/// histogram.record(3.0);
/// histogram.record(8.0);
/// assert_eq!(histogram.counts(), [1, 1, 0, 1]);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    counts: Vec<u64>,
    min: f64,
    max: f64,
    width: f64,
}

impl Histogram {
    /// Creates a histogram with `bins` equal-width bins spanning `[min, max]`.
    ///
    /// # Panics
    ///
    /// Panics if `bins` is zero or `max` is not greater than `min`.
    pub fn new(bins: usize, min: f64, max: f64) -> Self {
        assert!(bins > 0, "histogram needs at least one bin");
        assert!(max > min, "histogram range must be non-empty");

        Self {
            counts: vec![0; bins],
            min,
            max,
            width: (max - min) / bins as f64,
        }
    }

    /// Per-bin counts, lowest bin first.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Midpoints of the bins, lowest bin first. This is the abscissa the
    /// downstream curve fit consumes.
    pub fn bin_centers(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.counts.len()).map(move |i| self.min + (i as f64 + 0.5) * self.width)
    }

    /// Total number of recorded differences.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl Sink<f64> for Histogram {
    fn record(&mut self, difference: f64) {
        if !(self.min..=self.max).contains(&difference) {
            return;
        }
        let index = ((difference - self.min) / self.width) as usize;
        // difference == max falls past the last bin index.
        let index = index.min(self.counts.len() - 1);
        self.counts[index] += 1;
    }
}
