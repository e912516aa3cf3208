//! Progress aggregation for archive-write operations
//!
//! The engine reports raw byte counts through stream reads; subscribers want
//! coalesced percent events. The aggregator turns one into the other,
//! guaranteeing a monotone, duplicate-free percent sequence.

use std::io::Read;
use std::sync::{Arc, Mutex};

/// Trait for progress tracking callbacks
///
/// Implement this trait (or pass a closure) to receive percent-complete
/// notifications during archive operations.
pub trait ProgressCallback: Send {
    /// Called when the percent-complete value increases
    ///
    /// # Arguments
    ///
    /// * `percent` - Percent complete, 0 to 100
    /// * `delta` - Increase over the previously reported percent
    fn on_progress(&mut self, percent: u8, delta: u8);
}

impl<F: FnMut(u8, u8) + Send> ProgressCallback for F {
    fn on_progress(&mut self, percent: u8, delta: u8) {
        self(percent, delta)
    }
}

struct ProgressInner {
    /// Declared total; zero is treated as one when computing percentages
    total: u64,
    written: u64,
    last_percent: u8,
    callback: Option<Box<dyn ProgressCallback>>,
}

/// Thread-safe byte-counter that emits percent-complete events
///
/// Percent values never regress and are never emitted twice. Destinations
/// that report slightly more bytes than the declared total clamp to 100.
pub struct ProgressAggregator {
    inner: Mutex<ProgressInner>,
}

impl ProgressAggregator {
    /// Create an aggregator with a declared total and no subscriber
    pub fn new(total: u64) -> Self {
        Self::with_callback(total, None)
    }

    /// Create an aggregator that forwards percent events to `callback`
    pub fn with_callback(total: u64, callback: Option<Box<dyn ProgressCallback>>) -> Self {
        ProgressAggregator {
            inner: Mutex::new(ProgressInner {
                total,
                written: 0,
                last_percent: 0,
                callback,
            }),
        }
    }

    /// Record `delta` more bytes written and emit a progress event if the
    /// computed percent advanced
    pub fn on_bytes(&self, delta: u64) {
        let mut inner = self.lock();
        let total = inner.total.max(1);
        inner.written = inner.written.saturating_add(delta);
        let percent = if inner.written >= total {
            100
        } else {
            // u128 keeps written * 100 from overflowing on huge archives
            ((inner.written as u128 * 100) / total as u128) as u8
        };
        if percent > inner.last_percent {
            let step = percent - inner.last_percent;
            inner.last_percent = percent;
            if let Some(callback) = inner.callback.as_mut() {
                callback.on_progress(percent, step);
            }
        }
    }

    /// Last reported percent
    pub fn percent(&self) -> u8 {
        self.lock().last_percent
    }

    /// Cumulative bytes recorded so far
    pub fn bytes_written(&self) -> u64 {
        self.lock().written
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressInner> {
        // a poisoned counter still holds consistent byte totals
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reader adapter that forwards every successful read to a
/// [`ProgressAggregator`]
pub struct CountingReader<R: Read> {
    inner: R,
    progress: Arc<ProgressAggregator>,
}

impl<R: Read> CountingReader<R> {
    /// Wrap `inner`, reporting read byte counts to `progress`
    pub fn new(inner: R, progress: Arc<ProgressAggregator>) -> Self {
        CountingReader { inner, progress }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.progress.on_bytes(n as u64);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collecting_aggregator(total: u64) -> (Arc<ProgressAggregator>, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let aggregator = ProgressAggregator::with_callback(
            total,
            Some(Box::new(move |percent: u8, _delta: u8| {
                sink.lock().unwrap().push(percent);
            })),
        );
        (Arc::new(aggregator), seen)
    }

    #[test]
    fn test_percent_sequence_strictly_increasing() {
        let (aggregator, seen) = collecting_aggregator(100);
        for _ in 0..10 {
            aggregator.on_bytes(10);
        }
        let seen = seen.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), 100);
        for pair in seen.windows(2) {
            assert!(pair[1] > pair[0], "percent regressed or repeated: {:?}", *seen);
        }
    }

    #[test]
    fn test_no_duplicate_percents_on_small_deltas() {
        let (aggregator, seen) = collecting_aggregator(1000);
        for _ in 0..1000 {
            aggregator.on_bytes(1);
        }
        let seen = seen.lock().unwrap();
        let mut sorted = seen.clone();
        sorted.dedup();
        assert_eq!(*seen, sorted);
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[test]
    fn test_zero_total_reports_full_immediately() {
        let (aggregator, seen) = collecting_aggregator(0);
        aggregator.on_bytes(1);
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn test_overshoot_clamps_to_hundred() {
        let (aggregator, seen) = collecting_aggregator(50);
        aggregator.on_bytes(40);
        aggregator.on_bytes(40);
        aggregator.on_bytes(40);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), 100);
        assert!(seen.iter().all(|p| *p <= 100));
    }

    #[test]
    fn test_counting_reader_reports_bytes() {
        let (aggregator, _) = collecting_aggregator(8);
        let mut reader = CountingReader::new(Cursor::new(vec![0u8; 8]), Arc::clone(&aggregator));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(aggregator.bytes_written(), 8);
        assert_eq!(aggregator.percent(), 100);
    }
}
