//! Thread-safe progress accounting
//!
//! Stages credit progress as splats clear the device; additions are monotone
//! but not ordered with chunk completion.

use std::sync::atomic::{AtomicU64, Ordering};

/// An abstraction of a progress meter. Supports large integral progress values.
pub trait ProgressMeter: Send + Sync {
    /// Add a given amount to the progress, returning the new value.
    fn add(&self, amount: u64) -> u64;

    /// Current progress value.
    fn current(&self) -> u64;
}

/// A counting meter that logs at a coarse percentage granularity.
pub struct ProgressCounter {
    current: AtomicU64,
    total: u64,
    /// Progress value at which the next log line is emitted
    next_report: AtomicU64,
}

impl ProgressCounter {
    /// Create a meter expecting `total` units of work.
    pub fn new(total: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            total,
            next_report: AtomicU64::new(total / 10),
        }
    }

    /// Value at completion.
    pub fn expected(&self) -> u64 {
        self.total
    }
}

impl ProgressMeter for ProgressCounter {
    fn add(&self, amount: u64) -> u64 {
        let now = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let due = self.next_report.load(Ordering::Relaxed);
        if self.total > 0 && now >= due && due > 0 {
            // A racing thread may log the same decile twice; harmless.
            self.next_report
                .store(due + self.total / 10, Ordering::Relaxed);
            log::info!(
                "progress: {}/{} ({:.0}%)",
                now,
                self.total,
                now as f64 * 100.0 / self.total as f64
            );
        }
        now
    }

    fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_progress_monotone() {
        let meter = ProgressCounter::new(100);
        assert_eq!(meter.add(30), 30);
        assert_eq!(meter.add(20), 50);
        assert_eq!(meter.current(), 50);
        assert_eq!(meter.expected(), 100);
    }

    #[test]
    fn test_progress_concurrent() {
        let meter = Arc::new(ProgressCounter::new(4000));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let meter = meter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    meter.add(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(meter.current(), 4000);
    }
}
