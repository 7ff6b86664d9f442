//! Process-wide statistics registry
//!
//! Named counters that any stage can bump without coordination. The registry is
//! append-only: counters are created on first use and live until process exit.
//! Pass a [`Registry`] explicitly for tests; production code uses the global.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// A single named statistic accumulating samples.
#[derive(Default)]
pub struct Counter {
    total: AtomicU64,
    samples: AtomicU64,
}

impl Counter {
    /// Record one sample of the given value.
    pub fn add(&self, value: u64) {
        self.total.fetch_add(value, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Sum of all recorded samples.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of recorded samples.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// Registry of named counters.
#[derive(Default)]
pub struct Registry {
    counters: Mutex<HashMap<String, Arc<Counter>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Fetch (or create) the counter with the given name.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = self.counters.lock().expect("stats registry poisoned");
        counters
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Counter::default()))
            .clone()
    }

    /// Snapshot of all counters, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64, u64)> {
        let counters = self.counters.lock().expect("stats registry poisoned");
        let mut rows: Vec<_> = counters
            .iter()
            .map(|(name, c)| (name.clone(), c.total(), c.samples()))
            .collect();
        rows.sort();
        rows
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, total, samples) in self.snapshot() {
            writeln!(f, "{name}: total={total} samples={samples}")?;
        }
        Ok(())
    }
}
