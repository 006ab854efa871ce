//! Online statistics collection.
//!
//! [`Collector`] accumulates count, min, max, mean and variance one sample at
//! a time using Welford's algorithm, so long-running services can keep
//! per-operation timings without storing samples.

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct Welford {
    count: f64,
    min: f64,
    max: f64,
    avg: f64,
    mean_dist2: f64,
}

/// Incremental statistics collector.
#[derive(Debug)]
pub struct Collector {
    inner: Mutex<Welford>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Welford {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                ..Welford::default()
            }),
        }
    }

    /// Accumulates one sample.
    pub fn add(&self, x: f64) {
        let mut w = self.inner.lock();
        w.count += 1.0;
        if x < w.min {
            w.min = x;
        }
        if x > w.max {
            w.max = x;
        }
        let delta = x - w.avg;
        w.avg += delta / w.count;
        let delta2 = x - w.avg;
        w.mean_dist2 += delta * delta2;
    }

    /// Snapshot of the collected statistics. An empty collector reports NaN
    /// for avg, var and stddev.
    pub fn stats(&self) -> Stats {
        let w = self.inner.lock();
        let avg = if w.count == 0.0 { f64::NAN } else { w.avg };
        let var = w.mean_dist2 / w.count;
        Stats {
            count: w.count as usize,
            min: w.min,
            max: w.max,
            avg,
            var,
            stddev: var.sqrt(),
        }
    }

    /// Starts a duration measurement; the elapsed seconds are recorded when
    /// the returned timer is dropped.
    pub fn start(&self) -> Timer<'_> {
        Timer {
            collector: self,
            start: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub var: f64,
    pub stddev: f64,
}

/// Records elapsed seconds into its collector on drop.
#[derive(Debug)]
pub struct Timer<'a> {
    collector: &'a Collector,
    start: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.collector.add(self.start.elapsed().as_secs_f64());
    }
}
