//! Live counters of a method.
//!
//! [`Stat`] is written by every worker after each attempt and read at any time
//! by `stat_print`. The counters are relaxed atomics; latencies go into an
//! HDR histogram behind a short-lived lock. A snapshot taken while workers
//! run is a consistent-enough view for live metrics.
//!
//! [`StatSnapshot`] is the plain-data view. It derives the final figures
//! (average, percentiles) and can be merged with snapshots of other methods.
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use crate::{AttemptResult, Result, Severity};

/// Highest latency the histogram tracks exactly, one hour in µs. Larger
/// samples are clamped to it.
const LATENCY_CEILING_US: u64 = 3_600_000_000;

fn latency_histogram() -> Result<Histogram<u64>> {
    Ok(Histogram::new_with_bounds(1, LATENCY_CEILING_US, 3)?)
}

fn micros(d: Duration) -> u64 {
    d.as_micros().min(u64::MAX as u128) as u64
}

#[derive(Debug)]
pub struct Stat {
    count: AtomicU64,
    cancelled: AtomicU64,
    by_level: [AtomicU64; Severity::ALL.len()],
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    latency_total_us: AtomicU64,
    latency_max_us: AtomicU64,
    latency: Mutex<Histogram<u64>>,
    in_flight: AtomicUsize,
    in_flight_peak: AtomicUsize,
}

impl Stat {
    pub fn new() -> Result<Self> {
        Ok(Self {
            count: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            by_level: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency: Mutex::new(latency_histogram()?),
            in_flight: AtomicUsize::new(0),
            in_flight_peak: AtomicUsize::new(0),
        })
    }

    /// Marks one worker as inside `test()` until the guard is dropped.
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.in_flight_peak.fetch_max(now, Ordering::Relaxed);
        InFlightGuard { stat: self }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Accounts one finished attempt.
    ///
    /// Cancelled attempts only bump the `cancelled` counter: they measure the
    /// shutdown, not the target.
    pub fn record(&self, res: &AttemptResult) {
        if res.is_cancelled() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.by_level[res.log_level.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(res.size_out as u64, Ordering::Relaxed);
        self.bytes_in.fetch_add(res.size_in as u64, Ordering::Relaxed);

        let us = micros(res.interval_event);
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(us, Ordering::Relaxed);
        // the histogram floor is 1µs
        self.latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .saturating_record(us.max(1));
    }

    pub fn snapshot(&self) -> StatSnapshot {
        let histogram = self
            .latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut snap = StatSnapshot {
            count: self.count.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            levels: Severity::ALL
                .iter()
                .map(|s| (*s, self.by_level[s.index()].load(Ordering::Relaxed)))
                .collect(),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            latency_total_us: self.latency_total_us.load(Ordering::Relaxed),
            latency_max_us: self.latency_max_us.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            in_flight_peak: self.in_flight_peak.load(Ordering::Relaxed),
            histogram: Some(histogram),
            ..Default::default()
        };
        snap.refresh_quantiles();
        snap
    }
}

pub struct InFlightGuard<'a> {
    stat: &'a Stat,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stat.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a [`Stat`].
///
/// The latency histogram itself is not serialized; the `latency_p*_us`
/// fields carry its headline quantiles in reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub count: u64,
    pub cancelled: u64,
    pub levels: BTreeMap<Severity, u64>,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub latency_total_us: u64,
    pub latency_max_us: u64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub in_flight: usize,
    pub in_flight_peak: usize,
    #[serde(skip)]
    pub(crate) histogram: Option<Histogram<u64>>,
}

impl StatSnapshot {
    pub fn level(&self, severity: Severity) -> u64 {
        self.levels.get(&severity).copied().unwrap_or(0)
    }

    /// Attempts recorded with any severity above `Ok`.
    pub fn failures(&self) -> u64 {
        self.levels
            .iter()
            .filter(|(s, _)| **s > Severity::Ok)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.latency_total_us / self.count))
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.latency_max_us)
    }

    /// Latency quantile `q` in `[0, 1]`, within the histogram's three
    /// significant digits. `None` until a latency has been recorded.
    pub fn percentile(&self, q: f64) -> Option<Duration> {
        let hist = self.histogram.as_ref().filter(|h| h.len() > 0)?;
        Some(Duration::from_micros(
            hist.value_at_quantile(q.clamp(0.0, 1.0)),
        ))
    }

    /// Number of latency samples behind [`percentile`](Self::percentile).
    pub fn latency_samples(&self) -> u64 {
        self.histogram.as_ref().map_or(0, |h| h.len())
    }

    /// Folds another snapshot into this one. Associative and commutative,
    /// except for the in-flight gauges which keep the larger value.
    pub fn merge(&mut self, other: &StatSnapshot) -> Result<()> {
        self.count += other.count;
        self.cancelled += other.cancelled;
        for (s, n) in &other.levels {
            *self.levels.entry(*s).or_default() += n;
        }
        self.bytes_out += other.bytes_out;
        self.bytes_in += other.bytes_in;
        self.latency_total_us += other.latency_total_us;
        self.latency_max_us = self.latency_max_us.max(other.latency_max_us);
        self.in_flight = self.in_flight.max(other.in_flight);
        self.in_flight_peak = self.in_flight_peak.max(other.in_flight_peak);
        if let Some(theirs) = &other.histogram {
            if let Some(mine) = self.histogram.as_mut() {
                mine.add(theirs)?;
            } else {
                self.histogram = Some(theirs.clone());
            }
        }
        self.refresh_quantiles();
        Ok(())
    }

    fn refresh_quantiles(&mut self) {
        let p50 = self.percentile(0.5).map_or(0, micros);
        let p95 = self.percentile(0.95).map_or(0, micros);
        let p99 = self.percentile(0.99).map_or(0, micros);
        self.latency_p50_us = p50;
        self.latency_p95_us = p95;
        self.latency_p99_us = p99;
    }
}
