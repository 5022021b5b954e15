//! Exponentially weighted response-time tracking

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Weight kept from the previous average on every new sample
const SMOOTHING: f64 = 0.87;
/// Factor applied to an average that has been idle for [`IDLE_DECAY_AFTER`]
const IDLE_DECAY: f64 = 0.93;
/// Idle time after which a read decays the average
pub const IDLE_DECAY_AFTER: Duration = Duration::from_secs(360);

#[derive(Debug, Clone, Copy, Default)]
struct Ewma {
    value: f64,
    updated: Option<Instant>,
}

impl Ewma {
    /// Current value, decaying it first if it has been idle too long
    fn read(&mut self, now: Instant) -> f64 {
        let idle = self
            .updated
            .map_or(true, |at| now.saturating_duration_since(at) > IDLE_DECAY_AFTER);
        if idle {
            self.value *= IDLE_DECAY;
            self.updated = Some(now);
        }
        self.value
    }

    fn update(&mut self, previous: f64, sample: f64, now: Instant) {
        self.value = SMOOTHING * previous + (1.0 - SMOOTHING) * sample;
        self.updated = Some(now);
    }
}

/// Response-time averages for one endpoint, globally and per destination host.
///
/// Concurrent updates are last-writer-wins; the average only has to converge.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    global: Mutex<Ewma>,
    by_host: DashMap<String, Ewma>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an observed response time into the global and per-host averages
    pub fn record(&self, host: Option<&str>, rtime: Duration) {
        let now = Instant::now();
        let sample = rtime.as_secs_f64();

        {
            let mut global = self.global.lock();
            let previous = global.read(now);
            global.update(previous, sample, now);
        }

        if let Some(host) = host {
            let mut entry = self.by_host.entry(host.to_string()).or_default();
            let previous = entry.read(now);
            entry.update(previous, sample, now);
        }
    }

    /// Average response time in seconds.
    ///
    /// Without a host this is the global average. A host with no recorded
    /// value (absent, or decayed to exactly zero) falls back to the global
    /// average.
    pub fn average(&self, host: Option<&str>) -> f64 {
        let now = Instant::now();

        let per_host = host.and_then(|host| {
            self.by_host
                .get_mut(host)
                .map(|mut entry| entry.read(now))
        });

        match per_host {
            Some(value) if value != 0.0 => value,
            _ => self.global.lock().read(now),
        }
    }

    /// Number of destination hosts with a recorded average
    pub fn tracked_hosts(&self) -> usize {
        self.by_host.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tracker_reports_zero() {
        let tracker = LatencyTracker::new();
        assert_eq!(tracker.average(None), 0.0);
        assert_eq!(tracker.average(Some("example.com")), 0.0);
        assert_eq!(tracker.tracked_hosts(), 0);
    }

    #[test]
    fn record_applies_smoothing() {
        let tracker = LatencyTracker::new();
        tracker.record(Some("example.com"), Duration::from_secs(1));

        assert!((tracker.average(None) - 0.13).abs() < 1e-9);
        assert!((tracker.average(Some("example.com")) - 0.13).abs() < 1e-9);

        tracker.record(Some("example.com"), Duration::from_secs(1));
        let expected = 0.87 * 0.13 + 0.13;
        assert!((tracker.average(None) - expected).abs() < 1e-9);
        assert_eq!(tracker.tracked_hosts(), 1);
    }

    #[test]
    fn unknown_host_falls_back_to_global() {
        let tracker = LatencyTracker::new();
        tracker.record(Some("a.example"), Duration::from_secs(2));

        let global = tracker.average(None);
        assert_eq!(tracker.average(Some("b.example")), global);
        // Reading an unknown host does not create an entry.
        assert_eq!(tracker.tracked_hosts(), 1);
    }

    #[test]
    fn hostless_samples_only_move_global() {
        let tracker = LatencyTracker::new();
        tracker.record(None, Duration::from_millis(500));
        assert!(tracker.average(None) > 0.0);
        assert_eq!(tracker.tracked_hosts(), 0);
    }

    #[test]
    fn constant_samples_converge() {
        let tracker = LatencyTracker::new();
        let target = 1.5;
        for _ in 0..40 {
            tracker.record(None, Duration::from_secs_f64(target));
        }
        let avg = tracker.average(None);
        assert!((avg - target).abs() / target < 0.01, "avg = {avg}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_average_decays_once_per_window() {
        let tracker = LatencyTracker::new();
        tracker.record(Some("example.com"), Duration::from_secs(1));
        let fresh = tracker.average(None);

        tokio::time::advance(IDLE_DECAY_AFTER + Duration::from_secs(1)).await;
        let decayed = tracker.average(None);
        assert!((decayed - fresh * 0.93).abs() < 1e-12);

        // A second read inside the window sees the same value.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tracker.average(None), decayed);

        let host_decayed = tracker.average(Some("example.com"));
        assert!((host_decayed - fresh * 0.93).abs() < 1e-12);
        assert_eq!(tracker.average(Some("example.com")), host_decayed);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_inside_window_do_not_decay() {
        let tracker = LatencyTracker::new();
        tracker.record(None, Duration::from_secs(3));
        let first = tracker.average(None);

        tokio::time::advance(IDLE_DECAY_AFTER - Duration::from_secs(1)).await;
        assert_eq!(tracker.average(None), first);
    }
}
