//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::DeviceState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Dispatch latency bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Recognition job duration bucket boundaries (milliseconds)
/// Buckets: ≤250, ≤500, ≤1000, ≤2000, ≤4000, ≤8000, ≤16000, ≤32000, ≤64000, ≤128000, >128000
const JOB_BOUNDS: [u64; 10] = [250, 500, 1000, 2000, 4000, 8000, 16000, 32000, 64000, 128000];

#[inline]
fn bucket_index(value: u64, bounds: &[u64; 10]) -> usize {
    bounds.partition_point(|&bound| bound < value)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], bounds: &[u64; 10], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports 2x the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Total events dispatched (monotonic)
    events_total: AtomicU64,
    /// Events since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of queue-to-dispatch latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max dispatch latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Dispatch latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    motion_events_total: AtomicU64,
    card_scans_total: AtomicU64,
    /// Card scans suppressed by the per-card dedup window
    card_scans_deduped: AtomicU64,
    transitions_total: AtomicU64,
    /// Current device state (0=idle, 1=active, 2=streaming)
    device_state: AtomicU64,
    sensor_faults_total: AtomicU64,
    card_read_errors_total: AtomicU64,
    /// Peripheral side effects that failed during a transition
    effect_failures_total: AtomicU64,
    attendance_attempts_total: AtomicU64,
    attendance_failures_total: AtomicU64,
    attendance_updates_total: AtomicU64,
    recognition_completed_total: AtomicU64,
    recognition_failed_total: AtomicU64,
    /// Jobs rejected because the pool queue was full (monotonic)
    recognition_dropped_total: AtomicU64,
    /// Recognition job duration histogram (reset on report)
    job_buckets: [AtomicU64; NUM_BUCKETS],
    job_sum_ms: AtomicU64,
    /// Log records dropped because the forward queue was full
    log_records_dropped: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            motion_events_total: AtomicU64::new(0),
            card_scans_total: AtomicU64::new(0),
            card_scans_deduped: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            device_state: AtomicU64::new(DeviceState::Idle.as_gauge()),
            sensor_faults_total: AtomicU64::new(0),
            card_read_errors_total: AtomicU64::new(0),
            effect_failures_total: AtomicU64::new(0),
            attendance_attempts_total: AtomicU64::new(0),
            attendance_failures_total: AtomicU64::new(0),
            attendance_updates_total: AtomicU64::new(0),
            recognition_completed_total: AtomicU64::new(0),
            recognition_failed_total: AtomicU64::new(0),
            recognition_dropped_total: AtomicU64::new(0),
            job_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            job_sum_ms: AtomicU64::new(0),
            log_records_dropped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an event was dispatched with given queue latency (lock-free)
    #[inline]
    pub fn record_event_processed(&self, latency_us: u64) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us, &BUCKET_BOUNDS)]
            .fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_motion(&self) {
        self.motion_events_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_card_scan(&self) {
        self.card_scans_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_card_deduped(&self) {
        self.card_scans_deduped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a state transition and publish the new state
    #[inline]
    pub fn record_transition(&self, to: DeviceState) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
        self.device_state.store(to.as_gauge(), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sensor_fault(&self) {
        self.sensor_faults_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_card_read_error(&self) {
        self.card_read_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_effect_failure(&self) {
        self.effect_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_attendance_attempt(&self) {
        self.attendance_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_attendance_failure(&self) {
        self.attendance_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_attendance_update(&self) {
        self.attendance_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished recognition job and its duration
    #[inline]
    pub fn record_recognition(&self, ok: bool, duration_ms: u64) {
        if ok {
            self.recognition_completed_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recognition_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.job_buckets[bucket_index(duration_ms, &JOB_BOUNDS)].fetch_add(1, Ordering::Relaxed);
        self.job_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_dropped(&self) {
        self.recognition_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_log_dropped(&self) {
        self.log_records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn device_state(&self) -> u64 {
        self.device_state.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn transitions_total(&self) -> u64 {
        self.transitions_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn effect_failures_total(&self) -> u64 {
        self.effect_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recognition_dropped_total(&self) -> u64 {
        self.recognition_dropped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn attendance_updates_total(&self) -> u64 {
        self.attendance_updates_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn card_scans_deduped(&self) -> u64 {
        self.card_scans_deduped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Summary without resetting anything (for scrapes between reports)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let take = |counter: &AtomicU64| {
            if reset {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };
        let take_buckets =
            |buckets: &[AtomicU64; NUM_BUCKETS]| if reset { swap_buckets(buckets) } else { load_buckets(buckets) };

        let events_count = take(&self.events_since_report);
        let latency_sum = take(&self.latency_sum_us);
        let max_latency = take(&self.latency_max_us);
        let lat_buckets = take_buckets(&self.latency_buckets);

        let job_buckets = take_buckets(&self.job_buckets);
        let job_sum = take(&self.job_sum_ms);
        let job_count: u64 = job_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_per_sec,
            avg_dispatch_latency_us: if events_count > 0 { latency_sum / events_count } else { 0 },
            max_dispatch_latency_us: max_latency,
            lat_p99_us: percentile_from_buckets(&lat_buckets, &BUCKET_BOUNDS, 0.99),
            lat_buckets,
            device_state: self.device_state.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            motion_events_total: self.motion_events_total.load(Ordering::Relaxed),
            card_scans_total: self.card_scans_total.load(Ordering::Relaxed),
            card_scans_deduped: self.card_scans_deduped.load(Ordering::Relaxed),
            sensor_faults_total: self.sensor_faults_total.load(Ordering::Relaxed),
            card_read_errors_total: self.card_read_errors_total.load(Ordering::Relaxed),
            effect_failures_total: self.effect_failures_total.load(Ordering::Relaxed),
            attendance_attempts_total: self.attendance_attempts_total.load(Ordering::Relaxed),
            attendance_failures_total: self.attendance_failures_total.load(Ordering::Relaxed),
            attendance_updates_total: self.attendance_updates_total.load(Ordering::Relaxed),
            recognition_completed_total: self.recognition_completed_total.load(Ordering::Relaxed),
            recognition_failed_total: self.recognition_failed_total.load(Ordering::Relaxed),
            recognition_dropped_total: self.recognition_dropped_total.load(Ordering::Relaxed),
            job_avg_ms: if job_count > 0 { job_sum / job_count } else { 0 },
            job_p95_ms: percentile_from_buckets(&job_buckets, &JOB_BOUNDS, 0.95),
            job_buckets,
            log_records_dropped: self.log_records_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_JOB_BOUNDS: [u64; 10] = JOB_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub events_total: u64,
    pub events_per_sec: f64,
    pub avg_dispatch_latency_us: u64,
    pub max_dispatch_latency_us: u64,
    /// Dispatch latency histogram buckets (µs)
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p99_us: u64,
    /// Current device state (0=idle, 1=active, 2=streaming)
    pub device_state: u64,
    pub transitions_total: u64,
    pub motion_events_total: u64,
    pub card_scans_total: u64,
    pub card_scans_deduped: u64,
    pub sensor_faults_total: u64,
    pub card_read_errors_total: u64,
    pub effect_failures_total: u64,
    pub attendance_attempts_total: u64,
    pub attendance_failures_total: u64,
    pub attendance_updates_total: u64,
    pub recognition_completed_total: u64,
    pub recognition_failed_total: u64,
    pub recognition_dropped_total: u64,
    /// Recognition job duration histogram buckets (ms)
    pub job_buckets: [u64; NUM_BUCKETS],
    pub job_avg_ms: u64,
    pub job_p95_ms: u64,
    pub log_records_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_total = %self.events_total,
            events_per_sec = format!("{:.2}", self.events_per_sec),
            avg_latency_us = %self.avg_dispatch_latency_us,
            p99_us = %self.lat_p99_us,
            state = %self.device_state,
            transitions = %self.transitions_total,
            motion = %self.motion_events_total,
            cards = %self.card_scans_total,
            attendance = %self.attendance_attempts_total,
            attendance_failed = %self.attendance_failures_total,
            recognized = %self.recognition_completed_total,
            recognition_failed = %self.recognition_failed_total,
            recognition_dropped = %self.recognition_dropped_total,
            job_avg_ms = %self.job_avg_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_event() {
        let metrics = Metrics::new();

        metrics.record_event_processed(100);
        metrics.record_event_processed(200);
        assert_eq!(metrics.events_total(), 2);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();

        metrics.record_event_processed(100);
        metrics.record_event_processed(200);
        metrics.record_event_processed(300);
        metrics.record_card_scan();
        metrics.record_transition(DeviceState::Streaming);

        let summary = metrics.report();

        assert_eq!(summary.events_total, 3);
        assert_eq!(summary.avg_dispatch_latency_us, 200);
        assert_eq!(summary.max_dispatch_latency_us, 300);
        assert_eq!(summary.card_scans_total, 1);
        assert_eq!(summary.device_state, 2);
        assert_eq!(summary.transitions_total, 1);

        assert_eq!(metrics.events_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);
        // Monotonic counters survive the report
        assert_eq!(metrics.report().card_scans_total, 1);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let metrics = Metrics::new();
        metrics.record_event_processed(500);

        assert_eq!(metrics.snapshot().max_dispatch_latency_us, 500);
        assert_eq!(metrics.snapshot().lat_buckets[3], 1);
        assert_eq!(metrics.report().max_dispatch_latency_us, 500);
        assert_eq!(metrics.snapshot().max_dispatch_latency_us, 0);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report();
        assert_eq!(summary.events_total, 0);
        assert_eq!(summary.avg_dispatch_latency_us, 0);
        assert_eq!(summary.job_avg_ms, 0);
        assert_eq!(summary.lat_p99_us, 0);
    }

    #[test]
    fn test_recognition_histogram() {
        let metrics = Metrics::new();
        metrics.record_recognition(true, 300);
        metrics.record_recognition(true, 700);
        metrics.record_recognition(false, 200_000);

        let summary = metrics.report();
        assert_eq!(summary.recognition_completed_total, 2);
        assert_eq!(summary.recognition_failed_total, 1);
        assert_eq!(summary.job_buckets[1], 1);
        assert_eq!(summary.job_buckets[2], 1);
        assert_eq!(summary.job_buckets[10], 1);
        assert_eq!(summary.job_p95_ms, 1000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0, &BUCKET_BOUNDS), 0);
        assert_eq!(bucket_index(100, &BUCKET_BOUNDS), 0);
        assert_eq!(bucket_index(101, &BUCKET_BOUNDS), 1);
        assert_eq!(bucket_index(51200, &BUCKET_BOUNDS), 9);
        assert_eq!(bucket_index(51201, &BUCKET_BOUNDS), 10);
        assert_eq!(bucket_index(250, &JOB_BOUNDS), 0);
        assert_eq!(bucket_index(251, &JOB_BOUNDS), 1);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_event_processed(150);
        }
        assert_eq!(metrics.report().lat_p99_us, 200);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_event_processed(i as u64);
                    m.record_motion();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.events_total(), 8_000);
        assert_eq!(metrics.report().motion_events_total, 8_000);
    }
}
