//! Process-local runtime telemetry
//!
//! Bounded log and metric buffers per deployment, plus the (cpu, ram) state
//! of the metric random walk. Nothing here is persisted: the store is empty
//! after a restart.

use dockyard_common::MetricPoint;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Log lines kept per deployment
pub const LOG_MAX_LINES: usize = 1000;

/// Metric samples kept per deployment
pub const METRICS_MAX_POINTS: usize = 900;

/// Starting point of the metric random walk
pub const METRIC_SEED: (f64, f64) = (50.0, 50.0);

/// FIFO buffer that evicts its oldest entry once full
#[derive(Debug)]
struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// Entries ever appended, including evicted ones
    appended: u64,
}

impl<T: Clone> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            appended: 0,
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
        self.appended += 1;
    }

    fn newest(&self, count: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(count);
        self.items.iter().skip(skip).cloned().collect()
    }

    fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct MetricSeries {
    points: Ring<MetricPoint>,
    seed: (f64, f64),
}

/// Position of a log reader, counted in lines appended so far.
///
/// Lines evicted before a reader catches up are skipped, never replayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor(u64);

/// Telemetry buffers shared by the scheduler (writer) and handlers (readers)
///
/// Logs and metrics sit behind independent locks; a critical section never
/// spans more than one buffer operation.
pub struct TelemetryStore {
    logs: Mutex<HashMap<i64, Ring<String>>>,
    metrics: Mutex<HashMap<i64, MetricSeries>>,
    log_capacity: usize,
    metric_capacity: usize,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::with_capacity(LOG_MAX_LINES, METRICS_MAX_POINTS)
    }

    pub fn with_capacity(log_capacity: usize, metric_capacity: usize) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
            log_capacity: log_capacity.max(1),
            metric_capacity: metric_capacity.max(1),
        }
    }

    pub fn append_log(&self, deployment_id: i64, line: impl Into<String>) {
        let mut logs = lock(&self.logs);
        logs.entry(deployment_id)
            .or_insert_with(|| Ring::new(self.log_capacity))
            .push(line.into());
    }

    /// The most recent `limit` lines, oldest first. A `limit` of 0 returns
    /// the whole buffer.
    pub fn recent_logs(&self, deployment_id: i64, limit: usize) -> Vec<String> {
        let logs = lock(&self.logs);
        match logs.get(&deployment_id) {
            Some(ring) if limit == 0 => ring.to_vec(),
            Some(ring) => ring.newest(limit),
            None => Vec::new(),
        }
    }

    /// Copy of the whole log buffer
    pub fn snapshot_logs(&self, deployment_id: i64) -> Vec<String> {
        let logs = lock(&self.logs);
        logs.get(&deployment_id)
            .map(Ring::to_vec)
            .unwrap_or_default()
    }

    /// Lines appended since `cursor` that are still buffered, and the cursor
    /// to pass on the next poll.
    pub fn logs_since(&self, deployment_id: i64, cursor: LogCursor) -> (Vec<String>, LogCursor) {
        let logs = lock(&self.logs);
        let Some(ring) = logs.get(&deployment_id) else {
            return (Vec::new(), LogCursor::default());
        };

        // the buffer was dropped and recreated under the reader
        if cursor.0 > ring.appended {
            return (ring.to_vec(), LogCursor(ring.appended));
        }

        let pending = (ring.appended - cursor.0) as usize;
        (ring.newest(pending), LogCursor(ring.appended))
    }

    pub fn append_metric(&self, deployment_id: i64, point: MetricPoint) {
        let mut metrics = lock(&self.metrics);
        self.series(&mut metrics, deployment_id).points.push(point);
    }

    /// Metric samples, oldest first
    pub fn metrics(&self, deployment_id: i64) -> Vec<MetricPoint> {
        let metrics = lock(&self.metrics);
        metrics
            .get(&deployment_id)
            .map(|series| series.points.to_vec())
            .unwrap_or_default()
    }

    /// Current random-walk state, seeded on first observation
    pub fn metric_seed(&self, deployment_id: i64) -> (f64, f64) {
        let mut metrics = lock(&self.metrics);
        self.series(&mut metrics, deployment_id).seed
    }

    pub fn update_metric_seed(&self, deployment_id: i64, cpu: f64, ram: f64) {
        let mut metrics = lock(&self.metrics);
        self.series(&mut metrics, deployment_id).seed = (cpu, ram);
    }

    /// Deployments holding any buffer, ascending
    pub fn deployment_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.logs).keys().copied().collect();
        ids.extend(lock(&self.metrics).keys().copied());
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Drop every buffer held for a deployment
    pub fn forget(&self, deployment_id: i64) {
        lock(&self.logs).remove(&deployment_id);
        lock(&self.metrics).remove(&deployment_id);
    }

    fn series<'a>(
        &self,
        metrics: &'a mut HashMap<i64, MetricSeries>,
        deployment_id: i64,
    ) -> &'a mut MetricSeries {
        metrics.entry(deployment_id).or_insert_with(|| MetricSeries {
            points: Ring::new(self.metric_capacity),
            seed: METRIC_SEED,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn point(cpu: f64) -> MetricPoint {
        MetricPoint {
            timestamp: Utc::now(),
            cpu,
            ram: cpu,
        }
    }

    #[test]
    fn test_log_buffer_evicts_oldest() {
        let telemetry = TelemetryStore::new();
        for i in 0..=LOG_MAX_LINES {
            telemetry.append_log(1, format!("line {}", i));
        }

        let lines = telemetry.snapshot_logs(1);
        assert_eq!(lines.len(), LOG_MAX_LINES);
        assert_eq!(lines[0], "line 1");
        assert_eq!(lines[LOG_MAX_LINES - 1], format!("line {}", LOG_MAX_LINES));
    }

    #[test]
    fn test_metric_buffer_evicts_oldest() {
        let telemetry = TelemetryStore::new();
        for i in 0..METRICS_MAX_POINTS + 5 {
            telemetry.append_metric(1, point(i as f64));
        }

        let points = telemetry.metrics(1);
        assert_eq!(points.len(), METRICS_MAX_POINTS);
        assert_eq!(points[0].cpu, 5.0);
    }

    #[test]
    fn test_recent_logs_oldest_first() {
        let telemetry = TelemetryStore::new();
        for i in 0..10 {
            telemetry.append_log(1, format!("line {}", i));
        }

        assert_eq!(telemetry.recent_logs(1, 3), vec!["line 7", "line 8", "line 9"]);
        assert_eq!(telemetry.recent_logs(1, 0).len(), 10);
        assert_eq!(telemetry.recent_logs(1, 50).len(), 10);
        assert!(telemetry.recent_logs(2, 5).is_empty());
    }

    #[test]
    fn test_recent_logs_is_a_copy() {
        let telemetry = TelemetryStore::new();
        telemetry.append_log(1, "first");
        let copy = telemetry.recent_logs(1, 10);
        telemetry.append_log(1, "second");

        assert_eq!(copy, vec!["first"]);
    }

    #[test]
    fn test_logs_since_returns_delta() {
        let telemetry = TelemetryStore::new();
        telemetry.append_log(1, "a");
        telemetry.append_log(1, "b");

        let (lines, cursor) = telemetry.logs_since(1, LogCursor::default());
        assert_eq!(lines, vec!["a", "b"]);

        telemetry.append_log(1, "c");
        let (lines, cursor) = telemetry.logs_since(1, cursor);
        assert_eq!(lines, vec!["c"]);

        let (lines, _) = telemetry.logs_since(1, cursor);
        assert!(lines.is_empty());
    }

    #[test]
    fn test_logs_since_keeps_flowing_when_full() {
        let telemetry = TelemetryStore::with_capacity(3, 3);
        for line in ["a", "b", "c"] {
            telemetry.append_log(1, line);
        }
        let (_, cursor) = telemetry.logs_since(1, LogCursor::default());

        // five more lines: two of them are evicted before the next poll
        for line in ["d", "e", "f", "g", "h"] {
            telemetry.append_log(1, line);
        }
        let (lines, _) = telemetry.logs_since(1, cursor);
        assert_eq!(lines, vec!["f", "g", "h"]);
    }

    #[test]
    fn test_metric_seed_defaults_and_updates() {
        let telemetry = TelemetryStore::new();
        assert_eq!(telemetry.metric_seed(4), METRIC_SEED);

        telemetry.update_metric_seed(4, 12.5, 80.0);
        assert_eq!(telemetry.metric_seed(4), (12.5, 80.0));
        assert_eq!(telemetry.metric_seed(5), METRIC_SEED);
    }

    #[test]
    fn test_forget_drops_buffers() {
        let telemetry = TelemetryStore::new();
        telemetry.append_log(1, "a");
        telemetry.append_metric(1, point(1.0));
        telemetry.append_log(3, "b");
        telemetry.append_metric(2, point(1.0));
        assert_eq!(telemetry.deployment_ids(), vec![1, 2, 3]);

        telemetry.forget(1);
        assert!(telemetry.snapshot_logs(1).is_empty());
        assert!(telemetry.metrics(1).is_empty());
        assert_eq!(telemetry.deployment_ids(), vec![2, 3]);
    }

    #[test]
    fn test_concurrent_writers_stay_bounded() {
        let telemetry = Arc::new(TelemetryStore::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let telemetry = Arc::clone(&telemetry);
                std::thread::spawn(move || {
                    for i in 0..600 {
                        telemetry.append_log(1, format!("{}-{}", t, i));
                        telemetry.append_metric(1, point(i as f64));
                        let _ = telemetry.recent_logs(1, 10);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(telemetry.snapshot_logs(1).len(), LOG_MAX_LINES);
        assert_eq!(telemetry.metrics(1).len(), METRICS_MAX_POINTS);
    }
}
