//! In-process metrics registry, plus an optional Prometheus exporter.

// std
use std::{
	collections::HashMap,
	sync::atomic::{AtomicI64, Ordering},
};
#[cfg(feature = "prometheus")]
use std::sync::OnceLock;
// crates.io
use tokio::sync::Mutex;
#[cfg(feature = "prometheus")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
// self
use crate::_prelude::*;

/// Well-known counter name: total fetch attempts.
pub const REQUESTS_TOTAL: &str = "requests.total";
/// Well-known counter name: fetch attempts that ended in success.
pub const REQUESTS_SUCCESS: &str = "requests.success";
/// Well-known counter name: fetch attempts that ended in failure.
pub const REQUESTS_FAILED: &str = "requests.failed";
/// Well-known counter name: records pushed to the progress log.
pub const ITEMS_SAVED: &str = "items.saved";
/// Well-known gauge name: pending queue depth.
pub const QUEUE_PENDING: &str = "queue.pending";
/// Well-known gauge name: in-progress queue depth.
pub const QUEUE_IN_PROGRESS: &str = "queue.in_progress";

/// Aggregate statistics over a set of recorded durations.
#[derive(Clone, Copy, Debug, Default)]
pub struct DurationStats {
	/// Number of durations recorded.
	pub count: u64,
	/// Shortest duration recorded, in milliseconds.
	pub min_ms: f64,
	/// Longest duration recorded, in milliseconds.
	pub max_ms: f64,
	/// Mean duration, in milliseconds.
	pub avg_ms: f64,
	/// Sum of all durations recorded, in milliseconds.
	pub total_ms: f64,
}

/// Point-in-time view of the registry's counters, gauges, and duration
/// statistics.
#[derive(Clone, Debug, Default)]
pub struct MetricSnapshot {
	/// Monotonically increasing named counters.
	pub counters: HashMap<String, i64>,
	/// Last-write-wins named gauges.
	pub gauges: HashMap<String, f64>,
	/// Aggregate fetch-duration statistics since the last reset.
	pub durations: DurationStats,
}
impl MetricSnapshot {
	/// Render the snapshot as Prometheus text exposition format, for
	/// crates that want to expose their own `/metrics` endpoint without
	/// installing a global recorder.
	#[cfg(feature = "prometheus")]
	pub fn render_text(&self) -> String {
		let mut out = String::new();

		for (name, value) in &self.counters {
			out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
		}
		for (name, value) in &self.gauges {
			out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
		}
		out.push_str(&format!("# TYPE fetch_duration_ms_avg gauge\nfetch_duration_ms_avg {}\n", self.durations.avg_ms));

		out
	}
}

/// Thread-safe in-process metrics registry shared across the orchestrator
/// and its workers.
#[derive(Default)]
pub struct MetricsRegistry {
	counters: Mutex<HashMap<String, AtomicI64>>,
	gauges: Mutex<HashMap<String, f64>>,
	durations: Mutex<Vec<Duration>>,
}
impl MetricsRegistry {
	/// Construct an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Add `delta` to the named counter, creating it at `delta` if absent.
	pub async fn increment(&self, name: &str, delta: i64) {
		let mut counters = self.counters.lock().await;

		counters.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0)).fetch_add(delta, Ordering::Relaxed);

		#[cfg(feature = "prometheus")]
		emit_counter(name, delta);
	}

	/// Set the named gauge to `value`, last-write-wins.
	pub async fn gauge(&self, name: &str, value: f64) {
		self.gauges.lock().await.insert(name.to_string(), value);

		#[cfg(feature = "prometheus")]
		emit_gauge(name, value);
	}

	/// Record a fetch duration sample.
	pub async fn record_duration(&self, duration: Duration) {
		self.durations.lock().await.push(duration);

		#[cfg(feature = "prometheus")]
		emit_duration(duration);
	}

	/// Take a point-in-time snapshot of all counters, gauges, and
	/// aggregated durations.
	pub async fn snapshot(&self) -> MetricSnapshot {
		let counters =
			self.counters.lock().await.iter().map(|(name, value)| (name.clone(), value.load(Ordering::Relaxed))).collect();
		let gauges = self.gauges.lock().await.clone();
		let durations = self.durations.lock().await.clone();

		MetricSnapshot { counters, gauges, durations: summarize(&durations) }
	}

	/// Clear accumulated duration samples, bounding memory growth across a
	/// long-running crawl. Counters and gauges are left untouched.
	pub async fn reset_durations(&self) {
		self.durations.lock().await.clear();
	}
}

fn summarize(durations: &[Duration]) -> DurationStats {
	if durations.is_empty() {
		return DurationStats::default();
	}

	let millis: Vec<f64> = durations.iter().map(Duration::as_secs_f64).map(|s| s * 1_000.0).collect();
	let total_ms: f64 = millis.iter().sum();
	let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
	let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

	DurationStats { count: millis.len() as u64, min_ms, max_ms, avg_ms: total_ms / millis.len() as f64, total_ms }
}

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the
/// recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new().install_recorder().map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Feed a counter increment through the `metrics` facade, so whatever
/// recorder is installed (the default Prometheus one or a consumer's own)
/// actually receives the data `render_text`'s snapshot reflects internally.
#[cfg(feature = "prometheus")]
fn emit_counter(name: &str, delta: i64) {
	counter!(name.to_owned()).increment(delta.max(0) as u64);
}

/// Feed a gauge set through the `metrics` facade.
#[cfg(feature = "prometheus")]
fn emit_gauge(name: &str, value: f64) {
	gauge!(name.to_owned()).set(value);
}

/// Feed a duration sample through the `metrics` facade, in seconds per the
/// `metrics` ecosystem's histogram convention.
#[cfg(feature = "prometheus")]
fn emit_duration(duration: Duration) {
	histogram!("fetch_duration_seconds").record(duration.as_secs_f64());
}
