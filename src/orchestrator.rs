//! Assembles every component into the concurrent worker pipeline and owns
//! their lifetimes for the duration of a run.

// std
use std::path::PathBuf;
// crates.io
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	crawl_state::CrawlState,
	engine::{Engine, EnginePool, FetchOptions, FetchResponse},
	error_snapshot::{ErrorSnapshot, ErrorSnapshotWriter},
	metrics::{self, MetricsRegistry},
	progress::ProgressWriter,
	queue::{Request, RequestQueue},
	rate_limiter::RateLimiter,
	retry::RetryStrategy,
	router::Router,
	session::{SessionPool, SessionPoolConfig},
};

/// A seed URL handed to [`Orchestrator::run`], with the same optional
/// label/user-data a discovered-link enqueue would carry.
#[derive(Clone, Debug)]
pub struct SeedRequest {
	/// URL to seed the crawl with.
	pub url: String,
	/// Handler label to route this seed to.
	pub label: Option<String>,
	/// Opaque payload threaded through to the handler.
	pub user_data: Option<serde_json::Value>,
}
impl SeedRequest {
	/// Construct an unlabeled seed with no user data.
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into(), label: None, user_data: None }
	}

	/// Attach a handler label.
	pub fn with_label(mut self, label: impl Into<String>) -> Self {
		self.label = Some(label.into());

		self
	}

	/// Attach opaque user data.
	pub fn with_user_data(mut self, user_data: serde_json::Value) -> Self {
		self.user_data = Some(user_data);

		self
	}
}

/// Outcome of a completed (or cancelled) run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunSummary {
	/// Requests handled successfully.
	pub handled: usize,
	/// Requests that exhausted their retry budget.
	pub failed: usize,
}

/// Immutable, `Arc`-backed configuration for an [`Orchestrator`] run.
pub struct OrchestratorConfig {
	max_concurrency: usize,
	max_requests_per_minute: u32,
	max_retries: u32,
	source_url: String,
	resume: bool,
	queue_path: Option<PathBuf>,
	output_path: PathBuf,
	state_path: PathBuf,
	error_snapshot_dir: PathBuf,
	error_snapshot_max: usize,
	session_pool: SessionPoolConfig,
	metrics_log_interval: Duration,
	engine_factory: Arc<dyn Fn() -> Arc<dyn Engine> + Send + Sync>,
}

/// Builder for [`OrchestratorConfig`], mirroring the plain-setter,
/// validate-on-`build` pattern used throughout this crate.
pub struct OrchestratorConfigBuilder {
	max_concurrency: usize,
	max_requests_per_minute: u32,
	max_retries: u32,
	source_url: String,
	resume: bool,
	queue_path: Option<PathBuf>,
	output_path: Option<PathBuf>,
	state_path: Option<PathBuf>,
	error_snapshot_dir: Option<PathBuf>,
	error_snapshot_max: usize,
	session_pool: SessionPoolConfig,
	metrics_log_interval: Duration,
	engine_factory: Option<Arc<dyn Fn() -> Arc<dyn Engine> + Send + Sync>>,
}
impl OrchestratorConfigBuilder {
	/// Start a builder for a crawl seeded from `source_url` (used to guard
	/// against loading crawl state belonging to a different run).
	pub fn new(source_url: impl Into<String>) -> Self {
		Self {
			max_concurrency: 5,
			max_requests_per_minute: 60,
			max_retries: 3,
			source_url: source_url.into(),
			resume: false,
			queue_path: None,
			output_path: None,
			state_path: None,
			error_snapshot_dir: None,
			error_snapshot_max: 20,
			session_pool: SessionPoolConfig::default(),
			metrics_log_interval: Duration::from_secs(30),
			engine_factory: None,
		}
	}

	/// Maximum number of workers running concurrently.
	pub fn max_concurrency(mut self, value: usize) -> Self {
		self.max_concurrency = value;

		self
	}

	/// Average requests-per-minute ceiling shared across all workers.
	pub fn max_requests_per_minute(mut self, value: u32) -> Self {
		self.max_requests_per_minute = value;

		self
	}

	/// Maximum retries permitted per request before it is given up on.
	pub fn max_retries(mut self, value: u32) -> Self {
		self.max_retries = value;

		self
	}

	/// Resume from durable queue/progress/crawl-state files on disk.
	pub fn resume(mut self, value: bool) -> Self {
		self.resume = value;

		self
	}

	/// Path to the durable queue's JSONL file. Omit to run with an
	/// in-memory-only (non-durable) queue.
	pub fn queue_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.queue_path = Some(path.into());

		self
	}

	/// Path the progress log is finalized to.
	pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.output_path = Some(path.into());

		self
	}

	/// Path the crawl-state snapshot is persisted to.
	pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.state_path = Some(path.into());

		self
	}

	/// Directory error snapshots are written into.
	pub fn error_snapshot_dir(mut self, path: impl Into<PathBuf>) -> Self {
		self.error_snapshot_dir = Some(path.into());

		self
	}

	/// Maximum number of error snapshots written per run.
	pub fn error_snapshot_max(mut self, value: usize) -> Self {
		self.error_snapshot_max = value;

		self
	}

	/// Session pool sizing and health policy.
	pub fn session_pool(mut self, config: SessionPoolConfig) -> Self {
		self.session_pool = config;

		self
	}

	/// Interval between periodic metrics snapshot log lines.
	pub fn metrics_log_interval(mut self, interval: Duration) -> Self {
		self.metrics_log_interval = interval;

		self
	}

	/// Factory used by the engine pool to construct new engine instances.
	pub fn engine_factory(mut self, factory: impl Fn() -> Arc<dyn Engine> + Send + Sync + 'static) -> Self {
		self.engine_factory = Some(Arc::new(factory));

		self
	}

	/// Validate and produce an immutable [`OrchestratorConfig`].
	pub fn build(self) -> Result<OrchestratorConfig> {
		if self.max_concurrency == 0 {
			return Err(Error::Validation { field: "max_concurrency", reason: "must be at least 1".into() });
		}
		if self.max_requests_per_minute == 0 {
			return Err(Error::Validation { field: "max_requests_per_minute", reason: "must be at least 1".into() });
		}

		let engine_factory = self
			.engine_factory
			.ok_or_else(|| Error::Validation { field: "engine_factory", reason: "must be set".into() })?;
		let output_path =
			self.output_path.ok_or_else(|| Error::Validation { field: "output_path", reason: "must be set".into() })?;
		let state_path =
			self.state_path.ok_or_else(|| Error::Validation { field: "state_path", reason: "must be set".into() })?;
		let error_snapshot_dir = self
			.error_snapshot_dir
			.ok_or_else(|| Error::Validation { field: "error_snapshot_dir", reason: "must be set".into() })?;

		Ok(OrchestratorConfig {
			max_concurrency: self.max_concurrency,
			max_requests_per_minute: self.max_requests_per_minute,
			max_retries: self.max_retries,
			source_url: self.source_url,
			resume: self.resume,
			queue_path: self.queue_path,
			output_path,
			state_path,
			error_snapshot_dir,
			error_snapshot_max: self.error_snapshot_max,
			session_pool: self.session_pool,
			metrics_log_interval: self.metrics_log_interval,
			engine_factory,
		})
	}
}

/// The surface a [`crate::router::Handler`] is given for one request.
///
/// Carries everything a handler needs (fetch, push data, enqueue links,
/// log) without capturing any mutable state in a closure — passed by value
/// once per dispatch, per the run's explicit-context design.
pub struct HandlerContext {
	request: Request,
	engine: Arc<dyn Engine>,
	last_response: Arc<Mutex<Option<FetchResponse>>>,
	queue: Arc<RequestQueue>,
	progress: Arc<ProgressWriter>,
	crawl_state: Arc<CrawlState>,
	metrics: Arc<MetricsRegistry>,
}
impl HandlerContext {
	/// The request currently being handled.
	pub fn request(&self) -> &Request {
		&self.request
	}

	/// Fetch the request's URL through the leased engine, recording timing
	/// metrics and remembering the response for retry classification.
	pub async fn fetch_page(&self, options: FetchOptions) -> FetchResponse {
		let start = Instant::now();
		let response = self.engine.fetch(&self.request.url, &options).await;
		let elapsed = start.elapsed();

		let outcome_metric = if response.is_success() { metrics::REQUESTS_SUCCESS } else { metrics::REQUESTS_FAILED };

		self.metrics.record_duration(elapsed).await;
		self.metrics.increment(metrics::REQUESTS_TOTAL, 1).await;
		self.metrics.increment(outcome_metric, 1).await;

		*self.last_response.lock().await = Some(response.clone());

		response
	}

	/// Push an extracted record to the progress log and mark the id
	/// completed in the crawl state.
	pub async fn push_data(&self, id: impl Into<String>, data: serde_json::Value) -> Result<()> {
		let id = id.into();

		self.progress.append(id.clone(), data).await?;
		self.crawl_state.mark_completed(id).await;
		self.metrics.increment(metrics::ITEMS_SAVED, 1).await;

		Ok(())
	}

	/// Enqueue a discovered URL, recording it as discovered in the crawl
	/// state when newly inserted.
	pub async fn enqueue(&self, url: impl Into<String>, label: Option<String>, user_data: Option<serde_json::Value>) -> Result<bool> {
		let url = url.into();
		let inserted = self.queue.enqueue(url.clone(), label, user_data).await?;

		if inserted {
			self.crawl_state.add_discovered_ids([url]).await;
		}

		Ok(inserted)
	}

	/// Structured info-level log, tagged with the current request's url.
	pub fn log_info(&self, message: &str) {
		tracing::info!(url = %self.request.url, unique_key = %self.request.unique_key, "{message}");
	}

	/// Structured warn-level log, tagged with the current request's url.
	pub fn log_warn(&self, message: &str) {
		tracing::warn!(url = %self.request.url, unique_key = %self.request.unique_key, "{message}");
	}
}

/// Owns and drives the full concurrent crawl pipeline for one run.
pub struct Orchestrator {
	config: Arc<OrchestratorConfig>,
	router: Arc<Router>,
}
impl Orchestrator {
	/// Construct an orchestrator from validated `config` and a fully
	/// populated `router`.
	pub fn new(config: OrchestratorConfig, router: Router) -> Self {
		Self { config: Arc::new(config), router: Arc::new(router) }
	}

	/// Run the crawl to completion: seed the queue, spawn bounded workers,
	/// drain until empty or cancelled, then persist final state.
	///
	/// `token` allows a caller to request graceful shutdown; when omitted
	/// a token that is never cancelled is used, so the run drains to
	/// completion on its own.
	#[tracing::instrument(skip(self, seeds, token), fields(source_url = %self.config.source_url))]
	pub async fn run(&self, seeds: Vec<SeedRequest>, token: Option<CancellationToken>) -> Result<RunSummary> {
		let token = token.unwrap_or_default();
		let config = self.config.clone();

		let queue = Arc::new(RequestQueue::new(config.queue_path.clone(), config.resume).await?);
		let progress = Arc::new(ProgressWriter::new(config.output_path.clone()));

		progress.initialize().await?;

		let crawl_state = Arc::new(CrawlState::new(config.state_path.clone(), config.source_url.clone()));

		if config.resume {
			crawl_state.load().await?;
		}

		let rate_limiter = Arc::new(RateLimiter::new(config.max_requests_per_minute));
		let metrics = Arc::new(MetricsRegistry::new());
		let retry = Arc::new(RetryStrategy::new(config.max_retries));
		let session_pool = Arc::new(SessionPool::new(config.session_pool));
		let engine_factory = config.engine_factory.clone();
		let engine_pool = Arc::new(EnginePool::new(config.max_concurrency, move || engine_factory()));
		let error_snapshots = Arc::new(ErrorSnapshotWriter::new(config.error_snapshot_dir.clone(), config.error_snapshot_max));

		error_snapshots.initialize().await?;

		let completed_ids = progress.read_completed_ids().await?;
		let seed_count = seeds.len();

		for seed in seeds {
			if completed_ids.contains(&seed.url) {
				continue;
			}

			if queue.enqueue(seed.url.clone(), seed.label, seed.user_data).await? {
				crawl_state.add_discovered_ids([seed.url]).await;
			}
		}

		let metrics_task = tokio::spawn({
			let metrics = metrics.clone();
			let token = token.clone();
			let interval = config.metrics_log_interval;

			async move {
				loop {
					tokio::select! {
						_ = token.cancelled() => break,
						_ = tokio::time::sleep(interval) => {
							let snapshot = metrics.snapshot().await;

							tracing::info!(
								counters = ?snapshot.counters,
								gauges = ?snapshot.gauges,
								avg_fetch_ms = snapshot.durations.avg_ms,
								"metrics snapshot",
							);

							metrics.reset_durations().await;
						}
					}
				}
			}
		});

		let worker_count = config.max_concurrency.min(seed_count.max(1));
		let mut workers = Vec::with_capacity(worker_count);

		for id in 0..worker_count {
			let router = self.router.clone();
			let queue = queue.clone();
			let rate_limiter = rate_limiter.clone();
			let engine_pool = engine_pool.clone();
			let session_pool = session_pool.clone();
			let retry = retry.clone();
			let metrics = metrics.clone();
			let progress = progress.clone();
			let crawl_state = crawl_state.clone();
			let error_snapshots = error_snapshots.clone();
			let token = token.clone();

			workers.push(tokio::spawn(worker_loop(
				id,
				router,
				queue,
				rate_limiter,
				engine_pool,
				session_pool,
				retry,
				metrics,
				progress,
				crawl_state,
				error_snapshots,
				token,
			)));
		}

		let mut worker_result = Ok(());

		for worker in workers {
			let outcome = worker.await.map_err(|error| Error::EngineFailure(error.to_string())).and_then(|inner| inner);

			if worker_result.is_ok() {
				worker_result = outcome;
			}
		}

		metrics_task.abort();

		// Cleanup runs unconditionally, even when a worker returned early with
		// an error — crash safety and resource release must not depend on
		// every worker having succeeded.
		let state_result = crawl_state.save().await;
		let finalize_result = progress.finalize().await;

		engine_pool.cleanup().await;
		session_pool.shutdown().await;

		worker_result?;
		state_result?;
		finalize_result?;

		let final_snapshot = metrics.snapshot().await;

		tracing::info!(counters = ?final_snapshot.counters, "crawl finished");

		Ok(RunSummary {
			handled: queue.size(Some(crate::queue::RequestState::Handled)).await,
			failed: queue.size(Some(crate::queue::RequestState::Failed)).await,
		})
	}
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all, fields(worker_id = id))]
async fn worker_loop(
	id: usize,
	router: Arc<Router>,
	queue: Arc<RequestQueue>,
	rate_limiter: Arc<RateLimiter>,
	engine_pool: Arc<EnginePool>,
	session_pool: Arc<SessionPool>,
	retry: Arc<RetryStrategy>,
	metrics: Arc<MetricsRegistry>,
	progress: Arc<ProgressWriter>,
	crawl_state: Arc<CrawlState>,
	error_snapshots: Arc<ErrorSnapshotWriter>,
	token: CancellationToken,
) -> Result<()> {
	loop {
		if token.is_cancelled() {
			break;
		}

		let Some(entry) = queue.dequeue().await? else {
			break;
		};

		rate_limiter.acquire().await;

		let engine = engine_pool.acquire().await?;
		let mut session = session_pool.acquire().await;
		let handler = match router.route(&entry) {
			Ok(handler) => handler,
			Err(error) => {
				queue.mark_failed(&entry.unique_key, error.to_string()).await?;
				engine_pool.release(engine).await;

				if let Some(session) = session.take() {
					session_pool.release(session).await;
				}

				continue;
			},
		};

		let last_response = Arc::new(Mutex::new(None));
		let ctx = HandlerContext {
			request: entry.clone(),
			engine: engine.clone(),
			last_response: last_response.clone(),
			queue: queue.clone(),
			progress: progress.clone(),
			crawl_state: crawl_state.clone(),
			metrics: metrics.clone(),
		};

		match handler.handle(ctx).await {
			Ok(()) => {
				queue.mark_handled(&entry.unique_key).await?;

				if let Some(active) = session.take() {
					session_pool.release(session_pool.record_success(active)).await;
				}
			},
			Err(message) => {
				let last = last_response.lock().await.clone();
				let kind = retry.classify(last.as_ref(), &message);
				let decision = retry.decide(kind, entry.retry_count);

				if let Some(mut active) = session.take() {
					if decision.rotate_session {
						active.retire();
						session_pool.release(active).await;
					} else {
						session_pool.release(session_pool.record_failure(active)).await;
					}
				}

				if decision.should_retry {
					tokio::time::sleep(decision.delay).await;
					queue.requeue(&entry.unique_key, Some(message.clone())).await?;

					tracing::warn!(url = %entry.url, retry_count = entry.retry_count, "request requeued after failure");
				} else {
					queue.mark_failed(&entry.unique_key, message.clone()).await?;
					crawl_state.mark_failed(entry.unique_key.clone()).await;

					let snapshot = ErrorSnapshot {
						url: entry.url.clone(),
						status_code: None,
						response_headers: std::collections::HashMap::new(),
						error_message: message.clone(),
						error_class: format!("{kind:?}"),
						captcha_selector: None,
						timestamp: SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_millis() as i64,
					};

					error_snapshots.write(&entry.unique_key, &snapshot, None).await;

					tracing::error!(url = %entry.url, error = %message, "request failed permanently");
				}
			},
		}

		engine_pool.release(engine).await;

		metrics.gauge(metrics::QUEUE_PENDING, queue.size(Some(crate::queue::RequestState::Pending)).await as f64).await;
		metrics
			.gauge(metrics::QUEUE_IN_PROGRESS, queue.size(Some(crate::queue::RequestState::InProgress)).await as f64)
			.await;
	}

	Ok(())
}
