//! The fetch engine capability and the bounded, reusable pool that manages
//! instances of it.
//!
//! The engine implementation itself (headful/headless browser automation,
//! HTML parsing) is an external collaborator — this module only defines the
//! capability interface the orchestrator core consumes, plus the pool that
//! keeps engine construction bounded and reuse cheap.

// std
use std::collections::{HashMap, VecDeque};
// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
// self
use crate::_prelude::*;

/// Outcome tag returned by [`Engine::fetch`].
///
/// Mirrors the tagged union the external engine collaborator returns: either
/// a successful page fetch, or an error carrying enough detail for the
/// retry classifier to act on.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "success")]
pub enum FetchResponse {
	/// The fetch succeeded and produced page content.
	#[serde(rename = "true")]
	Success {
		/// Page title, when the engine was able to extract one.
		title: Option<String>,
		/// Raw or parsed page content, as produced by the engine.
		content: String,
		/// Engine-reported metadata about the fetch (timing, method, ...).
		metadata: FetchMetadata,
	},
	/// The fetch failed; `error_code` drives retry classification.
	#[serde(rename = "false")]
	Error {
		/// Human-readable error message.
		error: String,
		/// Coarse error classification reported by the engine.
		error_code: ErrorCode,
		/// Engine-reported metadata about the attempt.
		metadata: FetchMetadata,
		/// Whether the engine's CAPTCHA detection heuristics fired.
		///
		/// CAPTCHA detection itself is out of scope for this crate (an
		/// external collaborator concern); this flag is the only signal
		/// the retry classifier needs from it.
		#[serde(default)]
		captcha_detected: bool,
	},
}
impl FetchResponse {
	/// Whether this response represents a successful fetch.
	pub fn is_success(&self) -> bool {
		matches!(self, FetchResponse::Success { .. })
	}
}

/// Coarse error classification reported alongside a failed [`FetchResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
	/// An unclassified failure.
	Unexpected,
	/// The engine detected it was blocked by the origin.
	Blocked,
	/// A parser/plugin attempted an interaction the engine does not support.
	UnsupportedInteraction,
}

/// Metadata accompanying a [`FetchResponse`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchMetadata {
	/// Wall-clock duration of the fetch, in milliseconds.
	pub duration_ms: Option<u64>,
	/// Fetch method used by the engine (e.g. `"http"`, `"browser"`).
	pub method: Option<String>,
	/// Engine-specific extension fields.
	#[serde(default)]
	pub extra: HashMap<String, serde_json::Value>,
}

/// Options passed through to [`Engine::fetch`].
///
/// `parser` and `plugins` name the `ContentParser`/`ContentParserPlugin`
/// capabilities a handler wants invoked; both are external collaborators the
/// core only threads through opaquely.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchOptions {
	/// Name of the content parser the handler wants applied.
	pub parser: Option<String>,
	/// Names of content parser plugins to try, in order.
	#[serde(default)]
	pub plugins: Vec<String>,
	/// Whether the engine should run with its browser surface visible.
	#[serde(default)]
	pub show_browser: bool,
}

/// External fetch capability the orchestrator core consumes.
///
/// Implementations may be expensive to construct (a real browser process) —
/// that is exactly why [`EnginePool`] exists to bound and reuse them.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
	/// Fetch `url`, honoring `options`.
	async fn fetch(&self, url: &str, options: &FetchOptions) -> FetchResponse;

	/// Release any resources held by this engine instance. Must be
	/// idempotent; the pool may call it more than once in edge cases.
	async fn cleanup(&self);
}

type EngineFactory = dyn Fn() -> Arc<dyn Engine> + Send + Sync;

struct EnginePoolState {
	idle: VecDeque<Arc<dyn Engine>>,
	active: usize,
	all: Vec<Arc<dyn Engine>>,
	waiters: VecDeque<oneshot::Sender<Option<Arc<dyn Engine>>>>,
}

/// Bounded, reusable pool of [`Engine`] instances with a FIFO wait queue.
///
/// Invariants: `active + idle <= max_size` at all times; no engine is
/// simultaneously idle and active; [`EnginePool::cleanup`] is idempotent.
pub struct EnginePool {
	state: Mutex<EnginePoolState>,
	factory: Arc<EngineFactory>,
	max_size: usize,
}
impl EnginePool {
	/// Construct a pool bounded to `max_size` concurrently active engines,
	/// constructing new instances on demand via `factory`.
	pub fn new(max_size: usize, factory: impl Fn() -> Arc<dyn Engine> + Send + Sync + 'static) -> Self {
		Self {
			state: Mutex::new(EnginePoolState {
				idle: VecDeque::new(),
				active: 0,
				all: Vec::new(),
				waiters: VecDeque::new(),
			}),
			factory: Arc::new(factory),
			max_size,
		}
	}

	/// Acquire an engine instance, reusing an idle one, constructing a new
	/// one while under `max_size`, or suspending on the wait queue.
	pub async fn acquire(&self) -> Result<Arc<dyn Engine>> {
		let receiver = {
			let mut state = self.state.lock().await;

			if let Some(engine) = state.idle.pop_front() {
				state.active += 1;

				return Ok(engine);
			}

			if state.active < self.max_size {
				let engine = (self.factory)();

				state.all.push(engine.clone());
				state.active += 1;

				return Ok(engine);
			}

			let (tx, rx) = oneshot::channel();

			state.waiters.push_back(tx);

			rx
		};

		receiver.await.ok().flatten().ok_or_else(|| {
			Error::EngineFailure("engine pool was cleaned up while waiting for an engine".into())
		})
	}

	/// Return `engine` to the pool, handing it directly to the oldest
	/// waiter if one is suspended, otherwise parking it as idle.
	pub async fn release(&self, engine: Arc<dyn Engine>) {
		let mut state = self.state.lock().await;

		while let Some(waiter) = state.waiters.pop_front() {
			match waiter.send(Some(engine.clone())) {
				Ok(()) => return,
				Err(_) => continue,
			}
		}

		state.active = state.active.saturating_sub(1);
		state.idle.push_back(engine);
	}

	/// Concurrently clean up every instance (idle and active), unblock all
	/// waiters with a sentinel, and drop all references. Idempotent.
	pub async fn cleanup(&self) {
		let (instances, waiters) = {
			let mut state = self.state.lock().await;

			state.idle.clear();
			state.active = 0;

			(std::mem::take(&mut state.all), std::mem::take(&mut state.waiters))
		};

		for waiter in waiters {
			let _ = waiter.send(None);
		}

		let mut tasks = tokio::task::JoinSet::new();

		for engine in instances {
			tasks.spawn(async move { engine.cleanup().await });
		}

		while tasks.join_next().await.is_some() {}
	}

	/// Current idle and active counts, for status reporting and tests.
	pub async fn occupancy(&self) -> (usize, usize) {
		let state = self.state.lock().await;

		(state.idle.len(), state.active)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct CountingEngine {
		id: usize,
		cleaned_up: Arc<std::sync::atomic::AtomicBool>,
	}
	#[async_trait]
	impl Engine for CountingEngine {
		async fn fetch(&self, _url: &str, _options: &FetchOptions) -> FetchResponse {
			FetchResponse::Success {
				title: None,
				content: format!("engine-{}", self.id),
				metadata: FetchMetadata::default(),
			}
		}

		async fn cleanup(&self) {
			self.cleaned_up.store(true, Ordering::SeqCst);
		}
	}

	#[tokio::test]
	async fn reuses_idle_engines_before_constructing_new_ones() {
		let constructed = Arc::new(AtomicUsize::new(0));
		let constructed_for_factory = constructed.clone();
		let pool = EnginePool::new(2, move || {
			let id = constructed_for_factory.fetch_add(1, Ordering::SeqCst);

			Arc::new(CountingEngine { id, cleaned_up: Arc::new(std::sync::atomic::AtomicBool::new(false)) })
		});

		let a = pool.acquire().await.unwrap();
		pool.release(a).await;
		let b = pool.acquire().await.unwrap();
		pool.release(b).await;

		assert_eq!(constructed.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn respects_max_size_and_active_plus_idle_invariant() {
		let pool = Arc::new(EnginePool::new(1, || {
			Arc::new(CountingEngine { id: 0, cleaned_up: Arc::new(std::sync::atomic::AtomicBool::new(false)) })
		}));

		let a = pool.acquire().await.unwrap();
		let (idle, active) = pool.occupancy().await;
		assert_eq!((idle, active), (0, 1));

		let pool_for_waiter = pool.clone();
		let waiter = tokio::spawn(async move { pool_for_waiter.acquire().await });

		tokio::task::yield_now().await;
		pool.release(a).await;

		let b = waiter.await.unwrap().unwrap();
		let (idle, active) = pool.occupancy().await;
		assert_eq!((idle, active), (0, 1));

		pool.release(b).await;
	}

	#[tokio::test]
	async fn cleanup_is_idempotent_and_cleans_every_instance() {
		let cleaned_up = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let flag_for_factory = cleaned_up.clone();
		let pool = EnginePool::new(2, move || Arc::new(CountingEngine { id: 0, cleaned_up: flag_for_factory.clone() }));

		let engine = pool.acquire().await.unwrap();
		pool.release(engine).await;

		pool.cleanup().await;
		assert!(cleaned_up.load(Ordering::SeqCst));

		pool.cleanup().await;
		let (idle, active) = pool.occupancy().await;
		assert_eq!((idle, active), (0, 0));
	}

	#[tokio::test]
	async fn cleanup_unblocks_suspended_waiters_with_an_error() {
		let pool = Arc::new(EnginePool::new(1, || {
			Arc::new(CountingEngine { id: 0, cleaned_up: Arc::new(std::sync::atomic::AtomicBool::new(false)) })
		}));

		let _held = pool.acquire().await.unwrap();
		let pool_for_waiter = pool.clone();
		let waiter = tokio::spawn(async move { pool_for_waiter.acquire().await });

		tokio::task::yield_now().await;
		pool.cleanup().await;

		assert!(waiter.await.unwrap().is_err());
	}
}
