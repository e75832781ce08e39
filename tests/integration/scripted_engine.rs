//! Deterministic [`Engine`] test double: returns a pre-scripted sequence of
//! responses per URL instead of driving a real browser/HTTP client.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use crawl_orchestrator::{Engine, FetchOptions, FetchResponse};
use tokio::sync::Mutex;

/// An [`Engine`] whose responses are scripted ahead of time, keyed by URL.
/// Each call pops the next response for that URL; once exhausted it keeps
/// returning the last scripted response.
pub struct ScriptedEngine {
	scripts: Mutex<HashMap<String, Vec<FetchResponse>>>,
	call_counts: Mutex<HashMap<String, usize>>,
	cleaned_up: Arc<std::sync::atomic::AtomicBool>,
}
impl ScriptedEngine {
	/// Construct an engine with no scripted responses; unscripted URLs get
	/// a generic success response.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			scripts: Mutex::new(HashMap::new()),
			call_counts: Mutex::new(HashMap::new()),
			cleaned_up: Arc::new(std::sync::atomic::AtomicBool::new(false)),
		})
	}

	/// Build a factory closure suitable for `OrchestratorConfigBuilder::engine_factory`,
	/// always handing out `engine` (as a single shared script across however
	/// many pool instances get constructed).
	pub fn factory(engine: Arc<Self>) -> impl Fn() -> Arc<dyn Engine> + Send + Sync {
		move || engine.clone() as Arc<dyn Engine>
	}

	/// Script `responses` to be returned, in order, for `url`.
	pub async fn script(&self, url: impl Into<String>, responses: Vec<FetchResponse>) {
		self.scripts.lock().await.insert(url.into(), responses);
	}

	/// Whether `cleanup` has been called at least once.
	pub fn was_cleaned_up(&self) -> bool {
		self.cleaned_up.load(std::sync::atomic::Ordering::SeqCst)
	}

	/// Number of times `fetch` has been called for `url`.
	pub async fn call_count(&self, url: &str) -> usize {
		self.call_counts.lock().await.get(url).copied().unwrap_or(0)
	}
}
#[async_trait]
impl Engine for ScriptedEngine {
	async fn fetch(&self, url: &str, _options: &FetchOptions) -> FetchResponse {
		*self.call_counts.lock().await.entry(url.to_string()).or_insert(0) += 1;

		let mut scripts = self.scripts.lock().await;

		match scripts.get_mut(url) {
			Some(responses) if responses.len() > 1 => responses.remove(0),
			Some(responses) if responses.len() == 1 => responses[0].clone(),
			_ => FetchResponse::Success {
				title: Some("untitled".into()),
				content: format!("content for {url}"),
				metadata: Default::default(),
			},
		}
	}

	async fn cleanup(&self) {
		self.cleaned_up.store(true, std::sync::atomic::Ordering::SeqCst);
	}
}
