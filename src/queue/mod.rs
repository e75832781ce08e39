//! Durable FIFO request queue.
//!
//! Entries persist as JSONL: appended one line at a time for new
//! enqueues, and fully rewritten (via write-temp-then-rename) whenever an
//! existing entry's state changes, so a crash mid-write never corrupts the
//! file a reload depends on.

mod persistence;

// std
use std::path::PathBuf;
// crates.io
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
// self
use self::persistence::QueuePersistence;
use crate::_prelude::*;

/// Lifecycle state of a [`Request`] as it moves through the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestState {
	/// Waiting to be dequeued.
	Pending,
	/// Checked out by a worker; not yet resolved.
	InProgress,
	/// Handled successfully.
	Handled,
	/// Exhausted its retry budget and was given up on.
	Failed,
}

/// A single queued crawl request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
	/// URL to fetch.
	pub url: String,
	/// Key that uniquely identifies this request within a crawl run,
	/// derived from `url`.
	pub unique_key: String,
	/// Handler label used for routing; `None` dispatches to the default
	/// handler.
	#[serde(default)]
	pub label: Option<String>,
	/// Number of times this request has been requeued after a failure.
	#[serde(default)]
	pub retry_count: u32,
	/// Opaque payload threaded through from `enqueue` to the handler.
	#[serde(default)]
	pub user_data: Option<serde_json::Value>,
	/// Current lifecycle state.
	pub state: RequestState,
	/// Error messages captured across failed attempts and requeues.
	#[serde(default)]
	pub errors: Vec<String>,
}

/// Derive a request's unique key from its URL by normalizing a trailing
/// slash and lowercasing the scheme/host portion, so equivalent URLs
/// collide onto the same queue entry.
pub fn derive_unique_key(url: &str) -> String {
	let trimmed = url.trim();
	let (head, rest) = match trimmed.split_once("://") {
		Some((scheme, rest)) => (format!("{}://", scheme.to_lowercase()), rest),
		None => (String::new(), trimmed),
	};
	let (authority, path) = match rest.split_once('/') {
		Some((authority, path)) => (authority.to_lowercase(), format!("/{path}")),
		None => (rest.to_lowercase(), String::new()),
	};
	let path = if path.len() > 1 { path.trim_end_matches('/').to_string() } else { path };

	format!("{head}{authority}{path}")
}

struct QueueState {
	by_key: std::collections::HashMap<String, Request>,
	order: Vec<String>,
}
impl QueueState {
	fn ordered_entries(&self) -> Vec<Request> {
		self.order.iter().filter_map(|key| self.by_key.get(key)).cloned().collect()
	}
}

/// Durable FIFO queue of [`Request`]s.
pub struct RequestQueue {
	state: Mutex<QueueState>,
	persistence: Option<QueuePersistence>,
}
impl RequestQueue {
	/// Construct a queue, optionally persisting to `path`. When `resume` is
	/// true and `path` points at an existing file, replay it and demote any
	/// in-progress entries back to pending before accepting new work.
	pub async fn new(path: Option<PathBuf>, resume: bool) -> Result<Self> {
		let persistence = path.map(QueuePersistence::new);
		let mut by_key = std::collections::HashMap::new();
		let mut order = Vec::new();

		if resume && let Some(persistence) = &persistence {
			for mut entry in persistence.replay().await? {
				if entry.state == RequestState::InProgress {
					entry.state = RequestState::Pending;
				}

				order.push(entry.unique_key.clone());
				by_key.insert(entry.unique_key.clone(), entry);
			}
		}

		let queue = Self { state: Mutex::new(QueueState { by_key, order }), persistence };

		if resume {
			queue.rewrite().await?;
		}

		Ok(queue)
	}

	/// Enqueue a new request if its derived key is not already known.
	/// Returns whether a new entry was inserted.
	pub async fn enqueue(&self, url: impl Into<String>, label: Option<String>, user_data: Option<serde_json::Value>) -> Result<bool> {
		let url = url.into();
		let unique_key = derive_unique_key(&url);
		let mut state = self.state.lock().await;

		if state.by_key.contains_key(&unique_key) {
			return Ok(false);
		}

		let entry = Request { url, unique_key: unique_key.clone(), label, retry_count: 0, user_data, state: RequestState::Pending, errors: Vec::new() };

		state.order.push(unique_key.clone());
		state.by_key.insert(unique_key, entry.clone());
		drop(state);

		if let Some(persistence) = &self.persistence {
			persistence.append(&entry).await?;
		}

		Ok(true)
	}

	/// Enqueue many requests in one call; returns the number actually
	/// inserted (duplicates are skipped).
	pub async fn enqueue_batch(&self, items: Vec<(String, Option<String>, Option<serde_json::Value>)>) -> Result<usize> {
		let mut inserted = 0;

		for (url, label, user_data) in items {
			if self.enqueue(url, label, user_data).await? {
				inserted += 1;
			}
		}

		Ok(inserted)
	}

	/// Dequeue the oldest pending entry, transitioning it to in-progress.
	pub async fn dequeue(&self) -> Result<Option<Request>> {
		let mut state = self.state.lock().await;
		let next_key = state
			.order
			.iter()
			.find(|key| matches!(state.by_key.get(*key).map(|e| e.state), Some(RequestState::Pending)))
			.cloned();

		let Some(key) = next_key else {
			return Ok(None);
		};

		let entry = state.by_key.get_mut(&key).expect("key came from by_key");

		entry.state = RequestState::InProgress;

		let snapshot = entry.clone();
		let all = state.ordered_entries();
		drop(state);

		self.rewrite_with(&all).await?;

		Ok(Some(snapshot))
	}

	/// Peek at the next pending entry without mutating queue state.
	pub async fn peek_next_pending(&self) -> Option<Request> {
		let state = self.state.lock().await;

		state
			.order
			.iter()
			.find_map(|key| state.by_key.get(key).filter(|e| e.state == RequestState::Pending).cloned())
	}

	/// Mark an in-progress entry handled.
	pub async fn mark_handled(&self, unique_key: &str) -> Result<()> {
		self.transition(unique_key, |entry| {
			entry.state = RequestState::Handled;
		})
		.await
	}

	/// Mark an in-progress entry failed, capturing `error`.
	pub async fn mark_failed(&self, unique_key: &str, error: String) -> Result<()> {
		self.transition(unique_key, |entry| {
			entry.state = RequestState::Failed;
			entry.errors.push(error);
		})
		.await
	}

	/// Return an in-progress entry to pending, incrementing its retry
	/// count and optionally capturing the error that triggered the retry.
	pub async fn requeue(&self, unique_key: &str, error: Option<String>) -> Result<()> {
		self.transition(unique_key, |entry| {
			entry.state = RequestState::Pending;
			entry.retry_count += 1;

			if let Some(error) = error {
				entry.errors.push(error);
			}
		})
		.await
	}

	/// Number of entries in the given state, or the total when `None`.
	pub async fn size(&self, state: Option<RequestState>) -> usize {
		let guard = self.state.lock().await;

		match state {
			Some(state) => guard.by_key.values().filter(|e| e.state == state).count(),
			None => guard.by_key.len(),
		}
	}

	/// Whether there is no pending or in-progress work left.
	pub async fn is_empty(&self) -> bool {
		let guard = self.state.lock().await;

		!guard.by_key.values().any(|e| matches!(e.state, RequestState::Pending | RequestState::InProgress))
	}

	/// Fetch a snapshot of a single entry by key.
	pub async fn get_entry(&self, unique_key: &str) -> Option<Request> {
		let guard = self.state.lock().await;

		guard.by_key.get(unique_key).cloned()
	}

	async fn transition(&self, unique_key: &str, apply: impl FnOnce(&mut Request)) -> Result<()> {
		let mut state = self.state.lock().await;
		let entry = state.by_key.get_mut(unique_key).ok_or_else(|| Error::UnknownRequest(unique_key.to_string()))?;

		apply(entry);

		let all = state.ordered_entries();
		drop(state);

		self.rewrite_with(&all).await
	}

	async fn rewrite(&self) -> Result<()> {
		let state = self.state.lock().await;
		let all = state.ordered_entries();
		drop(state);

		self.rewrite_with(&all).await
	}

	async fn rewrite_with(&self, entries: &[Request]) -> Result<()> {
		if let Some(persistence) = &self.persistence {
			persistence.rewrite_all(entries).await?;
		}

		Ok(())
	}
}
