//! Crawl-wide progress snapshot: discovered/completed/failed id sets,
//! persisted as a single JSON document.

// std
use std::{
	collections::HashSet,
	path::{Path, PathBuf},
};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
// self
use crate::_prelude::*;

/// On-disk representation of a crawl's progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlStateSnapshot {
	/// Source URL this state belongs to; a mismatch on load means the
	/// file is stale and is left untouched.
	pub source_url: String,
	/// Every id ever enqueued for this run.
	pub discovered_ids: Vec<String>,
	/// Ids that were handled successfully.
	pub completed_ids: Vec<String>,
	/// Ids that exhausted their retry budget.
	pub failed_ids: Vec<String>,
	/// Opaque pagination cursor for list-style seeds, if any.
	#[serde(default)]
	pub last_list_page: Option<String>,
	/// When this run first started.
	pub started_at: DateTime<Utc>,
	/// When this snapshot was last saved.
	pub updated_at: DateTime<Utc>,
}
impl CrawlStateSnapshot {
	fn empty(source_url: String) -> Self {
		let now = Utc::now();

		Self {
			source_url,
			discovered_ids: Vec::new(),
			completed_ids: Vec::new(),
			failed_ids: Vec::new(),
			last_list_page: None,
			started_at: now,
			updated_at: now,
		}
	}
}

/// Tracks and persists a [`CrawlStateSnapshot`] for one crawl run.
pub struct CrawlState {
	path: PathBuf,
	source_url: String,
	snapshot: Mutex<CrawlStateSnapshot>,
}
impl CrawlState {
	/// Construct fresh state for `source_url`, persisted at `path`.
	pub fn new(path: impl Into<PathBuf>, source_url: impl Into<String>) -> Self {
		let source_url = source_url.into();

		Self { path: path.into(), snapshot: Mutex::new(CrawlStateSnapshot::empty(source_url.clone())), source_url }
	}

	/// Attempt to load a prior snapshot from disk. Returns `false` (leaving
	/// the in-memory snapshot untouched) when the file is missing,
	/// unreadable, or was recorded for a different `source_url`.
	pub async fn load(&self) -> Result<bool> {
		let Ok(bytes) = fs::read(&self.path).await else {
			return Ok(false);
		};

		let Ok(loaded) = serde_json::from_slice::<CrawlStateSnapshot>(&bytes) else {
			return Ok(false);
		};

		if loaded.source_url != self.source_url {
			return Ok(false);
		}

		*self.snapshot.lock().await = loaded;

		Ok(true)
	}

	/// Persist the current snapshot via write-temp-then-rename.
	pub async fn save(&self) -> Result<()> {
		let mut guard = self.snapshot.lock().await;

		guard.updated_at = Utc::now();

		let body = serde_json::to_vec_pretty(&*guard)?;
		drop(guard);

		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).await?;
		}

		let tmp_path = tmp_path_for(&self.path);

		fs::write(&tmp_path, body).await?;
		fs::rename(&tmp_path, &self.path).await?;

		Ok(())
	}

	/// Record newly discovered ids, skipping ones already known.
	pub async fn add_discovered_ids(&self, ids: impl IntoIterator<Item = String>) {
		let mut guard = self.snapshot.lock().await;
		let existing: HashSet<String> = guard.discovered_ids.iter().cloned().collect();

		for id in ids {
			if !existing.contains(&id) && !guard.discovered_ids.contains(&id) {
				guard.discovered_ids.push(id);
			}
		}
	}

	/// Record `id` as completed.
	pub async fn mark_completed(&self, id: String) {
		let mut guard = self.snapshot.lock().await;

		if !guard.completed_ids.contains(&id) {
			guard.completed_ids.push(id);
		}
	}

	/// Record `id` as failed.
	pub async fn mark_failed(&self, id: String) {
		let mut guard = self.snapshot.lock().await;

		if !guard.failed_ids.contains(&id) {
			guard.failed_ids.push(id);
		}
	}

	/// Set the pagination cursor for resuming list-style seed discovery.
	pub async fn set_last_list_page(&self, page: Option<String>) {
		self.snapshot.lock().await.last_list_page = page;
	}

	/// A clone of the current snapshot.
	pub async fn snapshot(&self) -> CrawlStateSnapshot {
		self.snapshot.lock().await.clone()
	}

	/// Ids discovered but neither completed nor failed yet.
	pub async fn pending_ids(&self) -> Vec<String> {
		let guard = self.snapshot.lock().await;
		let done: HashSet<&String> = guard.completed_ids.iter().chain(guard.failed_ids.iter()).collect();

		guard.discovered_ids.iter().filter(|id| !done.contains(id)).cloned().collect()
	}
}

fn tmp_path_for(path: &Path) -> PathBuf {
	let mut file_name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();

	file_name.push(".tmp");
	path.with_file_name(file_name)
}
