//! Writes a bounded number of diagnostic snapshots for failed requests.

// std
use std::{
	collections::HashMap,
	path::PathBuf,
	sync::atomic::{AtomicUsize, Ordering},
};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::fs;
// self
use crate::_prelude::*;

/// Diagnostic body written alongside a failed request's id.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSnapshot {
	/// URL that failed.
	pub url: String,
	/// HTTP status code, when one was observed.
	pub status_code: Option<u16>,
	/// Response headers captured at failure time.
	#[serde(default)]
	pub response_headers: HashMap<String, String>,
	/// Human-readable error message.
	pub error_message: String,
	/// The [`crate::retry::ErrorKind`] classification, as text.
	pub error_class: String,
	/// CSS/XPath selector that matched a CAPTCHA challenge, if detected
	/// upstream.
	pub captcha_selector: Option<String>,
	/// Milliseconds since the Unix epoch when the snapshot was written.
	pub timestamp: i64,
}

/// Writes at most `max_snapshots` diagnostic files into a directory, then
/// silently stops.
pub struct ErrorSnapshotWriter {
	dir: PathBuf,
	max_snapshots: usize,
	count: AtomicUsize,
}
impl ErrorSnapshotWriter {
	/// Bind a writer to `dir`, capping total output at `max_snapshots`.
	pub fn new(dir: impl Into<PathBuf>, max_snapshots: usize) -> Self {
		Self { dir: dir.into(), max_snapshots, count: AtomicUsize::new(0) }
	}

	/// Create the output directory and count any snapshots already present
	/// (e.g. from a prior crashed run), so the cap is respected across
	/// resumes.
	pub async fn initialize(&self) -> Result<()> {
		fs::create_dir_all(&self.dir).await?;

		let mut entries = fs::read_dir(&self.dir).await?;
		let mut existing = 0usize;

		while let Some(entry) = entries.next_entry().await? {
			if entry.path().extension().is_some_and(|ext| ext == "json") {
				existing += 1;
			}
		}

		self.count.store(existing, Ordering::SeqCst);

		Ok(())
	}

	/// Write a snapshot for `id`, optionally alongside the raw `html` that
	/// produced it. Returns `false` without writing once the cap is
	/// reached. IO failures are logged and treated as `false` rather than
	/// propagated, since a snapshot is best-effort diagnostics.
	pub async fn write(&self, id: &str, snapshot: &ErrorSnapshot, html: Option<&str>) -> bool {
		if self.count.load(Ordering::SeqCst) >= self.max_snapshots {
			return false;
		}

		let base = format!("{}-{}", sanitize_id(id), snapshot.timestamp);
		let json_path = self.dir.join(format!("{base}.json"));

		let body = match serde_json::to_vec_pretty(snapshot) {
			Ok(body) => body,
			Err(error) => {
				tracing::warn!(%error, id, "failed to serialize error snapshot");

				return false;
			},
		};

		if let Err(error) = fs::write(&json_path, body).await {
			tracing::warn!(%error, id, "failed to write error snapshot");

			return false;
		}

		if let Some(html) = html {
			let html_path = self.dir.join(format!("{base}.html"));

			if let Err(error) = fs::write(&html_path, html).await {
				tracing::warn!(%error, id, "failed to write error snapshot html");
			}
		}

		self.count.fetch_add(1, Ordering::SeqCst);

		true
	}

	/// Number of snapshots written so far.
	pub fn count(&self) -> usize {
		self.count.load(Ordering::SeqCst)
	}
}

fn sanitize_id(id: &str) -> String {
	id.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').take(100).collect()
}
