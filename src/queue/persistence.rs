//! JSONL persistence for the request queue: append-only writes during
//! normal operation, full-file write-temp-then-rename on state mutation,
//! and a replay path for crash recovery.

// std
use std::path::{Path, PathBuf};
// crates.io
use tokio::{
	fs,
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
};
// self
use super::Request;
use crate::_prelude::*;

/// Reads and rewrites a queue's on-disk JSONL representation.
pub struct QueuePersistence {
	path: PathBuf,
}
impl QueuePersistence {
	/// Bind persistence to `path`. The file is created lazily on first write.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// Replay the file, reconstructing entries keyed by `unique_key`.
	/// Duplicate keys keep their first occurrence; malformed lines are
	/// skipped. Returns entries in first-seen order.
	pub async fn replay(&self) -> Result<Vec<Request>> {
		let Ok(file) = fs::File::open(&self.path).await else {
			return Ok(Vec::new());
		};

		let mut reader = BufReader::new(file).lines();
		let mut seen = std::collections::HashSet::new();
		let mut entries = Vec::new();

		while let Some(line) = reader.next_line().await? {
			if line.trim().is_empty() {
				continue;
			}

			match serde_json::from_str::<Request>(&line) {
				Ok(entry) =>
					if seen.insert(entry.unique_key.clone()) {
						entries.push(entry);
					},
				Err(error) => tracing::warn!(%error, "skipping malformed queue record"),
			}
		}

		Ok(entries)
	}

	/// Append a single entry to the file without rewriting the rest.
	pub async fn append(&self, entry: &Request) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).await?;
		}

		let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
		let mut line = serde_json::to_string(entry)?;

		line.push('\n');
		file.write_all(line.as_bytes()).await?;
		file.flush().await?;

		Ok(())
	}

	/// Rewrite the whole file to reflect `entries`, atomically via a
	/// temp-file-then-rename.
	pub async fn rewrite_all(&self, entries: &[Request]) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).await?;
		}

		let tmp_path = tmp_path_for(&self.path);
		let mut body = String::new();

		for entry in entries {
			body.push_str(&serde_json::to_string(entry)?);
			body.push('\n');
		}

		fs::write(&tmp_path, body).await?;
		fs::rename(&tmp_path, &self.path).await?;

		Ok(())
	}
}

fn tmp_path_for(path: &Path) -> PathBuf {
	let mut file_name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();

	file_name.push(".tmp");
	path.with_file_name(file_name)
}
