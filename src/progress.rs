//! Crash-safe JSONL progress log: one line per successfully handled item.

// std
use std::path::{Path, PathBuf};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::{
	fs,
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	sync::Mutex,
};
// self
use crate::_prelude::*;

/// A single line of the progress log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEntry {
	/// Caller-supplied identifier for the item (typically the source URL).
	pub id: String,
	/// Milliseconds since the Unix epoch when the entry was written.
	pub timestamp: i64,
	/// The extracted record itself.
	pub data: serde_json::Value,
}

/// Appends extracted records to a `.tmp` progress file during a run and
/// renames it to the final output path on [`ProgressWriter::finalize`].
pub struct ProgressWriter {
	tmp_path: PathBuf,
	output_path: PathBuf,
	file: Mutex<Option<fs::File>>,
}
impl ProgressWriter {
	/// Bind a writer to `output_path`; the active log lives alongside it at
	/// `output_path` with a `.tmp` suffix until finalized.
	pub fn new(output_path: impl Into<PathBuf>) -> Self {
		let output_path = output_path.into();
		let tmp_path = tmp_path_for(&output_path);

		Self { tmp_path, output_path, file: Mutex::new(None) }
	}

	/// Open (or create) the active log file for appending. If no `.tmp` is
	/// present but a finalized output from a prior run is, that output is
	/// copied forward into the new `.tmp` first, so entries already recorded
	/// before a resume stay visible to [`Self::read_completed_ids`] instead
	/// of being shadowed by a blank log.
	pub async fn initialize(&self) -> Result<()> {
		if let Some(parent) = self.tmp_path.parent() {
			fs::create_dir_all(parent).await?;
		}

		if fs::metadata(&self.tmp_path).await.is_err() {
			if let Ok(previous) = fs::read(&self.output_path).await {
				fs::write(&self.tmp_path, previous).await?;
			}
		}

		let file = fs::OpenOptions::new().create(true).append(true).open(&self.tmp_path).await?;

		*self.file.lock().await = Some(file);

		Ok(())
	}

	/// Append one record, serialized as a single JSON line.
	pub async fn append(&self, id: impl Into<String>, data: serde_json::Value) -> Result<()> {
		let entry = ProgressEntry {
			id: id.into(),
			timestamp: SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_millis() as i64,
			data,
		};
		let mut line = serde_json::to_string(&entry)?;

		line.push('\n');

		let mut guard = self.file.lock().await;
		let file = match guard.as_mut() {
			Some(file) => file,
			None => {
				drop(guard);
				self.initialize().await?;
				guard = self.file.lock().await;
				guard.as_mut().expect("just initialized")
			},
		};

		file.write_all(line.as_bytes()).await?;
		file.flush().await?;

		Ok(())
	}

	/// Rename the active `.tmp` log to its final output path. Idempotent:
	/// a second call with no `.tmp` file present is a no-op.
	pub async fn finalize(&self) -> Result<()> {
		*self.file.lock().await = None;

		match fs::rename(&self.tmp_path, &self.output_path).await {
			Ok(()) => Ok(()),
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(error) => Err(error.into()),
		}
	}

	/// Distinct ids already present in the log (active `.tmp` if present,
	/// otherwise the finalized output), for skipping already-completed
	/// seeds on resume. Malformed lines are skipped.
	pub async fn read_completed_ids(&self) -> Result<std::collections::HashSet<String>> {
		let path = if fs::metadata(&self.tmp_path).await.is_ok() { &self.tmp_path } else { &self.output_path };

		let mut ids = std::collections::HashSet::new();

		for entry in read_entries(path).await? {
			ids.insert(entry.id);
		}

		Ok(ids)
	}

	/// All entries currently in the log (active `.tmp` if present,
	/// otherwise the finalized output).
	pub async fn read_all(&self) -> Result<Vec<ProgressEntry>> {
		let path = if fs::metadata(&self.tmp_path).await.is_ok() { &self.tmp_path } else { &self.output_path };

		read_entries(path).await
	}
}

async fn read_entries(path: &Path) -> Result<Vec<ProgressEntry>> {
	let Ok(file) = fs::File::open(path).await else {
		return Ok(Vec::new());
	};

	let mut reader = BufReader::new(file).lines();
	let mut entries = Vec::new();

	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}

		match serde_json::from_str(&line) {
			Ok(entry) => entries.push(entry),
			Err(error) => tracing::warn!(%error, "skipping malformed progress record"),
		}
	}

	Ok(entries)
}

fn tmp_path_for(path: &Path) -> PathBuf {
	let mut file_name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();

	file_name.push(".tmp");
	path.with_file_name(file_name)
}
