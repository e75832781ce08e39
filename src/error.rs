//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the crawl orchestrator crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),

	#[error("Engine failure: {0}")]
	EngineFailure(String),
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("No handler registered for label '{label}' and no default handler configured.")]
	UnknownLabel { label: String },
	#[error("Request with unique key '{0}' was not found in the queue.")]
	UnknownRequest(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
#[cfg(feature = "prometheus")]
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}
