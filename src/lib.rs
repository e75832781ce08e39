//! Resilient concurrent web-crawl orchestrator core — durable FIFO queue, rate
//! limiting, session rotation, and classified retry, built for modern Rust
//! crawling systems.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod crawl_state;
pub mod engine;
pub mod error_snapshot;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod router;
pub mod session;

mod error;
mod _prelude {
	pub use std::{
		sync::Arc,
		time::{Duration, SystemTime},
	};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	crawl_state::{CrawlState, CrawlStateSnapshot},
	engine::{Engine, EnginePool, FetchOptions, FetchResponse},
	error::{Error, Result},
	error_snapshot::ErrorSnapshotWriter,
	orchestrator::{HandlerContext, Orchestrator, OrchestratorConfig, OrchestratorConfigBuilder},
	progress::ProgressWriter,
	queue::{Request, RequestQueue, RequestState},
	rate_limiter::RateLimiter,
	retry::{ErrorKind, RetryDecision, RetryStrategy},
	router::{Handler, Router},
	session::{Session, SessionPool, SessionState},
};
