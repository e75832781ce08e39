//! Label-based dispatch from a [`crate::queue::Request`] to user handler code.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
// self
use crate::{_prelude::*, orchestrator::HandlerContext, queue::Request};

/// Result type returned by [`Handler::handle`]. A handler communicates
/// failure as a message rather than [`crate::Error`], since that message
/// is what the retry classifier consumes.
pub type HandlerResult = std::result::Result<(), String>;

/// User-supplied page-handling logic, dispatched to by [`Router`].
#[async_trait]
pub trait Handler: Send + Sync {
	/// Handle one request: fetch, extract, push data, enqueue discovered
	/// links, as the implementation sees fit.
	async fn handle(&self, ctx: HandlerContext) -> HandlerResult;
}

/// Routes requests to a [`Handler`] by label, falling back to a default
/// handler when one is configured.
#[derive(Default)]
pub struct Router {
	handlers: HashMap<String, Arc<dyn Handler>>,
	default: Option<Arc<dyn Handler>>,
}
impl Router {
	/// Construct an empty router.
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `handler` for `label`.
	pub fn add_handler(&mut self, label: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
		self.handlers.insert(label.into(), Arc::new(handler));

		self
	}

	/// Register the fallback handler used for unlabeled requests or
	/// labels with no registered handler.
	pub fn add_default_handler(&mut self, handler: impl Handler + 'static) -> &mut Self {
		self.default = Some(Arc::new(handler));

		self
	}

	/// Resolve the handler for `request`.
	pub fn route(&self, request: &Request) -> Result<Arc<dyn Handler>> {
		if let Some(label) = &request.label
			&& let Some(handler) = self.handlers.get(label)
		{
			return Ok(handler.clone());
		}

		self.default.clone().ok_or_else(|| Error::UnknownLabel { label: request.label.clone().unwrap_or_default() })
	}
}
