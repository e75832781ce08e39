//! Error classification and retry/backoff/session-rotation decisions.
//!
//! Both halves are pure functions of their inputs: no I/O, no shared state,
//! nothing to mock in tests.

// std
use std::cell::RefCell;
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
// self
use crate::{_prelude::*, engine::FetchResponse};

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Coarse classification assigned to a handler failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
	/// Origin explicitly blocked the request (CAPTCHA, 403, ...).
	HardBlock,
	/// Origin is throttling (429, "too many requests").
	SoftBlock,
	/// Transient network-layer failure (timeout, connection reset, ...).
	Network,
	/// Page content could not be parsed/extracted.
	Parse,
	/// Anything else — a bug in handler code, an unexpected panic message, etc.
	System,
}

/// What the orchestrator should do in response to a classified failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
	/// How long to wait before the request becomes eligible again.
	pub delay: Duration,
	/// Whether the session that produced the failure should be rotated out.
	pub rotate_session: bool,
	/// Whether the request should be requeued at all.
	pub should_retry: bool,
}

/// Classifies failures and decides how to respond to them.
///
/// Configured with the run's retry ceiling; otherwise stateless.
#[derive(Clone, Debug)]
pub struct RetryStrategy {
	max_retries: u32,
}
impl RetryStrategy {
	/// Construct a strategy that permits up to `max_retries` retries per
	/// request before giving up.
	pub fn new(max_retries: u32) -> Self {
		Self { max_retries }
	}

	/// Classify a handler failure, given the last fetch response observed
	/// (if any) and the error message the handler raised.
	pub fn classify(&self, last_response: Option<&FetchResponse>, error_message: &str) -> ErrorKind {
		let message = error_message.to_lowercase();
		let (blocked, captcha, unsupported) = match last_response {
			Some(FetchResponse::Error { error_code, captcha_detected, .. }) => (
				*error_code == crate::engine::ErrorCode::Blocked,
				*captcha_detected,
				*error_code == crate::engine::ErrorCode::UnsupportedInteraction,
			),
			_ => (false, false, false),
		};

		if blocked || captcha || message.contains("403") {
			return ErrorKind::HardBlock;
		}
		if message.contains("429") || message.contains("too many requests") {
			return ErrorKind::SoftBlock;
		}
		const NETWORK_NEEDLES: &[&str] =
			&["timeout", "timed out", "econnreset", "econnrefused", "enotfound", "socket hang up", "network"];
		if NETWORK_NEEDLES.iter().any(|needle| message.contains(needle)) {
			return ErrorKind::Network;
		}
		const PARSE_NEEDLES: &[&str] = &["parse", "extract", "selector"];
		if unsupported || PARSE_NEEDLES.iter().any(|needle| message.contains(needle)) {
			return ErrorKind::Parse;
		}

		ErrorKind::System
	}

	/// Decide how to respond to a classified failure at `retry_count`
	/// prior attempts.
	pub fn decide(&self, kind: ErrorKind, retry_count: u32) -> RetryDecision {
		let under_ceiling = retry_count < self.max_retries;

		match kind {
			ErrorKind::HardBlock => RetryDecision {
				delay: random_within(Duration::from_millis(2_000), Duration::from_millis(4_000)),
				rotate_session: true,
				should_retry: under_ceiling,
			},
			ErrorKind::SoftBlock => {
				let backoff_ms = 1_000u64.saturating_mul(1u64 << retry_count.min(8));

				RetryDecision {
					delay: Duration::from_millis(backoff_ms.min(4_000)),
					rotate_session: false,
					should_retry: under_ceiling,
				}
			},
			ErrorKind::Network => {
				RetryDecision { delay: Duration::ZERO, rotate_session: false, should_retry: under_ceiling }
			},
			ErrorKind::Parse | ErrorKind::System => {
				RetryDecision { delay: Duration::ZERO, rotate_session: false, should_retry: false }
			},
		}
	}
}

fn random_within(min: Duration, max: Duration) -> Duration {
	if max <= min {
		return max;
	}

	SMALL_RNG.with(|cell| {
		let mut rng = cell.borrow_mut();
		let nanos = max.as_nanos() - min.as_nanos();
		let jitter = rng.random_range(0..=nanos.min(u64::MAX as u128));

		min + Duration::from_nanos(jitter as u64)
	})
}
