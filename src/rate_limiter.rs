//! Token-bucket rate limiter shared across all workers.

// crates.io
use tokio::sync::Mutex;
// self
use crate::_prelude::*;

struct Bucket {
	tokens: f64,
	last_refill: Instant,
}

/// A capacity-1 token bucket refilled at `requests_per_minute / 60` tokens
/// per second, serialized across concurrent acquirers.
pub struct RateLimiter {
	bucket: Mutex<Bucket>,
	rate_per_sec: f64,
}
impl RateLimiter {
	/// Construct a limiter admitting at most `requests_per_minute` requests
	/// per minute, on average.
	pub fn new(requests_per_minute: u32) -> Self {
		Self {
			bucket: Mutex::new(Bucket { tokens: 1.0, last_refill: Instant::now() }),
			rate_per_sec: f64::from(requests_per_minute) / 60.0,
		}
	}

	/// Suspend the caller until a token is available, then consume it.
	pub async fn acquire(&self) {
		loop {
			let wait = {
				let mut bucket = self.bucket.lock().await;

				self.refill(&mut bucket);

				if bucket.tokens >= 1.0 {
					bucket.tokens -= 1.0;

					return;
				}

				let deficit = 1.0 - bucket.tokens;

				Duration::from_secs_f64(deficit / self.rate_per_sec)
			};

			tokio::time::sleep(wait).await;
		}
	}

	/// Attempt to consume a token without suspending; returns whether one
	/// was available.
	pub async fn try_acquire(&self) -> bool {
		let mut bucket = self.bucket.lock().await;

		self.refill(&mut bucket);

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;

			true
		} else {
			false
		}
	}

	/// Reset the bucket to a full token, as if freshly constructed.
	pub async fn reset(&self) {
		let mut bucket = self.bucket.lock().await;

		bucket.tokens = 1.0;
		bucket.last_refill = Instant::now();
	}

	fn refill(&self, bucket: &mut Bucket) {
		let now = Instant::now();
		let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();

		bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(1.0);
		bucket.last_refill = now;
	}
}
