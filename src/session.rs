//! Identity/credential rotation: a bounded pool of [`Session`]s in
//! health-tracked rotation.

// std
use std::cell::RefCell;
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
// self
use crate::_prelude::*;

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Health state of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
	/// Usable now.
	Healthy,
	/// Recently failed; ineligible until its cooldown elapses.
	Degraded,
	/// Retired; will be replaced by a fresh session on next acquisition.
	Blocked,
}

/// A single rotation-managed identity/credential slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
	/// Opaque identifier, unique within the pool's lifetime.
	pub id: u64,
	/// Optional proxy URL associated with this session.
	pub proxy_url: Option<String>,
	/// Current health state.
	pub state: SessionState,
	/// Number of requests this session has been used for.
	pub usage_count: u32,
	/// Consecutive failures since its last success.
	pub consecutive_errors: u32,
	#[serde(skip, default = "Instant::now")]
	created_at: Instant,
	#[serde(skip, default = "Instant::now")]
	degraded_until: Instant,
}
impl Session {
	fn new(id: u64, proxy_url: Option<String>) -> Self {
		let now = Instant::now();

		Self {
			id,
			proxy_url,
			state: SessionState::Healthy,
			usage_count: 0,
			consecutive_errors: 0,
			created_at: now,
			degraded_until: now,
		}
	}

	/// Record a successful use: clears the error streak and heals a
	/// degraded session back to healthy. Retires the session in place if it
	/// has now crossed its usage or age ceiling.
	pub fn mark_good(&mut self, max_usage_count: u32, max_age: Duration) {
		self.usage_count += 1;
		self.consecutive_errors = 0;

		if self.state == SessionState::Degraded {
			self.state = SessionState::Healthy;
		}

		self.auto_retire_if_eligible(max_usage_count, max_age);
	}

	/// Record a failed use. Escalates to degraded after repeated failures.
	/// Retires the session in place if it has now crossed its usage or age
	/// ceiling.
	pub fn mark_bad(&mut self, degraded_after_errors: u32, cooldown: Duration, max_usage_count: u32, max_age: Duration) {
		self.usage_count += 1;
		self.consecutive_errors += 1;

		if self.consecutive_errors >= degraded_after_errors && self.state == SessionState::Healthy {
			self.state = SessionState::Degraded;
			self.degraded_until = Instant::now() + cooldown;
		}

		self.auto_retire_if_eligible(max_usage_count, max_age);
	}

	/// Retire this session; it will be replaced on next acquisition.
	pub fn retire(&mut self) {
		self.state = SessionState::Blocked;
	}

	fn auto_retire_if_eligible(&mut self, max_usage_count: u32, max_age: Duration) {
		if self.usage_count >= max_usage_count || self.created_at.elapsed() >= max_age {
			self.retire();
		}
	}

	fn is_usable(&mut self, max_usage_count: u32, max_age: Duration) -> bool {
		self.auto_retire_if_eligible(max_usage_count, max_age);

		match self.state {
			SessionState::Blocked => false,
			SessionState::Degraded => Instant::now() >= self.degraded_until,
			SessionState::Healthy => true,
		}
	}
}

/// Configuration governing session lifecycle and eligibility.
#[derive(Clone, Copy, Debug)]
pub struct SessionPoolConfig {
	/// Number of sessions the pool manages.
	pub pool_size: usize,
	/// Uses after which a session is retired and replaced.
	pub max_usage_count: u32,
	/// Age after which a session is retired and replaced, regardless of use.
	pub max_age: Duration,
	/// Cooldown a degraded session must sit out before reuse.
	pub cooldown: Duration,
	/// Consecutive failures before a session is marked degraded.
	pub degraded_after_errors: u32,
}
impl Default for SessionPoolConfig {
	fn default() -> Self {
		Self {
			pool_size: 5,
			max_usage_count: 200,
			max_age: Duration::from_secs(60 * 60),
			cooldown: Duration::from_secs(30),
			degraded_after_errors: 3,
		}
	}
}

struct PoolState {
	idle: Vec<Session>,
	checked_out: usize,
	next_id: u64,
}

/// Bounded pool of [`Session`]s, checked out and explicitly released by
/// workers, same discipline as [`crate::engine::EnginePool`].
pub struct SessionPool {
	state: Mutex<PoolState>,
	config: SessionPoolConfig,
}
impl SessionPool {
	/// Construct a pool pre-populated with `config.pool_size` fresh sessions.
	pub fn new(config: SessionPoolConfig) -> Self {
		let idle = (0..config.pool_size as u64).map(|id| Session::new(id, None)).collect();

		Self { state: Mutex::new(PoolState { idle, checked_out: 0, next_id: config.pool_size as u64 }), config }
	}

	/// Acquire a random usable session, replacing any blocked slot with a
	/// fresh one first. Returns `None` if no session is currently usable.
	pub async fn acquire(&self) -> Option<Session> {
		let mut state = self.state.lock().await;

		for session in &mut state.idle {
			if session.state == SessionState::Blocked {
				let next_id = state.next_id;

				state.next_id += 1;
				*session = Session::new(next_id, session.proxy_url.clone());
			}
		}

		let max_usage = self.config.max_usage_count;
		let max_age = self.config.max_age;
		let usable: Vec<usize> = state
			.idle
			.iter_mut()
			.enumerate()
			.filter(|(_, session)| session.is_usable(max_usage, max_age))
			.map(|(index, _)| index)
			.collect();

		if usable.is_empty() {
			return None;
		}

		let pick = SMALL_RNG.with(|cell| cell.borrow_mut().random_range(0..usable.len()));
		let index = usable[pick];
		let session = state.idle.remove(index);

		state.checked_out += 1;

		Some(session)
	}

	/// Return a checked-out session to the pool.
	pub async fn release(&self, mut session: Session) {
		let mut state = self.state.lock().await;

		session.state = match session.state {
			SessionState::Degraded if Instant::now() >= session.degraded_until => SessionState::Healthy,
			other => other,
		};

		state.idle.push(session);
		state.checked_out = state.checked_out.saturating_sub(1);
	}

	/// Wrap a successful use with the configured usage/age ceilings and
	/// return the session for release.
	pub fn record_success(&self, mut session: Session) -> Session {
		session.mark_good(self.config.max_usage_count, self.config.max_age);

		session
	}

	/// Wrap a failed use with the configured degradation policy and return
	/// the session for release.
	pub fn record_failure(&self, mut session: Session) -> Session {
		session.mark_bad(self.config.degraded_after_errors, self.config.cooldown, self.config.max_usage_count, self.config.max_age);

		session
	}

	/// Total sessions currently managed (idle + checked out). Always equal
	/// to `config.pool_size`.
	pub async fn total_managed(&self) -> usize {
		let state = self.state.lock().await;

		state.idle.len() + state.checked_out
	}

	/// No persistent resources to release; logs a final health summary.
	pub async fn shutdown(&self) {
		let state = self.state.lock().await;
		let healthy = state.idle.iter().filter(|s| s.state == SessionState::Healthy).count();

		tracing::debug!(total = state.idle.len(), healthy, "session pool shutting down");
	}
}
