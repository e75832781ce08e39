//! End-to-end orchestrator runs against a scripted engine.

use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use crawl_orchestrator::{
	FetchOptions, FetchResponse, Handler, HandlerContext, Orchestrator, OrchestratorConfigBuilder, Router,
};
use crawl_orchestrator::engine::{ErrorCode, FetchMetadata};
use crawl_orchestrator::orchestrator::SeedRequest;
use crawl_orchestrator::session::SessionPoolConfig;
use tokio::sync::Mutex;

use super::scripted_engine::ScriptedEngine;

struct RecordingHandler;
#[async_trait]
impl Handler for RecordingHandler {
	async fn handle(&self, ctx: HandlerContext) -> Result<(), String> {
		let response = ctx.fetch_page(FetchOptions::default()).await;

		match response {
			FetchResponse::Success { content, .. } => {
				ctx.push_data(ctx.request().url.clone(), serde_json::json!({ "content": content }))
					.await
					.map_err(|error| error.to_string())?;

				Ok(())
			},
			FetchResponse::Error { error, .. } => Err(error),
		}
	}
}

fn test_dirs() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
	let dir = tempfile::tempdir().unwrap();
	let output = dir.path().join("output.jsonl");
	let state = dir.path().join("state.json");
	let snapshots = dir.path().join("errors");

	(dir, output, state, snapshots)
}

#[tokio::test]
async fn handles_every_seed_and_writes_a_progress_line_each() {
	let (_dir, output, state, snapshots) = test_dirs();
	let engine = ScriptedEngine::new();

	let config = OrchestratorConfigBuilder::new("https://example.com")
		.max_concurrency(2)
		.max_requests_per_minute(6_000)
		.output_path(&output)
		.state_path(&state)
		.error_snapshot_dir(&snapshots)
		.engine_factory(ScriptedEngine::factory(engine.clone()))
		.build()
		.unwrap();

	let mut router = Router::new();
	router.add_default_handler(RecordingHandler);

	let orchestrator = Orchestrator::new(config, router);
	let seeds =
		vec![SeedRequest::new("https://example.com/a"), SeedRequest::new("https://example.com/b")];

	let summary = orchestrator.run(seeds, None).await.unwrap();

	assert_eq!(summary.handled, 2);
	assert_eq!(summary.failed, 0);

	let contents = tokio::fs::read_to_string(&output).await.unwrap();
	assert_eq!(contents.lines().count(), 2);
}

#[tokio::test]
async fn soft_block_is_retried_until_it_succeeds() {
	let (_dir, output, state, snapshots) = test_dirs();
	let engine = ScriptedEngine::new();

	engine
		.script(
			"https://example.com/throttled",
			vec![
				FetchResponse::Error {
					error: "429 too many requests".into(),
					error_code: ErrorCode::Unexpected,
					metadata: FetchMetadata::default(),
					captcha_detected: false,
				},
				FetchResponse::Success {
					title: None,
					content: "ok".into(),
					metadata: FetchMetadata::default(),
				},
			],
		)
		.await;

	let config = OrchestratorConfigBuilder::new("https://example.com")
		.max_concurrency(1)
		.max_requests_per_minute(6_000)
		.max_retries(3)
		.output_path(&output)
		.state_path(&state)
		.error_snapshot_dir(&snapshots)
		.engine_factory(ScriptedEngine::factory(engine.clone()))
		.build()
		.unwrap();

	let mut router = Router::new();
	router.add_default_handler(RecordingHandler);

	let orchestrator = Orchestrator::new(config, router);
	let summary = orchestrator.run(vec![SeedRequest::new("https://example.com/throttled")], None).await.unwrap();

	assert_eq!(summary.handled, 1);
	assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn hard_block_exhausts_retries_and_writes_an_error_snapshot() {
	let (_dir, output, state, snapshots) = test_dirs();
	let engine = ScriptedEngine::new();

	engine
		.script(
			"https://example.com/blocked",
			vec![FetchResponse::Error {
				error: "blocked".into(),
				error_code: ErrorCode::Blocked,
				metadata: FetchMetadata::default(),
				captcha_detected: false,
			}],
		)
		.await;

	let config = OrchestratorConfigBuilder::new("https://example.com")
		.max_concurrency(1)
		.max_requests_per_minute(6_000)
		.max_retries(1)
		.output_path(&output)
		.state_path(&state)
		.error_snapshot_dir(&snapshots)
		.session_pool(SessionPoolConfig { pool_size: 1, ..Default::default() })
		.engine_factory(ScriptedEngine::factory(engine.clone()))
		.build()
		.unwrap();

	let mut router = Router::new();
	router.add_default_handler(RecordingHandler);

	let orchestrator = Orchestrator::new(config, router);
	let summary = orchestrator.run(vec![SeedRequest::new("https://example.com/blocked")], None).await.unwrap();

	assert_eq!(summary.handled, 0);
	assert_eq!(summary.failed, 1);

	let mut entries = tokio::fs::read_dir(&snapshots).await.unwrap();
	let mut found = false;

	while let Some(entry) = entries.next_entry().await.unwrap() {
		if entry.path().extension().is_some_and(|ext| ext == "json") {
			found = true;
		}
	}

	assert!(found, "expected an error snapshot to be written");
}

#[tokio::test]
async fn discovered_links_are_enqueued_and_handled_in_the_same_run() {
	let (_dir, output, state, snapshots) = test_dirs();
	let engine = ScriptedEngine::new();

	struct DiscoveringHandler;
	#[async_trait]
	impl Handler for DiscoveringHandler {
		async fn handle(&self, ctx: HandlerContext) -> Result<(), String> {
			let response = ctx.fetch_page(FetchOptions::default()).await;

			if ctx.request().url == "https://example.com/start" {
				ctx.enqueue("https://example.com/discovered", None, None).await.map_err(|e| e.to_string())?;
			}

			match response {
				FetchResponse::Success { content, .. } => {
					ctx.push_data(ctx.request().url.clone(), serde_json::json!({ "content": content }))
						.await
						.map_err(|error| error.to_string())?;

					Ok(())
				},
				FetchResponse::Error { error, .. } => Err(error),
			}
		}
	}

	let config = OrchestratorConfigBuilder::new("https://example.com")
		.max_concurrency(1)
		.max_requests_per_minute(6_000)
		.output_path(&output)
		.state_path(&state)
		.error_snapshot_dir(&snapshots)
		.engine_factory(ScriptedEngine::factory(engine.clone()))
		.build()
		.unwrap();

	let mut router = Router::new();
	router.add_default_handler(DiscoveringHandler);

	let orchestrator = Orchestrator::new(config, router);
	let summary = orchestrator.run(vec![SeedRequest::new("https://example.com/start")], None).await.unwrap();

	assert_eq!(summary.handled, 2);

	let contents = tokio::fs::read_to_string(&output).await.unwrap();
	assert!(contents.contains("discovered"));
}

#[tokio::test]
async fn never_exceeds_the_configured_concurrency_bound() {
	let (_dir, output, state, snapshots) = test_dirs();
	let engine = ScriptedEngine::new();

	struct SlowHandler {
		current: Arc<AtomicUsize>,
		peak: Arc<AtomicUsize>,
	}
	#[async_trait]
	impl Handler for SlowHandler {
		async fn handle(&self, ctx: HandlerContext) -> Result<(), String> {
			let in_flight = self.current.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(in_flight, Ordering::SeqCst);

			tokio::time::sleep(std::time::Duration::from_millis(50)).await;

			let response = ctx.fetch_page(FetchOptions::default()).await;
			self.current.fetch_sub(1, Ordering::SeqCst);

			match response {
				FetchResponse::Success { content, .. } => {
					ctx.push_data(ctx.request().url.clone(), serde_json::json!({ "content": content }))
						.await
						.map_err(|error| error.to_string())?;

					Ok(())
				},
				FetchResponse::Error { error, .. } => Err(error),
			}
		}
	}

	let current = Arc::new(AtomicUsize::new(0));
	let peak = Arc::new(AtomicUsize::new(0));

	let config = OrchestratorConfigBuilder::new("https://example.com")
		.max_concurrency(2)
		.max_requests_per_minute(6_000_000)
		.output_path(&output)
		.state_path(&state)
		.error_snapshot_dir(&snapshots)
		.engine_factory(ScriptedEngine::factory(engine.clone()))
		.build()
		.unwrap();

	let mut router = Router::new();
	router.add_default_handler(SlowHandler { current: current.clone(), peak: peak.clone() });

	let orchestrator = Orchestrator::new(config, router);
	let seeds = vec![
		SeedRequest::new("https://example.com/1"),
		SeedRequest::new("https://example.com/2"),
		SeedRequest::new("https://example.com/3"),
		SeedRequest::new("https://example.com/4"),
	];

	let summary = orchestrator.run(seeds, None).await.unwrap();

	assert_eq!(summary.handled, 4);
	assert!(peak.load(Ordering::SeqCst) <= 2, "observed concurrency exceeded max_concurrency");
	assert!(peak.load(Ordering::SeqCst) >= 2, "test never actually observed two handlers in flight at once");
}

#[tokio::test]
async fn hard_block_rotates_session_then_retried_fetch_succeeds() {
	let (_dir, output, state, snapshots) = test_dirs();
	let engine = ScriptedEngine::new();

	engine
		.script(
			"https://example.com/blocked-once",
			vec![
				FetchResponse::Error {
					error: "blocked".into(),
					error_code: ErrorCode::Blocked,
					metadata: FetchMetadata::default(),
					captcha_detected: false,
				},
				FetchResponse::Success {
					title: None,
					content: "ok after rotation".into(),
					metadata: FetchMetadata::default(),
				},
			],
		)
		.await;

	let config = OrchestratorConfigBuilder::new("https://example.com")
		.max_concurrency(1)
		.max_requests_per_minute(6_000)
		.max_retries(2)
		.output_path(&output)
		.state_path(&state)
		.error_snapshot_dir(&snapshots)
		.session_pool(SessionPoolConfig { pool_size: 1, ..Default::default() })
		.engine_factory(ScriptedEngine::factory(engine.clone()))
		.build()
		.unwrap();

	let mut router = Router::new();
	router.add_default_handler(RecordingHandler);

	let orchestrator = Orchestrator::new(config, router);
	let summary =
		orchestrator.run(vec![SeedRequest::new("https://example.com/blocked-once")], None).await.unwrap();

	assert_eq!(summary.handled, 1);
	assert_eq!(summary.failed, 0);
	assert_eq!(engine.call_count("https://example.com/blocked-once").await, 2);

	let contents = tokio::fs::read_to_string(&output).await.unwrap();
	assert!(contents.contains("ok after rotation"));
}

#[tokio::test]
async fn resume_skips_seeds_already_recorded_as_completed() {
	let (dir, output, state, snapshots) = test_dirs();
	let queue_path = dir.path().join("queue.jsonl");
	let engine = ScriptedEngine::new();

	let config_for = |resume: bool| {
		OrchestratorConfigBuilder::new("https://example.com")
			.max_concurrency(1)
			.max_requests_per_minute(6_000)
			.queue_path(&queue_path)
			.output_path(&output)
			.state_path(&state)
			.error_snapshot_dir(&snapshots)
			.resume(resume)
			.engine_factory(ScriptedEngine::factory(engine.clone()))
			.build()
			.unwrap()
	};

	let mut first_router = Router::new();
	first_router.add_default_handler(RecordingHandler);

	let first_run = Orchestrator::new(config_for(false), first_router);
	let first_summary = first_run
		.run(vec![SeedRequest::new("https://example.com/u1"), SeedRequest::new("https://example.com/u2")], None)
		.await
		.unwrap();

	assert_eq!(first_summary.handled, 2);

	struct TrackingHandler {
		invoked: Arc<Mutex<Vec<String>>>,
	}
	#[async_trait]
	impl Handler for TrackingHandler {
		async fn handle(&self, ctx: HandlerContext) -> Result<(), String> {
			self.invoked.lock().await.push(ctx.request().url.clone());

			let response = ctx.fetch_page(FetchOptions::default()).await;

			match response {
				FetchResponse::Success { content, .. } => {
					ctx.push_data(ctx.request().url.clone(), serde_json::json!({ "content": content }))
						.await
						.map_err(|error| error.to_string())?;

					Ok(())
				},
				FetchResponse::Error { error, .. } => Err(error),
			}
		}
	}

	let invoked = Arc::new(Mutex::new(Vec::new()));
	let mut second_router = Router::new();
	second_router.add_default_handler(TrackingHandler { invoked: invoked.clone() });

	let second_run = Orchestrator::new(config_for(true), second_router);
	let second_summary = second_run
		.run(
			vec![
				SeedRequest::new("https://example.com/u1"),
				SeedRequest::new("https://example.com/u2"),
				SeedRequest::new("https://example.com/u3"),
			],
			None,
		)
		.await
		.unwrap();

	assert_eq!(second_summary.handled, 1);
	assert_eq!(invoked.lock().await.as_slice(), ["https://example.com/u3".to_string()]);
}
