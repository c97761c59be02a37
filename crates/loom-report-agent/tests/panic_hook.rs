// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The panic hook is process-global, so it gets a test binary of its own.

use std::sync::Arc;

use async_trait::async_trait;
use loom_report_agent::{
	AgentConfig, Engine, LifecycleState, PendingReport, ReportKind, Result, Transport,
};
use tempfile::TempDir;

struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
	async fn send(&self, _report: &PendingReport) -> Result<()> {
		Ok(())
	}
}

#[tokio::test]
async fn caught_worker_panic_is_recorded_and_session_continues() {
	let tmp = TempDir::new().unwrap();
	let config = AgentConfig::builder()
		.base_url("https://reports.example.com/api/submit")
		.database_path(tmp.path())
		.application("hook-test")
		.debugger_attached(false)
		.build()
		.unwrap();
	let engine = Engine::start_with_transport(config, Arc::new(NullTransport))
		.await
		.unwrap();
	engine.wait_for_startup_delivery().await;
	engine.install_panic_hook();

	let joined = std::thread::Builder::new()
		.name("asset-loader".into())
		.spawn(|| panic!("texture atlas missing"))
		.unwrap()
		.join();
	let _ = std::panic::take_hook();
	assert!(joined.is_err());

	let handles: Vec<_> = engine.repository().enumerate_pending(None).unwrap().collect();
	assert_eq!(handles.len(), 1);
	let report = engine.repository().load(&handles[0]).unwrap().unwrap();
	assert_eq!(report.kind(), ReportKind::NativeCrash);
	assert_eq!(report.attributes.get("error.type"), Some("Crash"));
	assert_eq!(report.attributes.get("error.message"), Some("texture atlas missing"));
	assert_eq!(report.attributes.get("application"), Some("hook-test"));

	let payload: serde_json::Value = serde_json::from_slice(&report.artifact.payload).unwrap();
	assert_eq!(payload["thread"]["name"], "asset-loader");
	assert_eq!(payload["thread"]["main_thread_faulting"], false);
	assert!(payload["location"]
		.as_str()
		.is_some_and(|location| location.contains("panic_hook.rs")));

	// The worker panic was caught, so the session is still tracked.
	assert_eq!(engine.oom_watcher().lifecycle_state(), LifecycleState::Foreground);
	assert!(engine.oom_watcher().state_path().exists());
}
