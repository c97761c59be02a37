// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Multi-session lifecycle tests: each `Engine` stands in for one process run
//! against the same report directory.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loom_report_agent::{
	AgentConfig, AgentConfigBuilder, AgentError, Attachment, Engine, PendingReport, ReportId,
	ReportKind, Result, Transport,
};
use tempfile::TempDir;

/// Accepts or fails every upload depending on a switch, and remembers what it
/// was given.
#[derive(Default)]
struct ScriptedTransport {
	accept: AtomicBool,
	calls: AtomicUsize,
	seen: Mutex<Vec<(ReportId, ReportKind)>>,
}

impl ScriptedTransport {
	fn accepting(accept: bool) -> Arc<Self> {
		let transport = Self::default();
		transport.accept.store(accept, Ordering::SeqCst);
		Arc::new(transport)
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Transport for ScriptedTransport {
	async fn send(&self, report: &PendingReport) -> Result<()> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.seen.lock().unwrap().push((report.id(), report.kind()));
		if self.accept.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(AgentError::TransientDeliveryFailure(
				"503 service unavailable".to_string(),
			))
		}
	}
}

fn builder(tmp: &TempDir) -> AgentConfigBuilder {
	AgentConfig::builder()
		.base_url("https://reports.example.com/api/submit")
		.database_path(tmp.path())
		.application("lifecycle-test")
		.application_version("1.4.2")
		.debugger_attached(false)
}

fn config(tmp: &TempDir) -> AgentConfig {
	builder(tmp).build().unwrap()
}

/// Runs a session that records low memory in the foreground and is then
/// killed without a termination notification.
async fn killed_after_low_memory(tmp: &TempDir) {
	let first = run_session(tmp, ScriptedTransport::accepting(true)).await;
	first.low_memory_notification();
	drop(first);
}

async fn run_session(tmp: &TempDir, transport: Arc<ScriptedTransport>) -> Engine {
	let engine = Engine::start_with_transport(config(tmp), transport)
		.await
		.unwrap();
	engine.wait_for_startup_delivery().await;
	engine
}

fn report_files(tmp: &TempDir) -> Vec<String> {
	let mut names: Vec<String> = std::fs::read_dir(tmp.path().join("reports"))
		.unwrap()
		.map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
		.collect();
	names.sort();
	names
}

#[tokio::test]
async fn first_start_has_nothing_to_send() {
	let tmp = TempDir::new().unwrap();
	let transport = ScriptedTransport::accepting(true);

	let engine = run_session(&tmp, transport.clone()).await;

	assert_eq!(engine.repository().pending_count(), 0);
	let summary = engine.send_pending_reports().await;
	assert_eq!(summary.attempted, 0);
	assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn backgrounded_process_death_is_not_an_oom() {
	let tmp = TempDir::new().unwrap();

	// Starting records the foreground state.
	let first = run_session(&tmp, ScriptedTransport::accepting(true)).await;
	first.background_notification();
	drop(first);

	let transport = ScriptedTransport::accepting(true);
	let second = run_session(&tmp, transport.clone()).await;

	assert_eq!(second.repository().pending_count(), 0);
	assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn foreground_death_after_low_memory_is_reported_until_delivered() {
	let tmp = TempDir::new().unwrap();

	let first = run_session(&tmp, ScriptedTransport::accepting(true)).await;
	first.low_memory_notification();
	// Killed here: no termination notification.
	drop(first);

	let transport = ScriptedTransport::accepting(false);
	let second = run_session(&tmp, transport.clone()).await;

	// The startup pass tried once and kept the report.
	assert_eq!(transport.calls(), 1);
	let (id, kind) = transport.seen.lock().unwrap()[0];
	assert_eq!(kind, ReportKind::OutOfMemory);

	let handle = second
		.repository()
		.enumerate_pending(None)
		.unwrap()
		.next()
		.unwrap();
	assert_eq!(handle.id(), id);
	let report = second.repository().load(&handle).unwrap().unwrap();
	assert_eq!(report.attributes.get("error.type"), Some("Low Memory"));
	assert_eq!(report.attributes.get("memory.warning"), Some("true"));
	assert_eq!(report.attributes.get("application"), Some("lifecycle-test"));
	assert_eq!(report.attributes.get("state.app_version"), Some("1.4.2"));

	assert_eq!(
		report_files(&tmp),
		vec![
			format!("{id}.attributes.json"),
			format!("{id}.manifest.json"),
			format!("{id}.report"),
		]
	);

	let retry = second.send_pending_reports().await;
	assert_eq!(retry.attempted, 1);
	assert_eq!(retry.retained, 1);
	assert_eq!(second.repository().pending_count(), 1);

	transport.accept.store(true, Ordering::SeqCst);
	let delivered = second.send_pending_reports().await;
	assert_eq!(delivered.delivered, 1);
	assert!(report_files(&tmp).is_empty());
}

#[tokio::test]
async fn clean_exit_is_not_an_oom() {
	let tmp = TempDir::new().unwrap();

	let first = run_session(&tmp, ScriptedTransport::accepting(true)).await;
	first.low_memory_notification();
	first.termination_notification();
	drop(first);

	let transport = ScriptedTransport::accepting(true);
	let second = run_session(&tmp, transport.clone()).await;
	assert_eq!(second.repository().pending_count(), 0);
	assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn crash_is_not_double_reported_as_oom() {
	let tmp = TempDir::new().unwrap();

	let first = run_session(&tmp, ScriptedTransport::accepting(false)).await;
	// Crash dumps are told apart from an earlier process's by modification time.
	tokio::time::sleep(Duration::from_millis(20)).await;
	let dump = tmp.path().join("native.dmp");
	std::fs::write(&dump, b"MDMP\x93\xa7").unwrap();
	first.record_native_crash(&dump).unwrap();
	drop(first);

	let transport = ScriptedTransport::accepting(true);
	let second = run_session(&tmp, transport.clone()).await;

	let seen = transport.seen.lock().unwrap().clone();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].1, ReportKind::NativeCrash);
	assert_eq!(second.repository().pending_count(), 0);
}

#[tokio::test]
async fn oom_inference_can_be_turned_off() {
	let tmp = TempDir::new().unwrap();

	let first = run_session(&tmp, ScriptedTransport::accepting(true)).await;
	drop(first);

	let config = AgentConfig::builder()
		.base_url("https://reports.example.com/api/submit")
		.database_path(tmp.path())
		.oom_support(false)
		.build()
		.unwrap();
	let transport = ScriptedTransport::accepting(true);
	let second = Engine::start_with_transport(config, transport.clone())
		.await
		.unwrap();
	second.wait_for_startup_delivery().await;

	assert_eq!(transport.calls(), 0);
	assert!(!second.oom_watcher().state_path().exists());
}

#[tokio::test]
async fn crash_dump_handed_over_at_start_replaces_oom() {
	let tmp = TempDir::new().unwrap();
	killed_after_low_memory(&tmp).await;
	let dump = tmp.path().join("native.dmp");
	std::fs::write(&dump, b"MDMP\x93\xa7").unwrap();

	let transport = ScriptedTransport::accepting(true);
	let config = builder(&tmp).pending_crash(&dump).build().unwrap();
	let second = Engine::start_with_transport(config, transport.clone())
		.await
		.unwrap();
	second.wait_for_startup_delivery().await;

	let seen = transport.seen.lock().unwrap().clone();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].1, ReportKind::NativeCrash);
	assert!(!dump.exists());
	assert_eq!(second.repository().pending_count(), 0);
	// The new session is tracked as usual.
	assert!(second.oom_watcher().state_path().exists());
}

#[tokio::test]
async fn late_crash_dump_retracts_inferred_oom() {
	let tmp = TempDir::new().unwrap();
	killed_after_low_memory(&tmp).await;
	let dump = tmp.path().join("native.dmp");
	std::fs::write(&dump, b"MDMP\x93\xa7").unwrap();

	let transport = ScriptedTransport::accepting(false);
	let second = run_session(&tmp, transport.clone()).await;
	assert_eq!(transport.seen.lock().unwrap()[0].1, ReportKind::OutOfMemory);

	let id = second.record_native_crash(&dump).unwrap();

	let pending: Vec<_> = second
		.repository()
		.enumerate_pending(None)
		.unwrap()
		.map(|handle| handle.id())
		.collect();
	assert_eq!(pending, vec![id]);
	// The dump belongs to the earlier process; this one is still tracked.
	assert!(second.oom_watcher().state_path().exists());

	transport.accept.store(true, Ordering::SeqCst);
	let summary = second.send_pending_reports().await;
	assert_eq!(summary.delivered, 1);
	let seen = transport.seen.lock().unwrap().clone();
	assert_eq!(seen.last(), Some(&(id, ReportKind::NativeCrash)));
	assert_eq!(seen.iter().filter(|(_, kind)| *kind == ReportKind::OutOfMemory).count(), 1);
}

#[tokio::test]
async fn oom_report_carries_oom_attachments() {
	let tmp = TempDir::new().unwrap();
	killed_after_low_memory(&tmp).await;
	let log = tmp.path().join("memory.log");
	std::fs::write(&log, b"rss=1.9G").unwrap();

	let transport = ScriptedTransport::accepting(false);
	let config = builder(&tmp)
		.attachment(tmp.path().join("game.log"))
		.oom_attachment(&log)
		.build()
		.unwrap();
	let second = Engine::start_with_transport(config, transport)
		.await
		.unwrap();
	second.wait_for_startup_delivery().await;

	let handle = second
		.repository()
		.enumerate_pending(None)
		.unwrap()
		.next()
		.unwrap();
	let report = second.repository().load(&handle).unwrap().unwrap();
	assert_eq!(report.kind(), ReportKind::OutOfMemory);
	assert_eq!(report.attachments, vec![Attachment::new(&log)]);
}
