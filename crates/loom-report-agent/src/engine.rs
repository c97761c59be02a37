// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The report lifecycle engine.
//!
//! [`Engine`] wires the attribute store, the pending report repository, the
//! OOM watcher and the upload client together behind the entry points a host
//! runtime calls. Every entry point absorbs its own failures: they are logged
//! and published through [`Engine::subscribe_diagnostics`], and the host keeps
//! running.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::SystemTime;

use chrono::Utc;
use loom_report_core::{Attachment, AttributeMap, ReportArtifact, ReportId, ReportKind};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::attributes::AttributeStore;
use crate::backtrace::capture_frames;
use crate::config::AgentConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{AgentError, Result};
use crate::http::HttpTransport;
use crate::oom::{debugger_attached, OomWatcher};
use crate::repository::{PendingReportHandle, ReportRepository};
use crate::upload::{Transport, UploadClient, UploadTicket};

/// Counts from one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
	/// Reports handed to the upload client.
	pub attempted: usize,
	/// Reports removed after delivery or permanent rejection.
	pub delivered: usize,
	/// Reports kept for a later pass.
	pub retained: usize,
}

struct EngineInner {
	config: AgentConfig,
	attributes: AttributeStore,
	repository: ReportRepository,
	oom: OomWatcher,
	uploader: UploadClient,
	runtime: Handle,
	disabled: AtomicBool,
	diagnostics: Diagnostics,
	/// Modification time of the lifecycle record written at start. Crash
	/// dumps last modified no later than this belong to an earlier process.
	session_marker: SystemTime,
	/// OOM report inferred at start, until a crash from the same session
	/// turns up or it leaves the repository.
	oom_report: StdMutex<Option<PendingReportHandle>>,
	/// Serializes delivery passes.
	pass: Mutex<()>,
	startup: StdMutex<Option<JoinHandle<DeliverySummary>>>,
}

/// Report lifecycle engine. Cheap to clone.
///
/// # Example
///
/// ```ignore
/// use loom_report_agent::{AgentConfig, Engine};
///
/// let config = AgentConfig::builder()
///     .base_url("https://reports.example.com/submit?token=...")
///     .database_path("/var/lib/game/reports")
///     .application("game")
///     .build()?;
///
/// let engine = Engine::start(config).await?;
/// engine.add_attribute("level", "4");
///
/// // Host lifecycle callbacks
/// engine.background_notification();
/// engine.foreground_notification();
/// engine.low_memory_notification();
///
/// // On a clean exit
/// engine.termination_notification();
/// ```
#[derive(Clone)]
pub struct Engine {
	inner: Arc<EngineInner>,
}

impl Engine {
	/// Starts the engine with the multipart HTTP transport.
	///
	/// Must be called from within a tokio runtime; the runtime is kept for
	/// uploads started from host threads later on.
	pub async fn start(config: AgentConfig) -> Result<Self> {
		let transport = HttpTransport::new(
			config.base_url.clone(),
			config.request_timeout,
			config.retry_config.clone(),
		)?;
		Self::start_with_transport(config, Arc::new(transport)).await
	}

	/// Starts the engine with a caller-supplied transport.
	///
	/// Purges interrupted commits, takes over crash dumps the previous
	/// session left, evaluates that session for an OOM termination and kicks
	/// off one delivery pass in the background. Only configuration and
	/// storage setup failures are returned.
	pub async fn start_with_transport(
		config: AgentConfig,
		transport: Arc<dyn Transport>,
	) -> Result<Self> {
		let runtime = Handle::current();
		let diagnostics = Diagnostics::new();

		let attributes = AttributeStore::new(
			config.application.as_deref(),
			config.application_version.as_deref(),
			config.attributes.clone(),
		);

		let repository = ReportRepository::open(&config.database_path)?;
		if let Err(e) = repository.purge_incomplete() {
			diagnostics.publish("purge_incomplete", &e);
		}

		let debugger = config.debugger_attached.unwrap_or_else(debugger_attached);
		let oom = OomWatcher::new(
			&config.database_path,
			config.oom_support,
			debugger,
			config.application_version.clone(),
			config.oom_attachments.clone(),
		);

		let mut prior_crashes = 0;
		for path in &config.pending_crashes {
			match commit_crash_dump(&repository, &attributes, &config.attachments, path, &diagnostics) {
				Ok(handle) => {
					info!(report_id = %handle.id(), source = %path.display(), "recorded crash from previous session");
					prior_crashes += 1;
				}
				Err(e) => diagnostics.publish("pending_crash", &e),
			}
		}

		let evaluation = oom.start(&attributes, &repository, prior_crashes > 0);
		for e in &evaluation.errors {
			diagnostics.publish("oom_start", e);
		}
		// Read back so dumps are compared against the filesystem's own clock.
		let session_marker = std::fs::metadata(oom.state_path())
			.and_then(|m| m.modified())
			.unwrap_or_else(|_| SystemTime::now());

		let uploader = UploadClient::new(transport, runtime.clone());

		let engine = Self {
			inner: Arc::new(EngineInner {
				config,
				attributes,
				repository,
				oom,
				uploader,
				runtime,
				disabled: AtomicBool::new(false),
				diagnostics,
				session_marker,
				oom_report: StdMutex::new(evaluation.report.clone()),
				pass: Mutex::new(()),
				startup: StdMutex::new(None),
			}),
		};

		info!(
			database = %engine.inner.config.database_path.display(),
			oom_support = engine.inner.config.oom_support,
			debugger_attached = debugger,
			oom_detected = evaluation.report.is_some(),
			prior_crashes,
			pending = engine.inner.repository.pending_count(),
			"report engine started"
		);

		let startup = engine.spawn_send_pass();
		*engine
			.inner
			.startup
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(startup);

		Ok(engine)
	}

	pub fn config(&self) -> &AgentConfig {
		&self.inner.config
	}

	pub fn attributes(&self) -> &AttributeStore {
		&self.inner.attributes
	}

	pub fn repository(&self) -> &ReportRepository {
		&self.inner.repository
	}

	pub fn oom_watcher(&self) -> &OomWatcher {
		&self.inner.oom
	}

	/// Receives every failure the engine absorbs from now on.
	pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
		self.inner.diagnostics.subscribe()
	}

	/// Uploads started but not yet resolved.
	pub fn in_flight_uploads(&self) -> usize {
		self.inner.uploader.in_flight()
	}

	pub fn is_disabled(&self) -> bool {
		self.inner.disabled.load(Ordering::SeqCst)
	}

	fn check_disabled(&self) -> Result<()> {
		if self.is_disabled() {
			return Err(AgentError::Disabled);
		}
		Ok(())
	}

	/// Waits for the delivery pass started by [`Engine::start`].
	///
	/// Returns `None` if it was already awaited.
	pub async fn wait_for_startup_delivery(&self) -> Option<DeliverySummary> {
		let handle = self
			.inner
			.startup
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()?;
		handle.await.ok()
	}

	/// Sets a process-wide attribute. Ignored once disabled.
	pub fn add_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
		if self.check_disabled().is_err() {
			debug!("ignoring attribute write, engine disabled");
			return;
		}
		self.inner.attributes.add(key, value);
	}

	/// Records a report for a non-fatal native fault and delivers it
	/// immediately.
	pub fn native_report(&self, message: &str, main_thread_faulting: bool) -> Option<ReportId> {
		match self.try_native_report(message, main_thread_faulting) {
			Ok(handle) => {
				let id = handle.id();
				self.spawn_delivery(handle);
				Some(id)
			}
			Err(AgentError::Disabled) => {
				debug!("ignoring native report, engine disabled");
				None
			}
			Err(e) => {
				self.inner.diagnostics.publish("native_report", &e);
				None
			}
		}
	}

	fn try_native_report(
		&self,
		message: &str,
		main_thread_faulting: bool,
	) -> Result<PendingReportHandle> {
		self.commit_live_report(ReportKind::Manual, "Crash", message, main_thread_faulting)
	}

	/// Records that the application stopped responding and delivers the
	/// report immediately. The main thread is reported as the faulting one.
	pub fn report_hang(&self, message: &str) -> Option<ReportId> {
		match self.commit_live_report(ReportKind::Hang, "Hang", message, true) {
			Ok(handle) => {
				let id = handle.id();
				warn!(report_id = %id, message = %message, "application hang recorded");
				self.spawn_delivery(handle);
				Some(id)
			}
			Err(AgentError::Disabled) => {
				debug!("ignoring hang report, engine disabled");
				None
			}
			Err(e) => {
				self.inner.diagnostics.publish("report_hang", &e);
				None
			}
		}
	}

	/// Commits a report describing the calling thread's current state.
	fn commit_live_report(
		&self,
		kind: ReportKind,
		error_type: &str,
		message: &str,
		main_thread_faulting: bool,
	) -> Result<PendingReportHandle> {
		self.check_disabled()?;

		let thread = std::thread::current();
		let payload = json!({
			"message": message,
			"thread": {
				"name": thread.name(),
				"main_thread_faulting": main_thread_faulting,
			},
			"frames": capture_frames(),
			"timestamp": Utc::now().to_rfc3339(),
		});
		let artifact = ReportArtifact::new(kind, serde_json::to_vec(&payload)?);

		let mut overrides = AttributeMap::new();
		overrides.insert("error.message".into(), message.to_string());
		overrides.insert("error.type".into(), error_type.into());

		self.inner.repository.commit(
			&artifact,
			&self.inner.attributes.snapshot(&overrides),
			&self.inner.config.attachments,
		)
	}

	/// Takes ownership of a completed crash dump written by the native
	/// capture mechanism.
	///
	/// The dump is committed as a pending report and the source file removed.
	/// Delivery happens on the next pass, normally at the next start.
	///
	/// A dump last written no later than this engine's start belongs to the
	/// previous session. It leaves the current lifecycle record alone and retracts the
	/// OOM report inferred for that session, if it is still pending. Prefer
	/// handing such dumps over through
	/// [`AgentConfigBuilder::pending_crash`](crate::AgentConfigBuilder::pending_crash).
	pub fn record_native_crash(&self, path: &Path) -> Option<ReportId> {
		match self.try_record_native_crash(path) {
			Ok(id) => Some(id),
			Err(AgentError::Disabled) => {
				debug!(path = %path.display(), "ignoring native crash, engine disabled");
				None
			}
			Err(e) => {
				self.inner.diagnostics.publish("record_native_crash", &e);
				None
			}
		}
	}

	fn try_record_native_crash(&self, path: &Path) -> Result<ReportId> {
		self.check_disabled()?;

		let from_previous_session = written_by(path, self.inner.session_marker);
		let handle = commit_crash_dump(
			&self.inner.repository,
			&self.inner.attributes,
			&self.inner.config.attachments,
			path,
			&self.inner.diagnostics,
		)?;

		if from_previous_session {
			self.retract_oom_report();
		} else if let Err(e) = self.inner.oom.crash_recorded() {
			self.inner.diagnostics.publish("crash_recorded", &e);
		}

		info!(
			report_id = %handle.id(),
			source = %path.display(),
			from_previous_session,
			"recorded native crash"
		);
		Ok(handle.id())
	}

	/// Drops the OOM report inferred at start; a crash explains that
	/// termination instead.
	fn retract_oom_report(&self) {
		let Some(handle) = self
			.inner
			.oom_report
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		else {
			return;
		};

		if !handle.artifact_path().exists() {
			debug!(report_id = %handle.id(), "inferred OOM report already delivered");
			return;
		}
		match self.inner.repository.delete(&handle) {
			Ok(()) => info!(report_id = %handle.id(), "retracted inferred OOM report"),
			Err(e) => self.inner.diagnostics.publish("retract_oom_report", &e),
		}
	}

	/// Records Rust panics as crash reports before the previous hook runs.
	///
	/// The lifecycle record is cleared only for panics that end the process:
	/// any panic under `panic = "abort"`, otherwise one on the main thread.
	/// A panic on another thread may be caught and the session goes on.
	pub fn install_panic_hook(&self) {
		let engine = self.clone();
		let previous = std::panic::take_hook();
		std::panic::set_hook(Box::new(move |info| {
			let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
				(*s).to_string()
			} else if let Some(s) = info.payload().downcast_ref::<String>() {
				s.clone()
			} else {
				"panic".to_string()
			};
			let location = info.location().map(|l| format!("{}:{}", l.file(), l.line()));
			let main_thread = std::thread::current().name() == Some("main");
			let terminating = cfg!(panic = "abort") || main_thread;

			match engine.record_panic(&message, location.as_deref(), main_thread, terminating) {
				Ok(id) => error!(report_id = %id, message = %message, "panic recorded"),
				Err(AgentError::Disabled) => {}
				Err(e) => engine.inner.diagnostics.publish("panic_hook", &e),
			}

			previous(info);
		}));
		info!("panic hook installed");
	}

	fn record_panic(
		&self,
		message: &str,
		location: Option<&str>,
		main_thread_faulting: bool,
		terminating: bool,
	) -> Result<ReportId> {
		self.check_disabled()?;

		let payload = json!({
			"message": message,
			"location": location,
			"thread": {
				"name": std::thread::current().name(),
				"main_thread_faulting": main_thread_faulting,
			},
			"frames": capture_frames(),
			"timestamp": Utc::now().to_rfc3339(),
		});
		let artifact = ReportArtifact::new(ReportKind::NativeCrash, serde_json::to_vec(&payload)?);

		let mut overrides = AttributeMap::new();
		overrides.insert("error.message".into(), message.to_string());
		overrides.insert("error.type".into(), "Crash".into());

		let handle = self.inner.repository.commit(
			&artifact,
			&self.inner.attributes.snapshot(&overrides),
			&self.inner.config.attachments,
		)?;
		if terminating {
			self.inner.oom.crash_recorded()?;
		}
		Ok(handle.id())
	}

	/// Uploads every pending report once and applies the dispositions.
	///
	/// Reports are loaded lazily and at most `max_concurrent_uploads` are in
	/// flight at a time.
	#[instrument(skip(self))]
	pub async fn send_pending_reports(&self) -> DeliverySummary {
		let _pass = self.inner.pass.lock().await;
		let mut summary = DeliverySummary::default();
		let window = self.inner.config.max_concurrent_uploads.max(1);

		let handles = match self
			.inner
			.repository
			.enumerate_pending(self.inner.config.max_reports_per_pass)
		{
			Ok(handles) => handles,
			Err(e) => {
				self.inner.diagnostics.publish("enumerate_pending", &e);
				return summary;
			}
		};

		let mut in_flight: VecDeque<(PendingReportHandle, UploadTicket)> =
			VecDeque::with_capacity(window);
		for handle in handles {
			if in_flight.len() >= window {
				if let Some((done, ticket)) = in_flight.pop_front() {
					self.settle(done, ticket, &mut summary).await;
				}
			}
			match self.inner.repository.load(&handle) {
				Ok(Some(report)) => {
					summary.attempted += 1;
					in_flight.push_back((handle, self.inner.uploader.upload(report)));
				}
				Ok(None) => debug!(report_id = %handle.id(), "report vanished before upload"),
				Err(e) => self.inner.diagnostics.publish("load", &e),
			}
		}
		while let Some((handle, ticket)) = in_flight.pop_front() {
			self.settle(handle, ticket, &mut summary).await;
		}

		if summary.attempted > 0 {
			info!(
				attempted = summary.attempted,
				delivered = summary.delivered,
				retained = summary.retained,
				"delivery pass finished"
			);
		}
		summary
	}

	async fn settle(
		&self,
		handle: PendingReportHandle,
		ticket: UploadTicket,
		summary: &mut DeliverySummary,
	) {
		if ticket.disposition().await.should_remove_local_copy {
			self.remove(&handle);
			summary.delivered += 1;
		} else {
			self.inner.repository.retain(&handle);
			summary.retained += 1;
		}
	}

	fn remove(&self, handle: &PendingReportHandle) {
		if let Err(e) = self.inner.repository.delete(handle) {
			self.inner.diagnostics.publish("delete", &e);
		}
	}

	fn spawn_send_pass(&self) -> JoinHandle<DeliverySummary> {
		let engine = self.clone();
		self
			.inner
			.runtime
			.spawn(async move { engine.send_pending_reports().await })
	}

	fn spawn_delivery(&self, handle: PendingReportHandle) {
		let report = match self.inner.repository.load(&handle) {
			Ok(Some(report)) => report,
			Ok(None) => return,
			Err(e) => {
				self.inner.diagnostics.publish("load", &e);
				return;
			}
		};

		let ticket = self.inner.uploader.upload(report);
		let engine = self.clone();
		self.inner.runtime.spawn(async move {
			if ticket.disposition().await.should_remove_local_copy {
				engine.remove(&handle);
			} else {
				engine.inner.repository.retain(&handle);
			}
		});
	}

	/// The application became active. Also starts a delivery pass.
	pub fn foreground_notification(&self) {
		if self.check_disabled().is_err() {
			return;
		}
		if let Err(e) = self.inner.oom.foreground_notification() {
			self.inner.diagnostics.publish("foreground_notification", &e);
		}
		drop(self.spawn_send_pass());
	}

	pub fn background_notification(&self) {
		if self.check_disabled().is_err() {
			return;
		}
		if let Err(e) = self.inner.oom.background_notification() {
			self.inner.diagnostics.publish("background_notification", &e);
		}
	}

	/// The platform warned about memory pressure.
	pub fn low_memory_notification(&self) {
		if self.check_disabled().is_err() {
			return;
		}
		if let Err(e) = self.inner.oom.save_low_memory_state() {
			self.inner.diagnostics.publish("low_memory_notification", &e);
		}
	}

	/// The application is exiting normally.
	pub fn termination_notification(&self) {
		if self.check_disabled().is_err() {
			return;
		}
		if let Err(e) = self.inner.oom.termination_notification() {
			self.inner.diagnostics.publish("termination_notification", &e);
		}
	}

	/// Stops accepting notifications, attributes and new reports. Reports
	/// already on disk stay there for a future process.
	pub fn disable(&self) {
		if !self.inner.disabled.swap(true, Ordering::SeqCst) {
			info!("report engine disabled");
		}
	}
}

/// Commits a crash dump as a pending report, then removes the source.
fn commit_crash_dump(
	repository: &ReportRepository,
	attributes: &AttributeStore,
	attachments: &[Attachment],
	path: &Path,
	diagnostics: &Diagnostics,
) -> Result<PendingReportHandle> {
	let payload = std::fs::read(path).map_err(|e| AgentError::storage(path, e))?;
	let artifact = ReportArtifact::new(ReportKind::NativeCrash, payload);

	let mut overrides = AttributeMap::new();
	overrides.insert("error.type".into(), "Crash".into());

	let handle = repository.commit(&artifact, &attributes.snapshot(&overrides), attachments)?;

	if let Err(e) = std::fs::remove_file(path) {
		diagnostics.publish("record_native_crash", &AgentError::storage(path, e));
	}
	Ok(handle)
}

/// True when the file was last modified at or before `instant`.
fn written_by(path: &Path, instant: SystemTime) -> bool {
	std::fs::metadata(path)
		.and_then(|m| m.modified())
		.is_ok_and(|modified| modified <= instant)
}
