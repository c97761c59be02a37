// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Out-of-memory inference from persisted lifecycle state.
//!
//! The watcher keeps one [`ApplicationStateSnapshot`] on disk and rewrites it
//! on every lifecycle transition. A graceful exit or a recorded crash removes
//! it. On the next start, a record that still says "foreground, no debugger"
//! means the process vanished without either, which is reported as an OOM
//! kill.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use loom_report_core::{
	should_report_oom, ApplicationStateSnapshot, Attachment, AttributeMap, LifecycleState,
	PriorState, ReportArtifact, ReportKind,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::attributes::{session_id, AttributeStore};
use crate::error::{AgentError, Result};
use crate::fs::{remove_if_exists, write_atomic};
use crate::repository::{PendingReportHandle, ReportRepository};

const STATE_FILE: &str = "oom_state.json";

/// Whether a debugger is tracing this process.
///
/// Reads `TracerPid` from `/proc/self/status`; always false on platforms
/// without procfs.
pub fn debugger_attached() -> bool {
	std::fs::read_to_string("/proc/self/status")
		.ok()
		.and_then(|status| {
			status
				.lines()
				.find_map(|line| line.strip_prefix("TracerPid:"))
				.and_then(|pid| pid.trim().parse::<u32>().ok())
		})
		.is_some_and(|pid| pid != 0)
}

/// Result of evaluating the previous session at start.
#[derive(Debug)]
pub struct OomEvaluation {
	pub prior: PriorState,
	/// The synthesized OOM report, when one was committed.
	pub report: Option<PendingReportHandle>,
	/// A crash dump accounted for a termination that looked like an OOM kill.
	pub explained_by_crash: bool,
	/// Non-fatal failures hit while evaluating.
	pub errors: Vec<AgentError>,
}

pub struct OomWatcher {
	enabled: bool,
	state_path: PathBuf,
	debugger_attached: bool,
	app_version: Option<String>,
	attachments: Vec<Attachment>,
	state: Mutex<Option<ApplicationStateSnapshot>>,
}

impl OomWatcher {
	pub fn new(
		database_path: &Path,
		enabled: bool,
		debugger_attached: bool,
		app_version: Option<String>,
		attachments: Vec<Attachment>,
	) -> Self {
		Self {
			enabled,
			state_path: database_path.join(STATE_FILE),
			debugger_attached,
			app_version,
			attachments,
			state: Mutex::new(None),
		}
	}

	pub fn state_path(&self) -> &Path {
		&self.state_path
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	/// Where the current session is, as last recorded.
	pub fn lifecycle_state(&self) -> LifecycleState {
		self
			.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.as_ref()
			.map_or(LifecycleState::Unknown, ApplicationStateSnapshot::lifecycle_state)
	}

	/// Reads what the previous session left. Corrupt data counts as absent.
	pub fn read_prior_state(&self) -> PriorState {
		let bytes = match std::fs::read(&self.state_path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PriorState::Unknown,
			Err(e) => {
				warn!(path = %self.state_path.display(), error = %e, "cannot read lifecycle state");
				return PriorState::Unknown;
			}
		};

		match serde_json::from_slice::<ApplicationStateSnapshot>(&bytes) {
			Ok(snapshot) => PriorState::Recorded(snapshot),
			Err(e) => {
				warn!(path = %self.state_path.display(), error = %e, "corrupt lifecycle state, ignoring");
				PriorState::Unknown
			}
		}
	}

	/// Evaluates the previous session and begins tracking this one.
	///
	/// `crash_recorded_for_prior` is true when a crash dump left by the
	/// previous session has already been committed; that crash is the
	/// termination, so no OOM is inferred.
	pub fn start(
		&self,
		attributes: &AttributeStore,
		repository: &ReportRepository,
		crash_recorded_for_prior: bool,
	) -> OomEvaluation {
		let mut evaluation = OomEvaluation {
			prior: PriorState::Unknown,
			report: None,
			explained_by_crash: false,
			errors: Vec::new(),
		};

		if !self.enabled {
			if let Err(e) = self.cleanup() {
				evaluation.errors.push(e);
			}
			return evaluation;
		}

		evaluation.prior = self.read_prior_state();

		if should_report_oom(&evaluation.prior) && crash_recorded_for_prior {
			info!("previous session ended in a recorded crash, not inferring OOM");
			evaluation.explained_by_crash = true;
		} else if should_report_oom(&evaluation.prior) {
			match self.commit_oom_report(&evaluation.prior, attributes, repository) {
				Ok(handle) => {
					evaluation.report = Some(handle);
					if let Err(e) = self.cleanup() {
						evaluation.errors.push(e);
					}
				}
				Err(e) => {
					warn!(error = %e, "failed to store OOM report");
					evaluation.errors.push(e);
				}
			}
		} else {
			debug!(prior = ?evaluation.prior.snapshot().map(|s| s.lifecycle_state()), "no OOM detected");
		}

		let fresh = ApplicationStateSnapshot::fresh(self.debugger_attached)
			.with_session(session_id(), self.app_version.clone());
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		if let Err(e) = self.persist(&fresh) {
			evaluation.errors.push(e);
		}
		*state = Some(fresh);

		evaluation
	}

	fn commit_oom_report(
		&self,
		prior: &PriorState,
		attributes: &AttributeStore,
		repository: &ReportRepository,
	) -> Result<PendingReportHandle> {
		let Some(snapshot) = prior.snapshot() else {
			return Err(AgentError::corrupt(&self.state_path, "no prior state"));
		};

		let mut overrides = AttributeMap::new();
		overrides.insert("error.type".into(), "Low Memory".into());
		overrides.insert("error.message".into(), "Out of memory detected.".into());
		overrides.insert("state.foreground".into(), snapshot.in_foreground.to_string());
		overrides.insert("state.debugger".into(), snapshot.debugger_attached.to_string());
		overrides.insert(
			"memory.warning".into(),
			snapshot.low_memory_warning_seen.to_string(),
		);
		overrides.insert("state.last_update".into(), snapshot.last_update.to_rfc3339());
		if let Some(session) = &snapshot.session_id {
			overrides.insert("state.session".into(), session.clone());
		}
		if let Some(version) = &snapshot.app_version {
			overrides.insert("state.app_version".into(), version.clone());
		}

		let payload = json!({
			"kind": ReportKind::OutOfMemory,
			"detected_at": Utc::now().to_rfc3339(),
			"prior_state": snapshot,
		});
		let artifact = ReportArtifact::new(ReportKind::OutOfMemory, serde_json::to_vec(&payload)?);

		let handle = repository.commit(
			&artifact,
			&attributes.snapshot(&overrides),
			&self.attachments,
		)?;

		info!(
			report_id = %handle.id(),
			low_memory_warning = snapshot.low_memory_warning_seen,
			"previous session ended in a suspected OOM kill"
		);
		Ok(handle)
	}

	fn persist(&self, snapshot: &ApplicationStateSnapshot) -> Result<()> {
		let json = serde_json::to_vec_pretty(snapshot)?;
		write_atomic(&self.state_path, &json)
	}

	/// Applies `change` to the current record and writes it out while holding
	/// the lock, so concurrent notifications are serialized.
	fn update(&self, change: impl FnOnce(&mut ApplicationStateSnapshot)) -> Result<()> {
		if !self.enabled {
			return Ok(());
		}

		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		let snapshot = state.get_or_insert_with(|| {
			ApplicationStateSnapshot::fresh(self.debugger_attached)
				.with_session(session_id(), self.app_version.clone())
		});
		change(snapshot);
		snapshot.touch();
		self.persist(snapshot)
	}

	pub fn foreground_notification(&self) -> Result<()> {
		self.update(|s| s.in_foreground = true)
	}

	/// The last reliably observable event before the OS may kill a
	/// suspended process.
	pub fn background_notification(&self) -> Result<()> {
		self.update(|s| s.in_foreground = false)
	}

	pub fn save_low_memory_state(&self) -> Result<()> {
		self.update(|s| s.low_memory_warning_seen = true)
	}

	/// Graceful exit: the next start must not infer an OOM.
	pub fn termination_notification(&self) -> Result<()> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		*state = None;
		remove_if_exists(&self.state_path)
	}

	/// A native crash in this session explains the coming termination.
	pub fn crash_recorded(&self) -> Result<()> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		*state = None;
		remove_if_exists(&self.state_path)
	}

	/// Removes the persisted record.
	pub fn cleanup(&self) -> Result<()> {
		remove_if_exists(&self.state_path)
	}
}
