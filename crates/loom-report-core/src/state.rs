// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Application lifecycle state used to infer out-of-memory terminations.
//!
//! The operating system does not report OOM kills to the victim process. The
//! agent instead persists a small [`ApplicationStateSnapshot`] on every
//! lifecycle transition and, on the next start, inspects what the previous
//! session last wrote. A session that was last seen in the foreground with no
//! debugger attached, and that never reached a graceful exit, is reported as
//! an OOM termination.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the application is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
	/// No snapshot has been recorded yet, e.g. on first run.
	Unknown,
	Foreground,
	Background,
}

impl fmt::Display for LifecycleState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Unknown => write!(f, "unknown"),
			Self::Foreground => write!(f, "foreground"),
			Self::Background => write!(f, "background"),
		}
	}
}

/// The single persisted lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationStateSnapshot {
	pub in_foreground: bool,
	pub debugger_attached: bool,
	pub low_memory_warning_seen: bool,
	pub last_update: DateTime<Utc>,
	/// Session that wrote the record.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	/// Application version of the session that wrote the record.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app_version: Option<String>,
}

impl ApplicationStateSnapshot {
	/// The record written when a session starts.
	pub fn fresh(debugger_attached: bool) -> Self {
		Self {
			in_foreground: true,
			debugger_attached,
			low_memory_warning_seen: false,
			last_update: Utc::now(),
			session_id: None,
			app_version: None,
		}
	}

	pub fn with_session(mut self, session_id: impl Into<String>, app_version: Option<String>) -> Self {
		self.session_id = Some(session_id.into());
		self.app_version = app_version;
		self
	}

	pub fn lifecycle_state(&self) -> LifecycleState {
		if self.in_foreground {
			LifecycleState::Foreground
		} else {
			LifecycleState::Background
		}
	}

	pub fn touch(&mut self) {
		self.last_update = Utc::now();
	}
}

/// What the previous session left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorState {
	/// Nothing usable was recorded: first run, graceful exit or corrupt data.
	Unknown,
	Recorded(ApplicationStateSnapshot),
}

impl PriorState {
	pub fn snapshot(&self) -> Option<&ApplicationStateSnapshot> {
		match self {
			Self::Unknown => None,
			Self::Recorded(snapshot) => Some(snapshot),
		}
	}
}

impl From<Option<ApplicationStateSnapshot>> for PriorState {
	fn from(snapshot: Option<ApplicationStateSnapshot>) -> Self {
		snapshot.map_or(Self::Unknown, Self::Recorded)
	}
}

/// Decides whether the previous session ended in an OOM kill.
///
/// True only when a prior record exists, it says the application was in the
/// foreground, and no debugger was attached. `low_memory_warning_seen` is
/// reported alongside but never gates the decision.
pub fn should_report_oom(prior: &PriorState) -> bool {
	match prior.snapshot() {
		Some(snapshot) => snapshot.in_foreground && !snapshot.debugger_attached,
		None => false,
	}
}
