// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Report artifacts and the pending delivery unit.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attribute::AttributeSnapshot;
use crate::error::ReportError;

/// Unique identifier of a report.
///
/// Ids are UUIDv7, so their string order matches creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportId(pub Uuid);

impl ReportId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for ReportId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ReportId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.hyphenated())
	}
}

impl FromStr for ReportId {
	type Err = ReportError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ReportError::InvalidReportId(s.to_string()))
	}
}

/// What produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
	/// A dump written by the native crash handler.
	NativeCrash,
	/// A termination inferred to be an out-of-memory kill.
	OutOfMemory,
	/// A report requested by application code.
	Manual,
	/// The application stopped responding.
	Hang,
}

impl fmt::Display for ReportKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NativeCrash => write!(f, "native_crash"),
			Self::OutOfMemory => write!(f, "out_of_memory"),
			Self::Manual => write!(f, "manual"),
			Self::Hang => write!(f, "hang"),
		}
	}
}

impl FromStr for ReportKind {
	type Err = ReportError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"native_crash" => Ok(Self::NativeCrash),
			"out_of_memory" => Ok(Self::OutOfMemory),
			"manual" => Ok(Self::Manual),
			"hang" => Ok(Self::Hang),
			_ => Err(ReportError::InvalidReportKind(s.to_string())),
		}
	}
}

/// Report payload bytes. Opaque for native crashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifact {
	pub id: ReportId,
	pub kind: ReportKind,
	pub payload: Vec<u8>,
}

impl ReportArtifact {
	pub fn new(kind: ReportKind, payload: Vec<u8>) -> Self {
		Self {
			id: ReportId::new(),
			kind,
			payload,
		}
	}
}

/// A file bundled with a report. Contents are never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attachment(PathBuf);

impl Attachment {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self(path.into())
	}

	pub fn path(&self) -> &Path {
		&self.0
	}

	/// File name used when the attachment is uploaded.
	pub fn file_name(&self) -> String {
		self
			.0
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| "attachment".to_string())
	}
}

impl From<PathBuf> for Attachment {
	fn from(path: PathBuf) -> Self {
		Self(path)
	}
}

/// The unit of delivery: artifact, attributes and attachments.
#[derive(Debug, Clone)]
pub struct PendingReport {
	pub artifact: ReportArtifact,
	pub attributes: AttributeSnapshot,
	pub attachments: Vec<Attachment>,
	pub created_at: DateTime<Utc>,
}

impl PendingReport {
	pub fn id(&self) -> ReportId {
		self.artifact.id
	}

	pub fn kind(&self) -> ReportKind {
		self.artifact.kind
	}
}

/// A single stack frame captured for a manual report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub module: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub lineno: Option<u32>,
	#[serde(default)]
	pub in_app: bool,
}
