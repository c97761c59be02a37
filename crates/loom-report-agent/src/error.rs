// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the report agent.

use std::path::PathBuf;

use loom_common_http::{is_retryable_status, RetryableError};
use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in the report agent.
///
/// None of these escape a lifecycle or report entry point. They are logged,
/// published on the diagnostics channel and resolved to a no-op or to a
/// report retained for a later pass.
#[derive(Debug, Error)]
pub enum AgentError {
	/// The report directory or state file cannot be read or written.
	#[error("storage unavailable at {path}: {source}")]
	StorageUnavailable {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// A persisted attribute snapshot could not be parsed.
	#[error("corrupt attribute data at {path}: {message}")]
	CorruptAttributeData { path: PathBuf, message: String },

	/// Network or server-side failure worth retrying later.
	#[error("transient delivery failure: {0}")]
	TransientDeliveryFailure(String),

	/// The endpoint will never accept this report.
	#[error("delivery rejected (status {status}): {message}")]
	PermanentDeliveryRejection { status: u16, message: String },

	/// The upload URL is missing or malformed.
	#[error("invalid base URL: {0}")]
	InvalidBaseUrl(String),

	/// No report directory was configured and none could be derived.
	#[error("report database path is required")]
	MissingDatabasePath,

	/// The engine was disabled.
	#[error("report agent is disabled")]
	Disabled,

	/// Building the HTTP client failed.
	#[error("HTTP client error: {0}")]
	Http(#[from] reqwest::Error),

	/// Report data could not be encoded.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl AgentError {
	pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::StorageUnavailable {
			path: path.into(),
			source,
		}
	}

	pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
		Self::CorruptAttributeData {
			path: path.into(),
			message: message.into(),
		}
	}
}

impl RetryableError for AgentError {
	fn is_retryable(&self) -> bool {
		match self {
			Self::TransientDeliveryFailure(_) => true,
			Self::Http(e) => e.is_retryable(),
			Self::PermanentDeliveryRejection { status, .. } => reqwest::StatusCode::from_u16(*status)
				.map(is_retryable_status)
				.unwrap_or(false),
			_ => false,
		}
	}
}
