// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for report data.

use thiserror::Error;

/// Errors raised while constructing or parsing report data.
#[derive(Debug, Error)]
pub enum ReportError {
	#[error("attribute key must not be empty")]
	EmptyAttributeKey,

	#[error("invalid report id: {0}")]
	InvalidReportId(String),

	#[error("invalid report kind: {0}")]
	InvalidReportKind(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// Result type for report data operations.
pub type Result<T> = std::result::Result<T, ReportError>;
