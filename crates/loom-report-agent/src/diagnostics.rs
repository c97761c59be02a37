// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Non-fatal failure events for hosts that want more than log lines.

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::AgentError;

const CHANNEL_CAPACITY: usize = 64;

/// A failure the engine absorbed instead of surfacing to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
	/// Entry point or pipeline step that failed, e.g. `commit` or `oom_start`.
	pub operation: &'static str,
	pub error: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Diagnostics {
	tx: broadcast::Sender<Diagnostic>,
}

impl Diagnostics {
	pub(crate) fn new() -> Self {
		let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
		Self { tx }
	}

	pub(crate) fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
		self.tx.subscribe()
	}

	/// Logs the failure and publishes it to any subscribers.
	pub(crate) fn publish(&self, operation: &'static str, error: &AgentError) {
		warn!(operation, error = %error, "report agent operation failed");
		// No subscribers is the common case.
		let _ = self.tx.send(Diagnostic {
			operation,
			error: error.to_string(),
		});
	}
}
