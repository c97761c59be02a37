// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use loom_common_http::RetryConfig;
use loom_report_core::{Attachment, AttributeMap};
use url::Url;

use crate::error::{AgentError, Result};

/// Environment variable holding the submission URL.
pub const ENV_URL: &str = "LOOM_REPORT_URL";
/// Environment variable holding the report database directory.
pub const ENV_DATABASE: &str = "LOOM_REPORT_DATABASE";
pub const ENV_APPLICATION: &str = "LOOM_REPORT_APPLICATION";
pub const ENV_VERSION: &str = "LOOM_REPORT_VERSION";
/// Set to `0`/`false` to turn OOM inference off.
pub const ENV_OOM: &str = "LOOM_REPORT_OOM";

const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 4;

/// `~/.local/share/loom/reports` or the platform equivalent.
pub fn default_database_path() -> Option<PathBuf> {
	dirs::data_dir().map(|data| data.join("loom").join("reports"))
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
	/// Endpoint that receives multipart report uploads.
	pub base_url: Url,
	/// Directory holding pending reports and the lifecycle record.
	pub database_path: PathBuf,
	pub application: Option<String>,
	pub application_version: Option<String>,
	/// Initial client attributes.
	pub attributes: AttributeMap,
	/// Attached to every crash and manual report.
	pub attachments: Vec<Attachment>,
	pub oom_support: bool,
	/// Attached to inferred OOM reports.
	pub oom_attachments: Vec<Attachment>,
	pub request_timeout: Duration,
	pub retry_config: RetryConfig,
	/// Upper bound on uploads per delivery pass.
	pub max_reports_per_pass: Option<usize>,
	/// Uploads a delivery pass keeps in flight at once. Never zero.
	pub max_concurrent_uploads: usize,
	/// Crash dumps left by the previous session, committed before OOM
	/// inference runs.
	pub pending_crashes: Vec<PathBuf>,
	/// Overrides debugger detection.
	pub debugger_attached: Option<bool>,
}

impl AgentConfig {
	pub fn builder() -> AgentConfigBuilder {
		AgentConfigBuilder::new()
	}

	/// Loads configuration from `LOOM_REPORT_*` environment variables.
	///
	/// When no database path is set, reports live under the XDG data
	/// directory (`~/.local/share/loom/reports`).
	pub fn from_env() -> Result<Self> {
		let mut builder = Self::builder();

		if let Ok(url) = std::env::var(ENV_URL) {
			builder = builder.base_url(url);
		}

		match std::env::var_os(ENV_DATABASE) {
			Some(path) => builder = builder.database_path(path),
			None => {
				if let Some(path) = default_database_path() {
					builder = builder.database_path(path);
				}
			}
		}

		if let Ok(name) = std::env::var(ENV_APPLICATION) {
			builder = builder.application(name);
		}
		if let Ok(version) = std::env::var(ENV_VERSION) {
			builder = builder.application_version(version);
		}
		if let Ok(flag) = std::env::var(ENV_OOM) {
			builder = builder.oom_support(!matches!(flag.trim(), "0" | "false" | "no" | "off"));
		}

		builder.build()
	}
}

/// Builder for [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct AgentConfigBuilder {
	base_url: Option<String>,
	database_path: Option<PathBuf>,
	application: Option<String>,
	application_version: Option<String>,
	attributes: AttributeMap,
	attachments: Vec<Attachment>,
	oom_support: bool,
	oom_attachments: Vec<Attachment>,
	request_timeout: Duration,
	retry_config: RetryConfig,
	max_reports_per_pass: Option<usize>,
	max_concurrent_uploads: usize,
	pending_crashes: Vec<PathBuf>,
	debugger_attached: Option<bool>,
}

impl AgentConfigBuilder {
	pub fn new() -> Self {
		Self {
			base_url: None,
			database_path: None,
			application: None,
			application_version: None,
			attributes: AttributeMap::new(),
			attachments: Vec::new(),
			oom_support: true,
			oom_attachments: Vec::new(),
			request_timeout: Duration::from_secs(30),
			retry_config: RetryConfig::default(),
			max_reports_per_pass: None,
			max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
			pending_crashes: Vec::new(),
			debugger_attached: None,
		}
	}

	/// Sets the submission URL.
	///
	/// Example: `https://reports.example.com/api/v1/submit?token=...`
	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.base_url = Some(url.into());
		self
	}

	pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.database_path = Some(path.into());
		self
	}

	pub fn application(mut self, name: impl Into<String>) -> Self {
		self.application = Some(name.into());
		self
	}

	pub fn application_version(mut self, version: impl Into<String>) -> Self {
		self.application_version = Some(version.into());
		self
	}

	pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.attributes.insert(key.into(), value.into());
		self
	}

	pub fn attributes(mut self, attributes: AttributeMap) -> Self {
		self.attributes.extend(attributes);
		self
	}

	pub fn attachment(mut self, path: impl Into<PathBuf>) -> Self {
		self.attachments.push(Attachment::new(path));
		self
	}

	pub fn oom_support(mut self, enabled: bool) -> Self {
		self.oom_support = enabled;
		self
	}

	pub fn oom_attachment(mut self, path: impl Into<PathBuf>) -> Self {
		self.oom_attachments.push(Attachment::new(path));
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	pub fn retry_config(mut self, config: RetryConfig) -> Self {
		self.retry_config = config;
		self
	}

	pub fn max_reports_per_pass(mut self, max: usize) -> Self {
		self.max_reports_per_pass = Some(max);
		self
	}

	/// Clamped to at least one.
	pub fn max_concurrent_uploads(mut self, max: usize) -> Self {
		self.max_concurrent_uploads = max.max(1);
		self
	}

	/// Hands over a crash dump written by the previous session. It is
	/// committed at start, before the previous session is judged for an OOM.
	pub fn pending_crash(mut self, path: impl Into<PathBuf>) -> Self {
		self.pending_crashes.push(path.into());
		self
	}

	/// Forces the debugger-attached flag instead of probing the process.
	pub fn debugger_attached(mut self, attached: bool) -> Self {
		self.debugger_attached = Some(attached);
		self
	}

	pub fn build(self) -> Result<AgentConfig> {
		let raw_url = self
			.base_url
			.ok_or_else(|| AgentError::InvalidBaseUrl("missing".to_string()))?;
		let base_url = Url::parse(raw_url.trim())
			.map_err(|e| AgentError::InvalidBaseUrl(format!("{raw_url}: {e}")))?;
		if !matches!(base_url.scheme(), "http" | "https") {
			return Err(AgentError::InvalidBaseUrl(format!(
				"unsupported scheme {}",
				base_url.scheme()
			)));
		}

		let database_path = self.database_path.ok_or(AgentError::MissingDatabasePath)?;

		Ok(AgentConfig {
			base_url,
			database_path,
			application: self.application,
			application_version: self.application_version,
			attributes: self.attributes,
			attachments: self.attachments,
			oom_support: self.oom_support,
			oom_attachments: self.oom_attachments,
			request_timeout: self.request_timeout,
			retry_config: self.retry_config,
			max_reports_per_pass: self.max_reports_per_pass,
			max_concurrent_uploads: self.max_concurrent_uploads.max(1),
			pending_crashes: self.pending_crashes,
			debugger_attached: self.debugger_attached,
		})
	}
}

impl Default for AgentConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}
