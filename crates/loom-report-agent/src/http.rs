// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Multipart HTTP transport for report uploads.

use std::time::Duration;

use async_trait::async_trait;
use loom_common_http::{is_retryable_status, RetryConfig};
use loom_report_core::PendingReport;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AgentError, Result};
use crate::upload::Transport;

/// Header carrying the report kind.
pub const REPORT_KIND_HEADER: &str = "X-Report-Kind";
/// Multipart field holding the artifact bytes.
pub const ARTIFACT_FIELD: &str = "upload_file";

/// Posts reports as multipart forms to a fixed submission URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	http: Client,
	url: Url,
	retry_config: RetryConfig,
}

impl HttpTransport {
	pub fn new(url: Url, request_timeout: Duration, retry_config: RetryConfig) -> Result<Self> {
		let http = loom_common_http::new_client_with_timeout(request_timeout)?;
		Ok(Self {
			http,
			url,
			retry_config,
		})
	}

	pub fn url(&self) -> &Url {
		&self.url
	}

	async fn build_form(&self, report: &PendingReport) -> Result<Form> {
		let artifact = Part::bytes(report.artifact.payload.clone())
			.file_name(format!("{}.report", report.id()))
			.mime_str("application/octet-stream")?;

		let mut form = Form::new().part(ARTIFACT_FIELD, artifact);

		for (key, value) in report.attributes.iter() {
			form = form.text(key.to_string(), value.to_string());
		}

		for (index, attachment) in report.attachments.iter().enumerate() {
			match tokio::fs::read(attachment.path()).await {
				Ok(bytes) => {
					let part = Part::bytes(bytes).file_name(attachment.file_name());
					form = form.part(format!("attachment_{index}"), part);
				}
				Err(e) => {
					warn!(
						report_id = %report.id(),
						path = %attachment.path().display(),
						error = %e,
						"skipping unreadable attachment"
					);
				}
			}
		}

		Ok(form)
	}

	async fn post_once(&self, report: &PendingReport) -> Result<()> {
		let form = self.build_form(report).await?;

		let response = self
			.http
			.post(self.url.clone())
			.header(REPORT_KIND_HEADER, report.kind().to_string())
			.multipart(form)
			.send()
			.await
			.map_err(|e| {
				if e.is_timeout() || e.is_connect() || e.is_request() {
					AgentError::TransientDeliveryFailure(e.to_string())
				} else {
					AgentError::Http(e)
				}
			})?;

		let status = response.status();
		if status.is_success() {
			debug!(report_id = %report.id(), status = status.as_u16(), "upload acknowledged");
			return Ok(());
		}

		let message = response.text().await.unwrap_or_default();
		if is_retryable_status(status) {
			Err(AgentError::TransientDeliveryFailure(format!(
				"status {}: {message}",
				status.as_u16()
			)))
		} else {
			Err(AgentError::PermanentDeliveryRejection {
				status: status.as_u16(),
				message,
			})
		}
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, report: &PendingReport) -> Result<()> {
		debug!(report_id = %report.id(), url = %self.url, "uploading report");
		loom_common_http::retry(&self.retry_config, || self.post_once(report)).await
	}
}
