// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Transient-failure classification and bounded retry for HTTP requests.
//!
//! Report delivery retries across `send_pending_reports` passes, so the
//! default configuration makes a single attempt. Hosts that want socket-level
//! retries inside one pass can raise `max_attempts`.

use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	pub jitter: bool,
}

impl RetryConfig {
	/// Backoff settings with the given attempt budget.
	pub fn with_attempts(max_attempts: u32) -> Self {
		Self {
			max_attempts: max_attempts.max(1),
			..Self::default()
		}
	}
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 1,
			base_delay: Duration::from_millis(250),
			max_delay: Duration::from_secs(5),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

/// Statuses that may succeed if the same request is sent again later.
pub fn is_retryable_status(status: StatusCode) -> bool {
	status.is_server_error()
		|| matches!(
			status,
			StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
		)
}

pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() || self.is_request() {
			return true;
		}

		if let Some(status) = self.status() {
			return is_retryable_status(status);
		}

		false
	}
}

fn calculate_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
	let exponential = cfg.base_delay.as_secs_f64() * cfg.backoff_factor.powi(attempt as i32);
	let capped = exponential.min(cfg.max_delay.as_secs_f64());

	let delay = if cfg.jitter {
		capped * (0.5 + fastrand::f64())
	} else {
		capped
	};

	Duration::from_secs_f64(delay)
}

pub async fn retry<F, Fut, T, E>(cfg: &RetryConfig, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Debug,
{
	let max_attempts = cfg.max_attempts.max(1);
	let mut attempt = 0;

	loop {
		match f().await {
			Ok(result) => return Ok(result),
			Err(err) => {
				attempt += 1;

				if !err.is_retryable() {
					debug!(error = ?err, attempt, "non-retryable error encountered");
					return Err(err);
				}

				if attempt >= max_attempts {
					if max_attempts > 1 {
						warn!(
							error = ?err,
							attempt,
							max_attempts,
							"retry attempts exhausted"
						);
					}
					return Err(err);
				}

				let delay = calculate_delay(cfg, attempt - 1);
				warn!(
					error = ?err,
					attempt,
					max_attempts,
					delay_ms = delay.as_millis(),
					"retrying after transient error"
				);

				tokio::time::sleep(delay).await;
			}
		}
	}
}
