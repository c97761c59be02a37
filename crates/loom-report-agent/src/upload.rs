// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Single upload transactions and their dispositions.
//!
//! [`UploadClient::upload`] never blocks the caller: the transfer runs on the
//! tokio runtime and its result arrives through an [`UploadTicket`] that
//! resolves exactly once. The client does not retry on its own; a retained
//! report is picked up again by the next delivery pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use loom_report_core::{DeliveryOutcome, Disposition, PendingReport, ReportId};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Moves one report to the remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
	/// Sends the report. `Ok` means the endpoint acknowledged receipt.
	async fn send(&self, report: &PendingReport) -> Result<()>;
}

/// Maps a transport result onto the delivery outcome taxonomy.
pub fn classify(result: Result<()>) -> DeliveryOutcome {
	match result {
		Ok(()) => DeliveryOutcome::Delivered,
		Err(AgentError::PermanentDeliveryRejection { status, message }) => {
			DeliveryOutcome::Rejected { status, message }
		}
		Err(e) => DeliveryOutcome::Transient {
			reason: e.to_string(),
		},
	}
}

/// Pending result of one upload.
#[derive(Debug)]
pub struct UploadTicket {
	id: ReportId,
	rx: oneshot::Receiver<DeliveryOutcome>,
}

impl UploadTicket {
	pub fn id(&self) -> ReportId {
		self.id
	}

	/// Waits for the upload to finish.
	pub async fn outcome(self) -> DeliveryOutcome {
		self
			.rx
			.await
			.unwrap_or_else(|_| DeliveryOutcome::Transient {
				reason: "upload task ended without a result".to_string(),
			})
	}

	pub async fn disposition(self) -> Disposition {
		self.outcome().await.disposition()
	}
}

struct InFlightGuard {
	id: ReportId,
	in_flight: Arc<Mutex<HashSet<ReportId>>>,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self
			.in_flight
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&self.id);
	}
}

/// Runs uploads in the background, at most one per report id.
#[derive(Clone)]
pub struct UploadClient {
	transport: Arc<dyn Transport>,
	runtime: Handle,
	in_flight: Arc<Mutex<HashSet<ReportId>>>,
}

impl UploadClient {
	pub fn new(transport: Arc<dyn Transport>, runtime: Handle) -> Self {
		Self {
			transport,
			runtime,
			in_flight: Arc::new(Mutex::new(HashSet::new())),
		}
	}

	fn claim(&self, id: ReportId) -> Option<InFlightGuard> {
		let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
		if !in_flight.insert(id) {
			return None;
		}
		Some(InFlightGuard {
			id,
			in_flight: Arc::clone(&self.in_flight),
		})
	}

	/// Starts uploading `report` and returns immediately.
	pub fn upload(&self, report: PendingReport) -> UploadTicket {
		let id = report.id();
		let (tx, rx) = oneshot::channel();

		let Some(guard) = self.claim(id) else {
			debug!(report_id = %id, "upload already in flight, skipping");
			let _ = tx.send(DeliveryOutcome::InFlight);
			return UploadTicket { id, rx };
		};

		let transport = Arc::clone(&self.transport);
		self.runtime.spawn(async move {
			let _guard = guard;
			let outcome = classify(transport.send(&report).await);

			match &outcome {
				DeliveryOutcome::Delivered => {
					info!(report_id = %id, kind = %report.kind(), "report delivered")
				}
				DeliveryOutcome::Rejected { status, message } => warn!(
					report_id = %id,
					status,
					message = %message,
					"report rejected by endpoint, discarding"
				),
				DeliveryOutcome::Transient { reason } => warn!(
					report_id = %id,
					reason = %reason,
					"report delivery failed, will retry later"
				),
				DeliveryOutcome::InFlight => {}
			}

			let _ = tx.send(outcome);
		});

		UploadTicket { id, rx }
	}

	/// Number of uploads currently running.
	pub fn in_flight(&self) -> usize {
		self
			.in_flight
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use loom_report_core::{AttributeSnapshot, ReportArtifact, ReportKind};
	use tokio::sync::Notify;

	fn report() -> PendingReport {
		PendingReport {
			artifact: ReportArtifact::new(ReportKind::Manual, b"payload".to_vec()),
			attributes: AttributeSnapshot::empty(),
			attachments: Vec::new(),
			created_at: Utc::now(),
		}
	}

	struct FixedTransport(fn() -> Result<()>);

	#[async_trait]
	impl Transport for FixedTransport {
		async fn send(&self, _report: &PendingReport) -> Result<()> {
			(self.0)()
		}
	}

	struct BlockingTransport {
		release: Arc<Notify>,
	}

	#[async_trait]
	impl Transport for BlockingTransport {
		async fn send(&self, _report: &PendingReport) -> Result<()> {
			self.release.notified().await;
			Ok(())
		}
	}

	fn client(transport: impl Transport + 'static) -> UploadClient {
		UploadClient::new(Arc::new(transport), Handle::current())
	}

	#[tokio::test]
	async fn success_removes_local_copy() {
		let client = client(FixedTransport(|| Ok(())));
		let disposition = client.upload(report()).disposition().await;
		assert_eq!(disposition, Disposition::REMOVE);
	}

	#[tokio::test]
	async fn permanent_rejection_removes_local_copy() {
		let client = client(FixedTransport(|| {
			Err(AgentError::PermanentDeliveryRejection {
				status: 413,
				message: "entity too large".into(),
			})
		}));
		let outcome = client.upload(report()).outcome().await;
		assert!(matches!(outcome, DeliveryOutcome::Rejected { status: 413, .. }));
		assert!(outcome.disposition().should_remove_local_copy);
	}

	#[tokio::test]
	async fn transient_failure_retains_local_copy() {
		let client = client(FixedTransport(|| {
			Err(AgentError::TransientDeliveryFailure("connection refused".into()))
		}));
		let disposition = client.upload(report()).disposition().await;
		assert_eq!(disposition, Disposition::RETAIN);
	}

	#[tokio::test]
	async fn same_report_is_not_uploaded_twice_concurrently() {
		let release = Arc::new(Notify::new());
		let client = client(BlockingTransport {
			release: Arc::clone(&release),
		});
		let report = report();

		let first = client.upload(report.clone());
		let second = client.upload(report.clone());
		assert_eq!(second.outcome().await, DeliveryOutcome::InFlight);
		assert_eq!(client.in_flight(), 1);

		release.notify_one();
		assert_eq!(first.outcome().await, DeliveryOutcome::Delivered);

		// The guard is released once the task finishes.
		tokio::task::yield_now().await;
		let third = client.upload(report);
		release.notify_one();
		assert_eq!(third.outcome().await, DeliveryOutcome::Delivered);
	}

	#[test]
	fn classify_maps_errors() {
		assert_eq!(classify(Ok(())), DeliveryOutcome::Delivered);
		assert!(matches!(
			classify(Err(AgentError::TransientDeliveryFailure("503".into()))),
			DeliveryOutcome::Transient { .. }
		));
		assert!(matches!(
			classify(Err(AgentError::MissingDatabasePath)),
			DeliveryOutcome::Transient { .. }
		));
		assert!(matches!(
			classify(Err(AgentError::PermanentDeliveryRejection {
				status: 413,
				message: "payload too large".into(),
			})),
			DeliveryOutcome::Rejected { status: 413, .. }
		));
	}
}
