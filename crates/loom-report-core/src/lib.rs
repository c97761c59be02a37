// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom report agent.
//!
//! This crate holds the data model shared by the agent and its hosts: report
//! identifiers, attribute snapshots, pending reports, the persisted lifecycle
//! record used for OOM inference, and upload dispositions. It performs no I/O.

pub mod attribute;
pub mod disposition;
pub mod error;
pub mod report;
pub mod state;

pub use attribute::{validate_key, AttributeMap, AttributeSnapshot};
pub use disposition::{DeliveryOutcome, Disposition};
pub use error::{ReportError, Result};
pub use report::{Attachment, Frame, PendingReport, ReportArtifact, ReportId, ReportKind};
pub use state::{should_report_oom, ApplicationStateSnapshot, LifecycleState, PriorState};
