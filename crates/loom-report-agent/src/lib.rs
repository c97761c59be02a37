// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash and out-of-memory report agent.
//!
//! Reports are committed to a local directory before any delivery attempt and
//! are removed only once the endpoint has accepted or permanently rejected
//! them, so a report survives process death at any point in between.
//!
//! # Example
//!
//! ```ignore
//! use loom_report_agent::{AgentConfig, Engine};
//!
//! let engine = Engine::start(AgentConfig::from_env()?).await?;
//! engine.install_panic_hook();
//! engine.add_attribute("scene", "main_menu");
//!
//! let summary = engine.send_pending_reports().await;
//! println!("{} delivered, {} retained", summary.delivered, summary.retained);
//! ```

pub mod attributes;
pub mod backtrace;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
mod fs;
pub mod http;
pub mod oom;
pub mod repository;
pub mod upload;

pub use attributes::AttributeStore;
pub use config::{AgentConfig, AgentConfigBuilder};
pub use diagnostics::Diagnostic;
pub use engine::{DeliverySummary, Engine};
pub use error::{AgentError, Result};
pub use http::HttpTransport;
pub use oom::{OomEvaluation, OomWatcher};
pub use repository::{PendingReportHandle, PendingReports, ReportRepository};
pub use upload::{classify, Transport, UploadClient, UploadTicket};

pub use loom_common_http::RetryConfig;
pub use loom_report_core::{
	Attachment, AttributeMap, AttributeSnapshot, DeliveryOutcome, Disposition, LifecycleState,
	PendingReport, ReportId, ReportKind,
};
