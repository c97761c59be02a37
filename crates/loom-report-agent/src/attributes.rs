// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-wide report attributes.
//!
//! Attributes come from three layers merged by overwrite: built-in
//! environment facts, client attributes set by the application, and
//! report-scoped overrides. The client layer sits behind a single lock so
//! application threads can keep adding attributes while a snapshot is built
//! for delivery.

use std::path::Path;
use std::sync::{OnceLock, PoisonError, RwLock};
use std::time::Instant;

use loom_report_core::{validate_key, AttributeMap, AttributeSnapshot};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::fs::write_atomic;

const AGENT_NAME: &str = "loom-report-rust";
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

static PROCESS_START: OnceLock<Instant> = OnceLock::new();
static SESSION_ID: OnceLock<String> = OnceLock::new();
static ENVIRONMENT: OnceLock<AttributeMap> = OnceLock::new();

/// Identifier of the current process session.
pub fn session_id() -> &'static str {
	SESSION_ID.get_or_init(|| uuid::Uuid::now_v7().to_string())
}

fn process_start() -> Instant {
	*PROCESS_START.get_or_init(Instant::now)
}

fn read_trimmed(path: &str) -> Option<String> {
	std::fs::read_to_string(path)
		.ok()
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
}

fn environment_facts() -> &'static AttributeMap {
	ENVIRONMENT.get_or_init(|| {
		let mut facts = AttributeMap::new();
		facts.insert("uname.sysname".into(), std::env::consts::OS.into());
		facts.insert("uname.machine".into(), std::env::consts::ARCH.into());
		if let Some(release) = read_trimmed("/proc/sys/kernel/osrelease") {
			facts.insert("uname.version".into(), release);
		}
		let model = read_trimmed("/sys/devices/virtual/dmi/id/product_name")
			.unwrap_or_else(|| std::env::consts::ARCH.to_string());
		facts.insert("device.model".into(), model);
		if let Ok(name) = hostname::get() {
			facts.insert("hostname".into(), name.to_string_lossy().into_owned());
		}
		if let Ok(cpus) = std::thread::available_parallelism() {
			facts.insert("cpu.count".into(), cpus.get().to_string());
		}
		facts.insert("application.session".into(), session_id().to_string());
		facts.insert("agent.name".into(), AGENT_NAME.into());
		facts.insert("agent.version".into(), AGENT_VERSION.into());
		facts
	})
}

/// Lock-guarded attribute state shared by every component.
#[derive(Debug)]
pub struct AttributeStore {
	application: AttributeMap,
	client: RwLock<AttributeMap>,
}

impl AttributeStore {
	/// Creates a store seeded with the host's initial attributes.
	pub fn new(
		application: Option<&str>,
		application_version: Option<&str>,
		initial: AttributeMap,
	) -> Self {
		process_start();

		let mut app = AttributeMap::new();
		if let Some(name) = application {
			app.insert("application".into(), name.to_string());
		}
		if let Some(version) = application_version {
			app.insert("application.version".into(), version.to_string());
		}

		let store = Self {
			application: app,
			client: RwLock::new(AttributeMap::new()),
		};
		store.add_all(initial);
		store
	}

	/// Upserts a client attribute. Empty keys are ignored.
	pub fn add(&self, key: impl Into<String>, value: impl Into<String>) {
		let key = key.into();
		if let Err(e) = validate_key(&key) {
			warn!(error = %e, "ignoring attribute");
			return;
		}
		let mut client = self.client.write().unwrap_or_else(PoisonError::into_inner);
		client.insert(key, value.into());
	}

	pub fn add_all(&self, attributes: AttributeMap) {
		let mut client = self.client.write().unwrap_or_else(PoisonError::into_inner);
		for (key, value) in attributes {
			if let Err(e) = validate_key(&key) {
				warn!(error = %e, "ignoring attribute");
				continue;
			}
			client.insert(key, value);
		}
	}

	/// Current client attributes, without built-ins.
	pub fn attributes(&self) -> AttributeMap {
		self
			.client
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Environment facts plus the process age at the time of the call.
	pub fn built_in_attributes(&self) -> AttributeMap {
		let mut built_in = environment_facts().clone();
		built_in.extend(self.application.clone());
		built_in.insert(
			"process.age".into(),
			process_start().elapsed().as_secs().to_string(),
		);
		built_in
	}

	/// Materializes built-ins, client attributes and `overrides`, in that
	/// order of precedence.
	pub fn snapshot(&self, overrides: &AttributeMap) -> AttributeSnapshot {
		let built_in = self.built_in_attributes();
		let client = self.client.read().unwrap_or_else(PoisonError::into_inner);
		AttributeSnapshot::merge([&built_in, &*client, overrides])
	}

	/// Writes a snapshot as a flat JSON object.
	pub fn persist(snapshot: &AttributeSnapshot, path: &Path) -> Result<()> {
		let json = serde_json::to_vec_pretty(snapshot)?;
		write_atomic(path, &json)
	}

	pub fn read(path: &Path) -> Result<AttributeSnapshot> {
		let bytes = std::fs::read(path).map_err(|e| AgentError::storage(path, e))?;
		let map: AttributeMap =
			serde_json::from_slice(&bytes).map_err(|e| AgentError::corrupt(path, e.to_string()))?;
		Ok(AttributeSnapshot::from(map))
	}

	/// Reads a snapshot, falling back to an empty mapping on any failure.
	pub fn read_or_empty(path: &Path) -> AttributeSnapshot {
		match Self::read(path) {
			Ok(snapshot) => snapshot,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "unreadable attributes, using empty set");
				AttributeSnapshot::empty()
			}
		}
	}
}

impl Default for AttributeStore {
	fn default() -> Self {
		debug!("creating attribute store without application metadata");
		Self::new(None, None, AttributeMap::new())
	}
}
