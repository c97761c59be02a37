// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! On-disk store of pending reports.
//!
//! Each report is three co-located files sharing the report id as stem:
//!
//! ```text
//! reports/<id>.attributes.json   attribute snapshot
//! reports/<id>.manifest.json     kind, creation time, attachment paths
//! reports/<id>.report            artifact bytes (written last)
//! ```
//!
//! The artifact is the commit marker. Enumeration only surfaces stems whose
//! `.report` file exists, and it is renamed into place after the other two
//! files, so a commit interrupted by process death is never visible.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use loom_report_core::{
	Attachment, AttributeSnapshot, PendingReport, ReportArtifact, ReportId, ReportKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attributes::AttributeStore;
use crate::error::{AgentError, Result};
use crate::fs::{ensure_dir, remove_if_exists, write_atomic, TMP_SUFFIX};

const REPORTS_DIR: &str = "reports";
const ARTIFACT_SUFFIX: &str = ".report";
const ATTRIBUTES_SUFFIX: &str = ".attributes.json";
const MANIFEST_SUFFIX: &str = ".manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
	kind: ReportKind,
	created_at: DateTime<Utc>,
	#[serde(default)]
	attachments: Vec<Attachment>,
}

/// Reference to a committed report on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingReportHandle {
	id: ReportId,
	dir: PathBuf,
}

impl PendingReportHandle {
	pub fn id(&self) -> ReportId {
		self.id
	}

	pub fn artifact_path(&self) -> PathBuf {
		self.dir.join(format!("{}{ARTIFACT_SUFFIX}", self.id))
	}

	pub fn attributes_path(&self) -> PathBuf {
		self.dir.join(format!("{}{ATTRIBUTES_SUFFIX}", self.id))
	}

	pub fn manifest_path(&self) -> PathBuf {
		self.dir.join(format!("{}{MANIFEST_SUFFIX}", self.id))
	}

	/// Whether the commit marker is still on disk.
	pub fn exists(&self) -> bool {
		self.artifact_path().exists()
	}
}

/// Oldest-first sequence of committed reports.
///
/// The directory is listed once when the sequence is created; each handle is
/// re-checked when it is reached, so reports deleted in the meantime are
/// skipped. Call [`ReportRepository::enumerate_pending`] again to restart.
#[derive(Debug)]
pub struct PendingReports {
	handles: std::vec::IntoIter<PendingReportHandle>,
}

impl Iterator for PendingReports {
	type Item = PendingReportHandle;

	fn next(&mut self) -> Option<Self::Item> {
		self.handles.by_ref().find(PendingReportHandle::exists)
	}
}

#[derive(Debug, Clone)]
pub struct ReportRepository {
	dir: PathBuf,
}

impl ReportRepository {
	/// Opens (creating if needed) the report directory under `database_path`.
	pub fn open(database_path: &Path) -> Result<Self> {
		let dir = database_path.join(REPORTS_DIR);
		ensure_dir(&dir)?;
		debug!(dir = %dir.display(), "opened report repository");
		Ok(Self { dir })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn handle(&self, id: ReportId) -> PendingReportHandle {
		PendingReportHandle {
			id,
			dir: self.dir.clone(),
		}
	}

	/// Durably stores a report so that enumeration sees all of it or none.
	pub fn commit(
		&self,
		artifact: &ReportArtifact,
		snapshot: &AttributeSnapshot,
		attachments: &[Attachment],
	) -> Result<PendingReportHandle> {
		ensure_dir(&self.dir)?;
		let handle = self.handle(artifact.id);

		let manifest = Manifest {
			kind: artifact.kind,
			created_at: Utc::now(),
			attachments: attachments.to_vec(),
		};

		let result = AttributeStore::persist(snapshot, &handle.attributes_path())
			.and_then(|()| {
				let json = serde_json::to_vec_pretty(&manifest)?;
				write_atomic(&handle.manifest_path(), &json)
			})
			.and_then(|()| write_atomic(&handle.artifact_path(), &artifact.payload));

		if let Err(e) = result {
			warn!(report_id = %artifact.id, error = %e, "report commit failed");
			let _ = remove_if_exists(&handle.attributes_path());
			let _ = remove_if_exists(&handle.manifest_path());
			return Err(e);
		}

		info!(
			report_id = %artifact.id,
			kind = %artifact.kind,
			bytes = artifact.payload.len(),
			attachments = attachments.len(),
			"committed pending report"
		);
		Ok(handle)
	}

	/// Lists committed reports, oldest first, optionally capped at `limit`.
	pub fn enumerate_pending(&self, limit: Option<usize>) -> Result<PendingReports> {
		let entries = match std::fs::read_dir(&self.dir) {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Ok(PendingReports {
					handles: Vec::new().into_iter(),
				})
			}
			Err(e) => return Err(AgentError::storage(&self.dir, e)),
		};

		let mut ids: Vec<ReportId> = entries
			.filter_map(|entry| entry.ok())
			.filter_map(|entry| {
				let name = entry.file_name();
				let name = name.to_str()?;
				let stem = name.strip_suffix(ARTIFACT_SUFFIX)?;
				match stem.parse::<ReportId>() {
					Ok(id) => Some(id),
					Err(_) => {
						debug!(file = name, "skipping unrecognised report file");
						None
					}
				}
			})
			.collect();

		ids.sort();
		if let Some(limit) = limit {
			ids.truncate(limit);
		}

		let handles: Vec<_> = ids.into_iter().map(|id| self.handle(id)).collect();
		debug!(count = handles.len(), "enumerated pending reports");
		Ok(PendingReports {
			handles: handles.into_iter(),
		})
	}

	/// Reads a committed report. Returns `None` if it was deleted meanwhile.
	pub fn load(&self, handle: &PendingReportHandle) -> Result<Option<PendingReport>> {
		let artifact_path = handle.artifact_path();
		let payload = match std::fs::read(&artifact_path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(AgentError::storage(artifact_path, e)),
		};

		let attributes = AttributeStore::read_or_empty(&handle.attributes_path());

		let manifest = std::fs::read(handle.manifest_path())
			.ok()
			.and_then(|bytes| serde_json::from_slice::<Manifest>(&bytes).ok());
		let (kind, created_at, attachments) = match manifest {
			Some(m) => (m.kind, m.created_at, m.attachments),
			None => {
				warn!(report_id = %handle.id, "missing or unreadable manifest");
				(ReportKind::Manual, Utc::now(), Vec::new())
			}
		};

		Ok(Some(PendingReport {
			artifact: ReportArtifact {
				id: handle.id,
				kind,
				payload,
			},
			attributes,
			attachments,
			created_at,
		}))
	}

	/// Removes every file of a report. Deleting twice is not an error.
	pub fn delete(&self, handle: &PendingReportHandle) -> Result<()> {
		remove_if_exists(&handle.artifact_path())?;
		remove_if_exists(&handle.attributes_path())?;
		remove_if_exists(&handle.manifest_path())?;
		debug!(report_id = %handle.id, "deleted pending report");
		Ok(())
	}

	/// Keeps a report for a later delivery pass.
	pub fn retain(&self, handle: &PendingReportHandle) {
		debug!(report_id = %handle.id, "retaining pending report for retry");
	}

	pub fn pending_count(&self) -> usize {
		self
			.enumerate_pending(None)
			.map(|reports| reports.count())
			.unwrap_or(0)
	}

	/// Deletes temporary files and orphaned attribute or manifest files left
	/// behind by commits that never completed.
	///
	/// Must run before this process commits anything, as an in-progress commit
	/// looks exactly like an interrupted one.
	pub fn purge_incomplete(&self) -> Result<usize> {
		let entries = match std::fs::read_dir(&self.dir) {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(AgentError::storage(&self.dir, e)),
		};

		let mut purged = 0;
		for entry in entries.filter_map(|entry| entry.ok()) {
			let path = entry.path();
			let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
				continue;
			};

			let stale = if name.ends_with(TMP_SUFFIX) {
				true
			} else if let Some(stem) = name
				.strip_suffix(ATTRIBUTES_SUFFIX)
				.or_else(|| name.strip_suffix(MANIFEST_SUFFIX))
			{
				!self.dir.join(format!("{stem}{ARTIFACT_SUFFIX}")).exists()
			} else {
				false
			};

			if stale {
				remove_if_exists(&path)?;
				purged += 1;
			}
		}

		if purged > 0 {
			info!(purged, "removed incomplete report files");
		}
		Ok(purged)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_report_core::AttributeMap;
	use tempfile::TempDir;

	fn create_test_repository() -> (ReportRepository, TempDir) {
		let tmp = TempDir::new().unwrap();
		let repo = ReportRepository::open(tmp.path()).unwrap();
		(repo, tmp)
	}

	fn snapshot(pairs: &[(&str, &str)]) -> AttributeSnapshot {
		AttributeSnapshot::from(
			pairs
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect::<AttributeMap>(),
		)
	}

	fn commit(repo: &ReportRepository, payload: &[u8]) -> PendingReportHandle {
		let artifact = ReportArtifact::new(ReportKind::Manual, payload.to_vec());
		repo
			.commit(&artifact, &snapshot(&[("k", "v")]), &[])
			.unwrap()
	}

	#[test]
	fn commit_then_load() {
		let (repo, _tmp) = create_test_repository();
		let artifact = ReportArtifact::new(ReportKind::NativeCrash, b"dump".to_vec());
		let attachments = vec![Attachment::new("/tmp/game.log")];

		let handle = repo
			.commit(&artifact, &snapshot(&[("level", "3")]), &attachments)
			.unwrap();
		let report = repo.load(&handle).unwrap().unwrap();

		assert_eq!(report.id(), artifact.id);
		assert_eq!(report.kind(), ReportKind::NativeCrash);
		assert_eq!(report.artifact.payload, b"dump");
		assert_eq!(report.attributes.get("level"), Some("3"));
		assert_eq!(report.attachments, attachments);
	}

	#[test]
	fn enumeration_is_oldest_first_and_capped() {
		let (repo, _tmp) = create_test_repository();
		let mut ids = Vec::new();
		for i in 0..4u8 {
			ids.push(commit(&repo, &[i]).id());
			std::thread::sleep(std::time::Duration::from_millis(2));
		}

		let listed: Vec<_> = repo
			.enumerate_pending(None)
			.unwrap()
			.map(|h| h.id())
			.collect();
		assert_eq!(listed, ids);

		let capped: Vec<_> = repo
			.enumerate_pending(Some(2))
			.unwrap()
			.map(|h| h.id())
			.collect();
		assert_eq!(capped, ids[..2].to_vec());
	}

	#[test]
	fn enumeration_is_restartable() {
		let (repo, _tmp) = create_test_repository();
		commit(&repo, b"a");
		commit(&repo, b"b");

		assert_eq!(repo.enumerate_pending(None).unwrap().count(), 2);
		assert_eq!(repo.enumerate_pending(None).unwrap().count(), 2);
	}

	#[test]
	fn interrupted_commit_is_never_enumerated() {
		let (repo, _tmp) = create_test_repository();
		let complete = commit(&repo, b"complete");

		// Process died after the attributes and manifest landed but while the
		// artifact was still being written to its temporary file.
		let id = ReportId::new();
		let partial = repo.handle(id);
		AttributeStore::persist(&snapshot(&[("a", "b")]), &partial.attributes_path()).unwrap();
		std::fs::write(partial.manifest_path(), b"{\"kind\":\"manual\"").unwrap();
		std::fs::write(
			crate::fs::tmp_path(&partial.artifact_path()),
			b"half a dump",
		)
		.unwrap();

		let listed: Vec<_> = repo.enumerate_pending(None).unwrap().collect();
		assert_eq!(listed, vec![complete]);
	}

	#[test]
	fn truncated_attributes_still_deliverable_with_empty_set() {
		let (repo, _tmp) = create_test_repository();
		let handle = commit(&repo, b"x");
		std::fs::write(handle.attributes_path(), b"{\"k\": \"v").unwrap();

		let report = repo.load(&handle).unwrap().unwrap();
		assert!(report.attributes.is_empty());
	}

	#[test]
	fn delete_is_idempotent() {
		let (repo, _tmp) = create_test_repository();
		let handle = commit(&repo, b"x");

		repo.delete(&handle).unwrap();
		repo.delete(&handle).unwrap();

		assert!(!handle.artifact_path().exists());
		assert!(!handle.attributes_path().exists());
		assert!(!handle.manifest_path().exists());
		assert!(repo.load(&handle).unwrap().is_none());

		let never_committed = repo.handle(ReportId::new());
		repo.delete(&never_committed).unwrap();
	}

	#[test]
	fn deleted_handles_are_skipped_mid_iteration() {
		let (repo, _tmp) = create_test_repository();
		let first = commit(&repo, b"1");
		std::thread::sleep(std::time::Duration::from_millis(2));
		let second = commit(&repo, b"2");

		let mut pending = repo.enumerate_pending(None).unwrap();
		repo.delete(&first).unwrap();
		assert_eq!(pending.next(), Some(second));
		assert_eq!(pending.next(), None);
	}

	#[test]
	fn purge_removes_only_incomplete_files() {
		let (repo, _tmp) = create_test_repository();
		let complete = commit(&repo, b"keep");

		let orphan = repo.handle(ReportId::new());
		AttributeStore::persist(&AttributeSnapshot::empty(), &orphan.attributes_path()).unwrap();
		std::fs::write(orphan.manifest_path(), b"{}").unwrap();
		std::fs::write(crate::fs::tmp_path(&orphan.artifact_path()), b"partial").unwrap();

		assert_eq!(repo.purge_incomplete().unwrap(), 3);
		assert!(complete.attributes_path().exists());
		assert!(complete.manifest_path().exists());
		assert_eq!(repo.pending_count(), 1);
	}

	#[test]
	fn unwritable_storage_is_storage_unavailable() {
		let tmp = TempDir::new().unwrap();
		let repo = ReportRepository::open(tmp.path()).unwrap();
		// Replace the directory with a plain file so every write fails.
		std::fs::remove_dir_all(repo.dir()).unwrap();
		std::fs::write(repo.dir(), b"not a directory").unwrap();

		let artifact = ReportArtifact::new(ReportKind::Manual, b"x".to_vec());
		let result = repo.commit(&artifact, &AttributeSnapshot::empty(), &[]);
		assert!(matches!(result, Err(AgentError::StorageUnavailable { .. })));
	}
}
