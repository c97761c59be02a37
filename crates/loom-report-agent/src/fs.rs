// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash-safe file helpers.
//!
//! Every durable write goes to a `.tmp` sibling first and is renamed into
//! place, so readers observe either the previous contents or the complete new
//! contents and never a torn file.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AgentError, Result};

pub(crate) const TMP_SUFFIX: &str = ".tmp";

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
	let mut name = path.as_os_str().to_os_string();
	name.push(TMP_SUFFIX);
	PathBuf::from(name)
}

/// Writes `bytes` to `path` through a synced temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
	let tmp = tmp_path(path);
	let write = || -> std::io::Result<()> {
		let mut file = std::fs::File::create(&tmp)?;
		file.write_all(bytes)?;
		file.sync_all()?;
		std::fs::rename(&tmp, path)
	};

	write().map_err(|e| {
		let _ = std::fs::remove_file(&tmp);
		AgentError::storage(path, e)
	})
}

/// Removes `path`, treating an already-missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(AgentError::storage(path, e)),
	}
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
	std::fs::create_dir_all(path).map_err(|e| AgentError::storage(path, e))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn write_atomic_replaces_contents_and_leaves_no_tmp() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("state.json");

		write_atomic(&path, b"one").unwrap();
		write_atomic(&path, b"two").unwrap();

		assert_eq!(std::fs::read(&path).unwrap(), b"two");
		assert!(!tmp_path(&path).exists());
	}

	#[test]
	fn write_atomic_into_missing_dir_is_storage_error() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("missing").join("state.json");

		let result = write_atomic(&path, b"x");
		assert!(matches!(result, Err(AgentError::StorageUnavailable { .. })));
	}

	#[test]
	fn remove_if_exists_is_idempotent() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("gone");
		std::fs::write(&path, b"x").unwrap();

		remove_if_exists(&path).unwrap();
		remove_if_exists(&path).unwrap();
		assert!(!path.exists());
	}
}
