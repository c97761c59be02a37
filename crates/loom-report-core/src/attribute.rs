// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! String attributes and the immutable snapshots stored next to each report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ReportError, Result};

/// A mutable key/value attribute mapping.
pub type AttributeMap = BTreeMap<String, String>;

/// Rejects keys that can never be stored.
pub fn validate_key(key: &str) -> Result<()> {
	if key.is_empty() {
		return Err(ReportError::EmptyAttributeKey);
	}
	Ok(())
}

/// An immutable attribute mapping materialized when a report is created.
///
/// Snapshots are built from ordered layers. A key present in several layers
/// takes the value of the last layer that sets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSnapshot(AttributeMap);

impl AttributeSnapshot {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Merges layers from lowest to highest precedence.
	pub fn merge<'a, I>(layers: I) -> Self
	where
		I: IntoIterator<Item = &'a AttributeMap>,
	{
		let mut merged = AttributeMap::new();
		for layer in layers {
			for (key, value) in layer {
				if key.is_empty() {
					continue;
				}
				merged.insert(key.clone(), value.clone());
			}
		}
		Self(merged)
	}

	/// Returns a copy of this snapshot with `extra` layered on top.
	pub fn extended(&self, extra: &AttributeMap) -> Self {
		Self::merge([&self.0, extra])
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	pub fn contains_key(&self, key: &str) -> bool {
		self.0.contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	pub fn as_map(&self) -> &AttributeMap {
		&self.0
	}

	pub fn into_map(self) -> AttributeMap {
		self.0
	}
}

impl From<AttributeMap> for AttributeSnapshot {
	fn from(map: AttributeMap) -> Self {
		Self::merge([&map])
	}
}
