// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Upload outcomes and what they mean for the local copy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a pending report should be deleted after an upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
	pub should_remove_local_copy: bool,
}

impl Disposition {
	pub const REMOVE: Self = Self {
		should_remove_local_copy: true,
	};
	pub const RETAIN: Self = Self {
		should_remove_local_copy: false,
	};
}

/// Classified result of one upload transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
	/// The endpoint acknowledged receipt.
	Delivered,
	/// The endpoint will never accept this payload.
	Rejected { status: u16, message: String },
	/// Worth trying again later.
	Transient { reason: String },
	/// Another upload of the same report was already in flight.
	InFlight,
}

impl DeliveryOutcome {
	pub fn disposition(&self) -> Disposition {
		match self {
			Self::Delivered | Self::Rejected { .. } => Disposition::REMOVE,
			Self::Transient { .. } | Self::InFlight => Disposition::RETAIN,
		}
	}
}

impl fmt::Display for DeliveryOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Delivered => write!(f, "delivered"),
			Self::Rejected { status, .. } => write!(f, "rejected ({status})"),
			Self::Transient { reason } => write!(f, "transient failure: {reason}"),
			Self::InFlight => write!(f, "already in flight"),
		}
	}
}
