// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery status reported back to callers.
//!
//! Plain mode reports a bare number; verbose mode reports `{status, error}`.
//! Both use the same sentinels: `1` accepted, `0` failed or skipped, `-1`
//! queued until identity is resolved.

use serde::{Deserialize, Serialize};

pub const STATUS_OK: i64 = 1;
pub const STATUS_FAILED: i64 = 0;
pub const STATUS_QUEUED: i64 = -1;

/// Structured status returned in verbose mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerboseResponse {
	#[serde(default)]
	pub status: i64,
	#[serde(default)]
	pub error: Option<String>,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
	Code(i64),
	Verbose(VerboseResponse),
}

impl DeliveryStatus {
	/// Builds a failure status in the requested shape.
	pub fn failed(verbose: bool, error: impl Into<String>) -> Self {
		if verbose {
			DeliveryStatus::Verbose(VerboseResponse {
				status: STATUS_FAILED,
				error: Some(error.into()),
			})
		} else {
			DeliveryStatus::Code(STATUS_FAILED)
		}
	}

	/// Builds the "queued until identify" status in the requested shape.
	pub fn queued(verbose: bool) -> Self {
		if verbose {
			DeliveryStatus::Verbose(VerboseResponse {
				status: STATUS_QUEUED,
				error: None,
			})
		} else {
			DeliveryStatus::Code(STATUS_QUEUED)
		}
	}

	/// Status used when capture is skipped (disabled event, opted out).
	pub fn skipped() -> Self {
		DeliveryStatus::Code(STATUS_FAILED)
	}

	pub fn code(&self) -> i64 {
		match self {
			DeliveryStatus::Code(code) => *code,
			DeliveryStatus::Verbose(resp) => resp.status,
		}
	}

	pub fn is_failure(&self) -> bool {
		self.code() == STATUS_FAILED
	}

	pub fn is_queued(&self) -> bool {
		self.code() == STATUS_QUEUED
	}

	pub fn error(&self) -> Option<&str> {
		match self {
			DeliveryStatus::Code(_) => None,
			DeliveryStatus::Verbose(resp) => resp.error.as_deref(),
		}
	}
}
