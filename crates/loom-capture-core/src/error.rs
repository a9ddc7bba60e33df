// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for capture core operations.

use thiserror::Error;

/// Errors raised while building or decoding capture payloads.
#[derive(Debug, Error)]
pub enum CoreError {
	/// JSON serialization or deserialization failed.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// The base64 layer of a payload could not be decoded.
	#[error("invalid base64 payload: {0}")]
	InvalidEncoding(#[from] base64::DecodeError),

	/// A people action key was not one of the known `$` actions.
	#[error("unknown people action: {0}")]
	UnknownAction(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
