// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the capture SDK.

use thiserror::Error;

/// Capture SDK errors.
///
/// Capture, identity and people calls never return these to the caller; they
/// log and report through a [`DeliveryReceipt`](crate::DeliveryReceipt)
/// instead. Errors surface from construction, the registry and the dispatcher.
#[derive(Debug, Error)]
pub enum CaptureError {
	/// Project token is missing or empty.
	#[error("project token is required")]
	InvalidToken,

	/// API host is missing or not an absolute URL.
	#[error("invalid API host: {0}")]
	InvalidApiHost(String),

	/// The client was built outside a tokio runtime.
	#[error("capture client must be built inside a tokio runtime")]
	NoRuntime,

	/// A registry instance with this name already exists.
	#[error("capture client '{0}' has already been initialized")]
	AlreadyInitialized(String),

	/// HTTP request failed.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Server returned a non-200 response.
	#[error("server error ({status}): {message}")]
	ServerError { status: u16, message: String },

	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,

	/// Caller input was rejected.
	#[error("validation failed: {0}")]
	ValidationFailed(String),

	/// Payload or configuration (de)serialization failed.
	#[error("serialization error: {0}")]
	Serialization(String),
}

impl From<loom_capture_core::CoreError> for CaptureError {
	fn from(err: loom_capture_core::CoreError) -> Self {
		CaptureError::Serialization(err.to_string())
	}
}

impl From<toml::de::Error> for CaptureError {
	fn from(err: toml::de::Error) -> Self {
		CaptureError::Serialization(err.to_string())
	}
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_error_message_includes_status() {
		let err = CaptureError::ServerError {
			status: 503,
			message: "unavailable".to_string(),
		};
		assert_eq!(err.to_string(), "server error (503): unavailable");
	}

	#[test]
	fn already_initialized_names_instance() {
		let err = CaptureError::AlreadyInitialized("secondary".to_string());
		assert!(err.to_string().contains("secondary"));
	}

	#[test]
	fn core_errors_become_serialization_errors() {
		let core = loom_capture_core::CoreError::UnknownAction("$x".to_string());
		let err: CaptureError = core.into();
		assert!(matches!(err, CaptureError::Serialization(_)));
	}
}
