// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Consent (opt-in / opt-out) model.

use serde::{Deserialize, Serialize};

/// Prefix of the storage key holding a consent record.
pub const DEFAULT_CONSENT_PREFIX: &str = "__ph_opt_in_out_";

/// Where a consent record is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMedium {
	Cookie,
	#[serde(alias = "localStorage", alias = "local_storage")]
	Local,
}

/// Effective consent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
	/// Nothing recorded; capturing is active.
	Unknown,
	OptedIn,
	OptedOut,
}

impl ConsentState {
	/// Parses the stored representation (`"1"` in, `"0"` out).
	pub fn from_stored(value: &str) -> Self {
		match value {
			"1" | "true" => ConsentState::OptedIn,
			"0" | "false" => ConsentState::OptedOut,
			_ => ConsentState::Unknown,
		}
	}

	/// The stored representation, or `None` for [`ConsentState::Unknown`].
	pub fn to_stored(self) -> Option<&'static str> {
		match self {
			ConsentState::OptedIn => Some("1"),
			ConsentState::OptedOut => Some("0"),
			ConsentState::Unknown => None,
		}
	}
}

/// Snapshot of consent as seen by the capture pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
	pub opted_in: bool,
	pub opted_out: bool,
	pub persistence_type: StorageMedium,
	pub storage_prefix: String,
}

impl ConsentRecord {
	pub fn new(state: ConsentState, persistence_type: StorageMedium, storage_prefix: impl Into<String>) -> Self {
		Self {
			opted_in: state == ConsentState::OptedIn,
			opted_out: state == ConsentState::OptedOut,
			persistence_type,
			storage_prefix: storage_prefix.into(),
		}
	}

	pub fn state(&self) -> ConsentState {
		match (self.opted_in, self.opted_out) {
			(_, true) => ConsentState::OptedOut,
			(true, false) => ConsentState::OptedIn,
			(false, false) => ConsentState::Unknown,
		}
	}

	/// Storage key for the given project token.
	pub fn storage_key(&self, token: &str) -> String {
		storage_key(&self.storage_prefix, token)
	}
}

/// Builds the storage key `{prefix}{token}`.
pub fn storage_key(prefix: &str, token: &str) -> String {
	format!("{prefix}{token}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stored_values_round_trip() {
		for state in [ConsentState::OptedIn, ConsentState::OptedOut] {
			let stored = state.to_stored().unwrap();
			assert_eq!(ConsentState::from_stored(stored), state);
		}
		assert_eq!(ConsentState::Unknown.to_stored(), None);
		assert_eq!(ConsentState::from_stored("maybe"), ConsentState::Unknown);
	}

	#[test]
	fn record_state_matches_flags() {
		let record = ConsentRecord::new(ConsentState::OptedOut, StorageMedium::Local, DEFAULT_CONSENT_PREFIX);
		assert!(record.opted_out);
		assert!(!record.opted_in);
		assert_eq!(record.state(), ConsentState::OptedOut);
	}

	#[test]
	fn storage_key_joins_prefix_and_token() {
		let record = ConsentRecord::new(ConsentState::Unknown, StorageMedium::Cookie, "__p_");
		assert_eq!(record.storage_key("tok"), "__p_tok");
	}

	#[test]
	fn medium_accepts_legacy_spelling() {
		let medium: StorageMedium = serde_json::from_str(r#""localStorage""#).unwrap();
		assert_eq!(medium, StorageMedium::Local);
	}
}
