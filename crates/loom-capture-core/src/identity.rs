// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identity bookkeeping for the capture client.
//!
//! The identity fields live in the persistence store under the keys below.
//! [`IdentityState`] is a read-only snapshot assembled from those keys; the
//! SDK's identity manager is the only writer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// The id events are currently grouped under.
pub const DISTINCT_ID_KEY: &str = "distinct_id";
/// Stable per-device id, independent of identify calls.
pub const DEVICE_ID_KEY: &str = "$device_id";
/// The id last passed to identify.
pub const USER_ID_KEY: &str = "$user_id";
/// Pending alias recorded by alias before reconciliation.
pub const ALIAS_ID_KEY: &str = "__alias";
/// Id already bound to a people profile; aliasing onto it would duplicate users.
pub const PEOPLE_DISTINCT_ID_KEY: &str = "$people_distinct_id";
/// Set when the device id was seeded from a previously persisted distinct id.
pub const HAD_PERSISTED_DISTINCT_ID_KEY: &str = "$had_persisted_distinct_id";

/// Generates a fresh random distinct id.
pub fn generate_distinct_id() -> String {
	Uuid::now_v7().to_string()
}

/// Snapshot of the client's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityState {
	pub distinct_id: String,
	pub device_id: Option<String>,
	pub user_id: Option<String>,
	pub alias_id: Option<String>,
	pub had_persisted_distinct_id: bool,
	pub identify_called: bool,
}

impl IdentityState {
	/// Reads the identity fields out of a persisted property map.
	pub fn from_properties(props: &Map<String, Value>, identify_called: bool) -> Self {
		Self {
			distinct_id: string_prop(props, DISTINCT_ID_KEY).unwrap_or_default(),
			device_id: string_prop(props, DEVICE_ID_KEY),
			user_id: string_prop(props, USER_ID_KEY),
			alias_id: string_prop(props, ALIAS_ID_KEY),
			had_persisted_distinct_id: props
				.get(HAD_PERSISTED_DISTINCT_ID_KEY)
				.and_then(Value::as_bool)
				.unwrap_or(false),
			identify_called,
		}
	}

	/// Properties carried by the `$identify` event.
	pub fn identify_event_properties(new_distinct_id: &str, anon_distinct_id: &str) -> Map<String, Value> {
		let mut props = Map::new();
		props.insert(DISTINCT_ID_KEY.to_string(), Value::String(new_distinct_id.to_string()));
		props.insert(
			"$anon_distinct_id".to_string(),
			Value::String(anon_distinct_id.to_string()),
		);
		props
	}

	/// Properties carried by the `$create_alias` event.
	pub fn alias_event_properties(alias: &str, original: &str) -> Map<String, Value> {
		let mut props = Map::new();
		props.insert("alias".to_string(), Value::String(alias.to_string()));
		props.insert(DISTINCT_ID_KEY.to_string(), Value::String(original.to_string()));
		props
	}
}

fn string_prop(props: &Map<String, Value>, key: &str) -> Option<String> {
	props
		.get(key)
		.and_then(Value::as_str)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::json;

	#[test]
	fn from_properties_reads_all_fields() {
		let props = json!({
			"distinct_id": "d1",
			"$device_id": "dev",
			"$user_id": "u1",
			"__alias": "a1",
			"$had_persisted_distinct_id": true
		});
		let state = IdentityState::from_properties(props.as_object().unwrap(), true);
		assert_eq!(state.distinct_id, "d1");
		assert_eq!(state.device_id.as_deref(), Some("dev"));
		assert_eq!(state.user_id.as_deref(), Some("u1"));
		assert_eq!(state.alias_id.as_deref(), Some("a1"));
		assert!(state.had_persisted_distinct_id);
		assert!(state.identify_called);
	}

	#[test]
	fn empty_device_id_reads_as_missing() {
		let props = json!({"distinct_id": "d1", "$device_id": ""});
		let state = IdentityState::from_properties(props.as_object().unwrap(), false);
		assert_eq!(state.device_id, None);
		assert!(!state.had_persisted_distinct_id);
	}

	#[test]
	fn identify_event_properties_carry_both_ids() {
		let props = IdentityState::identify_event_properties("user@example.com", "anon_1");
		assert_eq!(props["distinct_id"], "user@example.com");
		assert_eq!(props["$anon_distinct_id"], "anon_1");
	}

	#[test]
	fn alias_event_properties_carry_alias_and_original() {
		let props = IdentityState::alias_event_properties("new", "old");
		assert_eq!(props["alias"], "new");
		assert_eq!(props["distinct_id"], "old");
	}

	proptest! {
		#[test]
		fn generated_ids_are_unique_and_non_empty(_seed: u64) {
			let a = generate_distinct_id();
			let b = generate_distinct_id();
			prop_assert!(!a.is_empty());
			prop_assert_ne!(a, b);
		}
	}
}
