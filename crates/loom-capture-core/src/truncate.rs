// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Recursive string truncation applied to every outbound payload.

use serde_json::Value;

/// Maximum length, in characters, of any string value sent over the wire.
pub const MAX_STRING_LENGTH: usize = 255;

/// Returns a copy of `value` with every string shortened to at most
/// `max_len` characters, descending through arrays and objects.
///
/// Object keys, numbers, booleans and nulls are left untouched.
pub fn truncate(value: &Value, max_len: usize) -> Value {
	match value {
		Value::String(s) => Value::String(truncate_str(s, max_len)),
		Value::Array(items) => Value::Array(items.iter().map(|v| truncate(v, max_len)).collect()),
		Value::Object(map) => Value::Object(
			map
				.iter()
				.map(|(k, v)| (k.clone(), truncate(v, max_len)))
				.collect(),
		),
		other => other.clone(),
	}
}

fn truncate_str(s: &str, max_len: usize) -> String {
	match s.char_indices().nth(max_len) {
		Some((idx, _)) => s[..idx].to_string(),
		None => s.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::json;

	#[test]
	fn long_string_cut_to_limit() {
		let long = "x".repeat(300);
		let out = truncate(&json!(long), MAX_STRING_LENGTH);
		assert_eq!(out.as_str().unwrap().chars().count(), 255);
	}

	#[test]
	fn nested_structures_are_truncated() {
		let long = "y".repeat(400);
		let value = json!({
			"event": "signup",
			"properties": {
				"note": long,
				"tags": [long, "short"],
				"count": 3,
				"flag": true,
				"missing": null
			}
		});

		let out = truncate(&value, 10);
		assert_eq!(out["properties"]["note"], "yyyyyyyyyy");
		assert_eq!(out["properties"]["tags"][0], "yyyyyyyyyy");
		assert_eq!(out["properties"]["tags"][1], "short");
		assert_eq!(out["properties"]["count"], 3);
		assert_eq!(out["properties"]["flag"], true);
		assert!(out["properties"]["missing"].is_null());
	}

	#[test]
	fn multibyte_characters_are_not_split() {
		let s = "é".repeat(300);
		let out = truncate(&json!(s), 255);
		assert_eq!(out.as_str().unwrap(), "é".repeat(255));
	}

	#[test]
	fn keys_are_never_truncated() {
		let key = "k".repeat(300);
		let mut map = serde_json::Map::new();
		map.insert(key.clone(), json!("v"));
		let out = truncate(&Value::Object(map), 5);
		assert!(out.get(&key).is_some());
	}

	proptest! {
		#[test]
		fn truncated_strings_never_exceed_limit(s in ".{0,600}", limit in 1usize..300) {
			let out = truncate(&Value::String(s.clone()), limit);
			let out = out.as_str().unwrap();
			prop_assert!(out.chars().count() <= limit);
			prop_assert!(s.starts_with(out));
		}

		#[test]
		fn short_strings_are_unchanged(s in "[a-z]{0,50}") {
			let out = truncate(&Value::String(s.clone()), MAX_STRING_LENGTH);
			prop_assert_eq!(out, Value::String(s));
		}
	}
}
