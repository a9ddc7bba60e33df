// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Property maps for events and people operations.

use serde_json::{Map, Value};
use tracing::error;

/// A builder for event or people properties.
///
/// ```
/// use loom_capture::Properties;
///
/// let props = Properties::new()
///     .insert("plan", "team")
///     .insert("seats", 12);
/// assert_eq!(props.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
	inner: Map<String, Value>,
}

impl Properties {
	pub fn new() -> Self {
		Self { inner: Map::new() }
	}

	pub fn insert<K, V>(mut self, key: K, value: V) -> Self
	where
		K: Into<String>,
		V: Into<Value>,
	{
		self.inner.insert(key.into(), value.into());
		self
	}

	/// Merges `other` into this set. Keys in `other` win.
	pub fn merge(mut self, other: Properties) -> Self {
		self.inner.extend(other.inner);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.len()
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.inner.get(key)
	}

	pub fn into_map(self) -> Map<String, Value> {
		self.inner
	}

	pub fn into_value(self) -> Value {
		Value::Object(self.inner)
	}
}

impl From<Properties> for Value {
	fn from(props: Properties) -> Self {
		props.into_value()
	}
}

impl From<Properties> for Map<String, Value> {
	fn from(props: Properties) -> Self {
		props.inner
	}
}

/// Non-object values become an empty set.
impl From<Value> for Properties {
	fn from(value: Value) -> Self {
		match value {
			Value::Object(map) => Self { inner: map },
			_ => Self::new(),
		}
	}
}

impl From<Map<String, Value>> for Properties {
	fn from(map: Map<String, Value>) -> Self {
		Self { inner: map }
	}
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Properties {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		Self {
			inner: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
		}
	}
}

/// Layers maps left to right; later maps override earlier ones.
pub(crate) fn layered<'a>(layers: impl IntoIterator<Item = &'a Map<String, Value>>) -> Map<String, Value> {
	let mut merged = Map::new();
	for layer in layers {
		for (k, v) in layer {
			merged.insert(k.clone(), v.clone());
		}
	}
	merged
}

/// Removes every property named in `blacklist`.
///
/// A blacklist that is not an array is reported and ignored.
pub(crate) fn strip_blacklisted(properties: &mut Map<String, Value>, blacklist: &Value) {
	match blacklist {
		Value::Array(names) => {
			for name in names.iter().filter_map(Value::as_str) {
				properties.remove(name);
			}
		}
		other => {
			error!(blacklist = %other, "invalid value for property_blacklist config");
		}
	}
}
