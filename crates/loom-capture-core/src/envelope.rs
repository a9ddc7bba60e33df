// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event envelopes as they travel to the `/e/` endpoint.
//!
//! An immediate send carries a single `{event, properties}` object. Batched
//! sends carry an array of [`BatchedEvent`], where the capture timestamp has
//! been replaced by the milliseconds elapsed since the event happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::truncate::truncate;

/// Emitted by identify when the distinct id changes.
pub const IDENTIFY_EVENT: &str = "$identify";
/// Emitted by alias before identity reconciliation.
pub const CREATE_ALIAS_EVENT: &str = "$create_alias";
/// Emitted when the host page is torn down.
pub const PAGELEAVE_EVENT: &str = "$pageleave";
/// Emitted for page views.
pub const PAGEVIEW_EVENT: &str = "$pageview";
/// Emitted when the user opts in to capturing.
pub const OPT_IN_EVENT: &str = "$opt_in";

/// A captured event. Immutable once handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub event: String,
	pub properties: Map<String, Value>,
	#[serde(skip)]
	pub captured_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
	/// Creates an envelope without a capture timestamp.
	pub fn new(event: impl Into<String>, properties: Map<String, Value>) -> Self {
		Self {
			event: event.into(),
			properties,
			captured_at: None,
		}
	}

	/// Stamps the local capture time (builder pattern).
	pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
		self.captured_at = Some(at);
		self
	}

	/// Returns the `{event, properties}` JSON object.
	pub fn to_value(&self) -> Value {
		let mut obj = Map::new();
		obj.insert("event".to_string(), Value::String(self.event.clone()));
		obj.insert("properties".to_string(), Value::Object(self.properties.clone()));
		Value::Object(obj)
	}

	/// Returns a copy with every string value shortened to `max_len` characters.
	///
	/// The event name is truncated too; the capture timestamp is preserved.
	pub fn truncated(&self, max_len: usize) -> Self {
		let event = match truncate(&Value::String(self.event.clone()), max_len) {
			Value::String(s) => s,
			_ => self.event.clone(),
		};
		let properties = match truncate(&Value::Object(self.properties.clone()), max_len) {
			Value::Object(map) => map,
			_ => Map::new(),
		};
		Self {
			event,
			properties,
			captured_at: self.captured_at,
		}
	}

	/// Converts to the batched form, replacing the timestamp with the
	/// non-negative milliseconds elapsed between capture and `now`.
	pub fn into_batched(self, now: DateTime<Utc>) -> BatchedEvent {
		let offset = self
			.captured_at
			.map(|at| (now - at).num_milliseconds().abs())
			.unwrap_or(0);
		BatchedEvent {
			event: self.event,
			properties: self.properties,
			offset,
		}
	}
}

/// An event inside a batched `/e/` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedEvent {
	pub event: String,
	pub properties: Map<String, Value>,
	/// Milliseconds between capture and batch assembly.
	pub offset: i64,
}
