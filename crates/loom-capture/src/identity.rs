// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identify, alias and reset.

use std::sync::atomic::Ordering;

use loom_capture_core::{
	generate_distinct_id, IdentityState, ALIAS_ID_KEY, CREATE_ALIAS_EVENT,
	DEVICE_ID_KEY, DISTINCT_ID_KEY, HAD_PERSISTED_DISTINCT_ID_KEY, IDENTIFY_EVENT,
	PEOPLE_DISTINCT_ID_KEY, USER_ID_KEY,
};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::client::{CaptureClient, CaptureOptions, Captured};
use crate::transport::DeliveryReceipt;

/// Code returned when the alias equals the original id.
pub const ALIAS_SAME_AS_ORIGINAL: i64 = -1;
/// Code returned when the alias is already bound to a people profile.
pub const ALIAS_CONFLICT: i64 = -2;

/// Outcome of [`CaptureClient::alias`].
#[derive(Debug)]
pub enum AliasOutcome {
	/// `$create_alias` was sent. The receipt resolves after the follow-up
	/// identify has run, with the status of the alias event.
	Created(Captured),
	/// The alias equals the original id; identify ran directly.
	SameAsOriginal,
	/// The alias is already bound to an identified profile. Nothing was sent.
	Conflict,
}

impl AliasOutcome {
	/// Numeric code for the non-created outcomes.
	pub fn code(&self) -> Option<i64> {
		match self {
			AliasOutcome::Created(_) => None,
			AliasOutcome::SameAsOriginal => Some(ALIAS_SAME_AS_ORIGINAL),
			AliasOutcome::Conflict => Some(ALIAS_CONFLICT),
		}
	}
}

fn single(key: &str, value: Value) -> Map<String, Value> {
	let mut map = Map::new();
	map.insert(key.to_string(), value);
	map
}

impl CaptureClient {
	/// True once identify has run since build or the last reset.
	pub fn is_identified(&self) -> bool {
		self.inner.identify_called.load(Ordering::SeqCst)
	}

	/// Associates future events with `new_distinct_id`.
	///
	/// Flushes queued people operations and captures `$identify` when the
	/// distinct id actually changes. Returns that event's payload.
	pub fn identify(&self, new_distinct_id: &str) -> Option<Value> {
		if new_distinct_id.is_empty() {
			error!("Unique user id has not been set in identify");
			return None;
		}
		let persistence = &self.inner.persistence;
		let previous = self.get_distinct_id();

		persistence.register(single(USER_ID_KEY, Value::from(new_distinct_id)));

		let has_device_id = persistence
			.get(DEVICE_ID_KEY)
			.and_then(|v| v.as_str().map(|s| !s.is_empty()))
			.unwrap_or(false);
		if !has_device_id {
			let mut seed = single(HAD_PERSISTED_DISTINCT_ID_KEY, Value::Bool(true));
			seed.insert(DEVICE_ID_KEY.to_string(), Value::from(previous.as_str()));
			persistence.register_once(seed, Some(&Value::String(String::new())));
		}

		let alias = persistence.get(ALIAS_ID_KEY);
		let is_pending_alias = alias.as_ref().and_then(Value::as_str) == Some(new_distinct_id);
		if new_distinct_id != previous && !is_pending_alias {
			persistence.unregister(ALIAS_ID_KEY);
			persistence.register(single(DISTINCT_ID_KEY, Value::from(new_distinct_id)));
		}
		persistence.register(single(PEOPLE_DISTINCT_ID_KEY, Value::from(new_distinct_id)));

		self.inner.identify_called.store(true, Ordering::SeqCst);
		let flush = self.people().flush();
		debug!(operations = flush.len(), "Flushed queued people operations on identify");

		if new_distinct_id == previous {
			return None;
		}
		self.capture(
			IDENTIFY_EVENT,
			IdentityState::identify_event_properties(new_distinct_id, &previous),
		)
	}

	/// Declares `alias` as another id for `original` (default: the current
	/// distinct id).
	pub fn alias(&self, alias: &str, original: Option<&str>) -> AliasOutcome {
		let bound = self.inner.persistence.get(PEOPLE_DISTINCT_ID_KEY);
		if bound.as_ref().and_then(Value::as_str) == Some(alias) {
			error!(
				critical = true,
				alias = %alias,
				"Attempting to create alias for existing People user - aborting"
			);
			return AliasOutcome::Conflict;
		}

		let original = original
			.map(str::to_string)
			.unwrap_or_else(|| self.get_distinct_id());
		if alias == original {
			error!(alias = %alias, "alias matches current distinct_id - skipping api call");
			self.identify(alias);
			return AliasOutcome::SameAsOriginal;
		}

		self
			.inner
			.persistence
			.register(single(ALIAS_ID_KEY, Value::from(alias)));
		let captured = self.capture_with(
			CREATE_ALIAS_EVENT,
			IdentityState::alias_event_properties(alias, &original),
			CaptureOptions::tracked(),
		);

		let (tx, receipt) = DeliveryReceipt::channel();
		let client = self.clone();
		let alias = alias.to_string();
		let pending = captured.receipt;
		self.inner.runtime.spawn(async move {
			let status = pending.wait().await;
			client.identify(&alias);
			if let Some(status) = status {
				let _ = tx.send(status);
			}
		});
		AliasOutcome::Created(Captured {
			payload: captured.payload,
			receipt,
		})
	}

	/// Clears identity and super properties and starts a new anonymous id.
	///
	/// The device id survives unless `regenerate_device_id` is set.
	pub fn reset(&self, regenerate_device_id: bool) {
		let persistence = &self.inner.persistence;
		let device_id = persistence
			.get(DEVICE_ID_KEY)
			.and_then(|v| v.as_str().map(str::to_string));
		persistence.clear();
		self.inner.identify_called.store(false, Ordering::SeqCst);

		let id = generate_distinct_id();
		let device_id = match device_id {
			Some(existing) if !regenerate_device_id && !existing.is_empty() => existing,
			_ => id.clone(),
		};
		let mut seed = single(DISTINCT_ID_KEY, Value::String(id));
		seed.insert(DEVICE_ID_KEY.to_string(), Value::String(device_id));
		persistence.register_once(seed, Some(&Value::String(String::new())));
		debug!(name = %self.inner.name, "Identity reset");
	}

	/// Snapshot of the current identity.
	pub fn identity_state(&self) -> IdentityState {
		let persistence = &self.inner.persistence;
		let props: Map<String, Value> = [
			DISTINCT_ID_KEY,
			DEVICE_ID_KEY,
			USER_ID_KEY,
			ALIAS_ID_KEY,
			HAD_PERSISTED_DISTINCT_ID_KEY,
		]
		.into_iter()
		.filter_map(|key| persistence.get(key).map(|v| (key.to_string(), v)))
		.collect();
		IdentityState::from_properties(&props, self.is_identified())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::CaptureConfig;
	use crate::context::StaticContext;
	use crate::persistence::{MemoryPersistence, PersistenceStore};
	use crate::testing::{settle, RecordingDispatcher};
	use loom_capture_core::DeliveryStatus;
	use serde_json::json;
	use std::sync::Arc;

	fn client() -> (CaptureClient, Arc<RecordingDispatcher>) {
		let dispatcher = Arc::new(RecordingDispatcher::new());
		let client = CaptureClient::builder()
			.token("tok")
			.api_host("https://t.test")
			.config(CaptureConfig {
				capture_pageview: false,
				request_batching: false,
				..Default::default()
			})
			.context(Arc::new(StaticContext::new()))
			.dispatcher(dispatcher.clone())
			.build()
			.unwrap();
		(client, dispatcher)
	}

	fn events(dispatcher: &RecordingDispatcher, name: &str) -> Vec<Value> {
		dispatcher
			.request_payloads("/e/")
			.into_iter()
			.filter(|p| p["event"] == name)
			.collect()
	}

	#[tokio::test]
	async fn identify_switches_distinct_id_and_emits_once() {
		let (client, dispatcher) = client();
		let anon = client.get_distinct_id();

		let payload = client.identify("abc").unwrap();
		assert_eq!(payload["properties"]["distinct_id"], "abc");
		assert_eq!(payload["properties"]["$anon_distinct_id"], json!(anon));
		assert!(client.identify("abc").is_none());
		settle().await;

		assert_eq!(client.get_distinct_id(), "abc");
		assert_eq!(events(&dispatcher, IDENTIFY_EVENT).len(), 1);
		assert!(client.is_identified());
		assert_eq!(client.get_property(USER_ID_KEY), Some(json!("abc")));
	}

	#[tokio::test]
	async fn identify_ignores_empty_id() {
		let (client, dispatcher) = client();
		let before = client.get_distinct_id();
		assert!(client.identify("").is_none());
		assert_eq!(client.get_distinct_id(), before);
		assert!(!client.is_identified());
		settle().await;
		assert_eq!(dispatcher.dispatch_count(), 0);
	}

	#[tokio::test]
	async fn identify_seeds_missing_device_id() {
		let persistence = Arc::new(MemoryPersistence::with_properties(
			json!({"distinct_id": "legacy"}).as_object().cloned().unwrap(),
		));
		let client = CaptureClient::builder()
			.token("tok")
			.config(CaptureConfig {
				capture_pageview: false,
				..Default::default()
			})
			.persistence(persistence.clone())
			.dispatcher(Arc::new(RecordingDispatcher::new()))
			.build()
			.unwrap();
		persistence.unregister(DEVICE_ID_KEY);

		client.identify("user-1");
		let state = client.identity_state();
		assert_eq!(state.device_id.as_deref(), Some("legacy"));
		assert!(state.had_persisted_distinct_id);
		assert_eq!(state.distinct_id, "user-1");
	}

	#[tokio::test]
	async fn alias_onto_bound_profile_conflicts() {
		let (client, dispatcher) = client();
		client.identify("x");
		settle().await;
		let sent = dispatcher.dispatch_count();

		let outcome = client.alias("x", None);
		assert!(matches!(outcome, AliasOutcome::Conflict));
		assert_eq!(outcome.code(), Some(ALIAS_CONFLICT));
		settle().await;
		assert_eq!(dispatcher.dispatch_count(), sent);
	}

	#[tokio::test]
	async fn alias_equal_to_original_identifies_directly() {
		let (client, dispatcher) = client();
		let current = client.get_distinct_id();
		let outcome = client.alias(&current, None);
		assert_eq!(outcome.code(), Some(ALIAS_SAME_AS_ORIGINAL));
		assert!(client.is_identified());
		settle().await;
		assert!(events(&dispatcher, CREATE_ALIAS_EVENT).is_empty());
	}

	#[tokio::test]
	async fn alias_sends_event_then_identifies() {
		let (client, dispatcher) = client();
		let original = client.get_distinct_id();

		let AliasOutcome::Created(captured) = client.alias("user@example.com", None) else {
			panic!("expected alias to be created");
		};
		let payload = captured.payload.unwrap();
		assert_eq!(payload["properties"]["alias"], "user@example.com");
		assert_eq!(payload["properties"]["distinct_id"], json!(original));

		assert_eq!(captured.receipt.wait().await, Some(DeliveryStatus::Code(1)));
		assert!(client.is_identified());
		// The pending alias keeps the original distinct id.
		assert_eq!(client.get_distinct_id(), original);
		assert_eq!(client.get_property(USER_ID_KEY), Some(json!("user@example.com")));
		assert_eq!(events(&dispatcher, CREATE_ALIAS_EVENT).len(), 1);
	}

	#[tokio::test]
	async fn reset_keeps_device_id_unless_asked() {
		let (client, _) = client();
		client.identify("abc");
		client.register(json!({"plan": "team"}));
		let device_id = client.identity_state().device_id;

		client.reset(false);
		let state = client.identity_state();
		assert!(!state.identify_called);
		assert_ne!(state.distinct_id, "abc");
		assert!(!state.distinct_id.is_empty());
		assert_eq!(state.device_id, device_id);
		assert!(client.get_property("plan").is_none());

		client.reset(true);
		let regenerated = client.identity_state();
		assert_eq!(regenerated.device_id.as_deref(), Some(regenerated.distinct_id.as_str()));
		assert_ne!(regenerated.device_id, device_id);
	}
}
