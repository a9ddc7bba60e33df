// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The persistence collaborator.
//!
//! Identity fields, super properties, queued people operations and event
//! timers all live in a [`PersistenceStore`]. The client only needs the
//! operations on the trait; how the store keeps its data is up to the host.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use loom_capture_core::referrer::{campaign_params, referrer_info, search_info};
use loom_capture_core::{PeopleAction, PeopleOperation, PeopleQueues, ALIAS_ID_KEY, PEOPLE_DISTINCT_ID_KEY};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Keys kept in the store but never attached to events.
const INTERNAL_KEYS: &[&str] = &[ALIAS_ID_KEY, PEOPLE_DISTINCT_ID_KEY];

/// Durable key/value storage used by the capture client.
///
/// Every method must be safe to call at any time, including while the store
/// is disabled. Disabling removes the durable copy; the store keeps working
/// in memory but writes nothing durable until it is enabled again.
pub trait PersistenceStore: Send + Sync {
	fn get(&self, key: &str) -> Option<Value>;

	/// Sets every property in `props`.
	fn register(&self, props: Map<String, Value>);

	/// Sets properties that are absent, or whose current value equals
	/// `default_value`.
	fn register_once(&self, props: Map<String, Value>, default_value: Option<&Value>);

	fn unregister(&self, key: &str);

	/// Super properties attached to every event.
	fn properties(&self) -> Map<String, Value>;

	/// Removes all state, including queued people operations and timers.
	fn clear(&self);

	fn set_disabled(&self, disabled: bool);

	fn is_disabled(&self) -> bool;

	/// Records the search engine and keyword of a search referrer.
	fn update_search_keyword(&self, referrer: &str) {
		let info = search_info(referrer);
		if !info.is_empty() {
			self.register(info);
		}
	}

	/// Records `utm_*` parameters of the current page.
	fn update_campaign_params(&self, current_url: &str) {
		let params = campaign_params(current_url);
		if !params.is_empty() {
			self.register(params);
		}
	}

	/// Records the initial referrer once. An empty string counts as unset.
	fn update_referrer_info(&self, referrer: &str) {
		self.register_once(referrer_info(referrer), Some(&Value::String(String::new())));
	}

	/// The stored initial referrer properties, omitting empty values.
	fn referrer_info(&self) -> Map<String, Value> {
		["$initial_referrer", "$initial_referring_domain"]
			.into_iter()
			.filter_map(|key| match self.get(key) {
				Some(Value::Null) | None => None,
				Some(Value::String(s)) if s.is_empty() => None,
				Some(v) => Some((key.to_string(), v)),
			})
			.collect()
	}

	fn enqueue_people(&self, op: PeopleOperation);

	/// Puts back an operation whose delivery failed.
	fn requeue_people(&self, op: PeopleOperation);

	/// Takes the merged queue of a map-shaped action.
	fn take_people(&self, action: PeopleAction) -> Option<PeopleOperation>;

	/// Pops the newest item of an append or remove queue.
	fn pop_people(&self, action: PeopleAction) -> Option<PeopleOperation>;

	fn people_queue_len(&self, action: PeopleAction) -> usize;

	fn set_event_timer(&self, event: &str, started_at: DateTime<Utc>);

	fn remove_event_timer(&self, event: &str) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
	pub props: Map<String, Value>,
	pub people: PeopleQueues,
	pub timers: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
	current: PersistedState,
	saved: PersistedState,
	disabled: bool,
}

impl MemoryState {
	fn save(&mut self) {
		if !self.disabled {
			self.saved = self.current.clone();
		}
	}
}

/// An in-memory [`PersistenceStore`].
///
/// The "durable" copy is a snapshot taken after every mutation while the
/// store is enabled; [`saved_snapshot`](Self::saved_snapshot) exposes it.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
	state: Mutex<MemoryState>,
}

impl MemoryPersistence {
	pub fn new() -> Self {
		Self::default()
	}

	/// Starts from previously saved properties.
	pub fn with_properties(props: Map<String, Value>) -> Self {
		let current = PersistedState {
			props,
			..Default::default()
		};
		Self {
			state: Mutex::new(MemoryState {
				saved: current.clone(),
				current,
				disabled: false,
			}),
		}
	}

	/// The last state written while the store was enabled.
	pub fn saved_snapshot(&self) -> PersistedState {
		self.state.lock().saved.clone()
	}

	fn mutate<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> R {
		let mut state = self.state.lock();
		let result = f(&mut state.current);
		state.save();
		result
	}
}

impl PersistenceStore for MemoryPersistence {
	fn get(&self, key: &str) -> Option<Value> {
		self.state.lock().current.props.get(key).cloned()
	}

	fn register(&self, props: Map<String, Value>) {
		self.mutate(|s| s.props.extend(props));
	}

	fn register_once(&self, props: Map<String, Value>, default_value: Option<&Value>) {
		self.mutate(|s| {
			for (k, v) in props {
				let replace = match s.props.get(&k) {
					None => true,
					Some(existing) => Some(existing) == default_value,
				};
				if replace {
					s.props.insert(k, v);
				}
			}
		});
	}

	fn unregister(&self, key: &str) {
		self.mutate(|s| {
			s.props.remove(key);
		});
	}

	fn properties(&self) -> Map<String, Value> {
		self
			.state
			.lock()
			.current
			.props
			.iter()
			.filter(|(k, _)| !INTERNAL_KEYS.contains(&k.as_str()))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}

	fn clear(&self) {
		let mut state = self.state.lock();
		state.current = PersistedState::default();
		state.saved = PersistedState::default();
	}

	fn set_disabled(&self, disabled: bool) {
		let mut state = self.state.lock();
		state.disabled = disabled;
		if disabled {
			state.saved = PersistedState::default();
		} else {
			state.save();
		}
	}

	fn is_disabled(&self) -> bool {
		self.state.lock().disabled
	}

	fn enqueue_people(&self, op: PeopleOperation) {
		self.mutate(|s| s.people.push(op));
	}

	fn requeue_people(&self, op: PeopleOperation) {
		self.mutate(|s| s.people.requeue(op));
	}

	fn take_people(&self, action: PeopleAction) -> Option<PeopleOperation> {
		self.mutate(|s| s.people.take(action))
	}

	fn pop_people(&self, action: PeopleAction) -> Option<PeopleOperation> {
		self.mutate(|s| s.people.pop(action))
	}

	fn people_queue_len(&self, action: PeopleAction) -> usize {
		self.state.lock().current.people.len(action)
	}

	fn set_event_timer(&self, event: &str, started_at: DateTime<Utc>) {
		self.mutate(|s| {
			s.timers.insert(event.to_string(), started_at);
		});
	}

	fn remove_event_timer(&self, event: &str) -> Option<DateTime<Utc>> {
		self.mutate(|s| s.timers.remove(event))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn map(value: Value) -> Map<String, Value> {
		value.as_object().cloned().unwrap_or_default()
	}

	#[test]
	fn register_once_keeps_existing_value() {
		let store = MemoryPersistence::new();
		store.register(map(json!({"plan": "free"})));
		store.register_once(map(json!({"plan": "team", "seats": 3})), None);
		assert_eq!(store.get("plan"), Some(json!("free")));
		assert_eq!(store.get("seats"), Some(json!(3)));
	}

	#[test]
	fn register_once_replaces_default_value() {
		let store = MemoryPersistence::new();
		store.register(map(json!({"plan": ""})));
		store.register_once(map(json!({"plan": "team"})), Some(&json!("")));
		assert_eq!(store.get("plan"), Some(json!("team")));
	}

	#[test]
	fn properties_hide_internal_keys() {
		let store = MemoryPersistence::new();
		store.register(map(json!({
			"distinct_id": "abc",
			"__alias": "x",
			"$people_distinct_id": "abc",
			"plan": "team",
		})));
		let props = store.properties();
		assert_eq!(Value::Object(props), json!({"distinct_id": "abc", "plan": "team"}));
	}

	#[test]
	fn disabled_store_does_not_save() {
		let store = MemoryPersistence::new();
		store.register(map(json!({"a": 1})));
		store.set_disabled(true);
		assert!(store.saved_snapshot().props.is_empty());
		store.register(map(json!({"b": 2})));
		assert_eq!(store.get("a"), Some(json!(1)));
		assert_eq!(store.get("b"), Some(json!(2)));
		assert!(!store.saved_snapshot().props.contains_key("b"));

		store.set_disabled(false);
		assert!(store.saved_snapshot().props.contains_key("b"));
	}

	#[test]
	fn clear_removes_everything() {
		let store = MemoryPersistence::new();
		store.register(map(json!({"a": 1})));
		store.enqueue_people(PeopleOperation::set(map(json!({"name": "x"}))));
		store.set_event_timer("signup", Utc::now());
		store.clear();
		assert!(store.properties().is_empty());
		assert_eq!(store.people_queue_len(PeopleAction::Set), 0);
		assert!(store.remove_event_timer("signup").is_none());
	}

	#[test]
	fn referrer_info_is_recorded_once() {
		let store = MemoryPersistence::new();
		store.update_referrer_info("https://news.example.com/story");
		store.update_referrer_info("https://other.example.com/");
		let info = store.referrer_info();
		assert_eq!(info["$initial_referrer"], "https://news.example.com/story");
		assert_eq!(info["$initial_referring_domain"], "news.example.com");
	}

	#[test]
	fn search_keyword_and_campaign_params() {
		let store = MemoryPersistence::new();
		store.update_search_keyword("https://www.google.com/search?q=loom+agent");
		store.update_campaign_params("https://loom.dev/?utm_source=hn&utm_term=agents");
		assert_eq!(store.get("$search_engine"), Some(json!("google")));
		assert_eq!(store.get("ph_keyword"), Some(json!("loom agent")));
		assert_eq!(store.get("utm_source"), Some(json!("hn")));
		assert_eq!(store.get("utm_term"), Some(json!("agents")));
	}

	#[test]
	fn people_queue_round_trip() {
		let store = MemoryPersistence::new();
		store.enqueue_people(PeopleOperation::append(map(json!({"tags": "a"}))));
		store.enqueue_people(PeopleOperation::append(map(json!({"tags": "b"}))));
		assert_eq!(store.people_queue_len(PeopleAction::Append), 2);
		assert_eq!(
			store.pop_people(PeopleAction::Append),
			Some(PeopleOperation::Append(map(json!({"tags": "b"}))))
		);
		assert_eq!(store.people_queue_len(PeopleAction::Append), 1);
	}
}
