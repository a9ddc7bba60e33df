// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Profile mutation operations for the `/engage/` endpoint.
//!
//! A [`PeopleOperation`] is one tagged mutation. Before identity is resolved
//! operations wait in [`PeopleQueues`], one queue per action kind, and are
//! replayed when identify runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::CoreError;
use crate::identity::{DEVICE_ID_KEY, DISTINCT_ID_KEY, HAD_PERSISTED_DISTINCT_ID_KEY, USER_ID_KEY};

/// Profile property names the SDK owns; callers cannot mutate them.
pub const RESERVED_PEOPLE_PROPERTIES: &[&str] = &[
	"$distinct_id",
	"$token",
	DEVICE_ID_KEY,
	USER_ID_KEY,
	HAD_PERSISTED_DISTINCT_ID_KEY,
];

/// List property that holds recorded charges.
pub const TRANSACTIONS_PROPERTY: &str = "$transactions";

/// The kind of a people operation, matching its wire key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeopleAction {
	#[serde(rename = "$set")]
	Set,
	#[serde(rename = "$set_once")]
	SetOnce,
	#[serde(rename = "$unset")]
	Unset,
	#[serde(rename = "$add")]
	Add,
	#[serde(rename = "$append")]
	Append,
	#[serde(rename = "$remove")]
	Remove,
	#[serde(rename = "$union")]
	Union,
}

impl PeopleAction {
	/// Order in which queued operations are replayed after identify.
	pub const FLUSH_ORDER: [PeopleAction; 7] = [
		PeopleAction::Set,
		PeopleAction::SetOnce,
		PeopleAction::Unset,
		PeopleAction::Add,
		PeopleAction::Union,
		PeopleAction::Append,
		PeopleAction::Remove,
	];

	/// The `$`-prefixed key used on the wire.
	pub fn key(&self) -> &'static str {
		match self {
			PeopleAction::Set => "$set",
			PeopleAction::SetOnce => "$set_once",
			PeopleAction::Unset => "$unset",
			PeopleAction::Add => "$add",
			PeopleAction::Append => "$append",
			PeopleAction::Remove => "$remove",
			PeopleAction::Union => "$union",
		}
	}

	/// Append and remove are queued as individual items rather than merged,
	/// since the server has no list-concatenation operation.
	pub fn is_itemized(&self) -> bool {
		matches!(self, PeopleAction::Append | PeopleAction::Remove)
	}
}

impl std::fmt::Display for PeopleAction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.key())
	}
}

impl std::str::FromStr for PeopleAction {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		PeopleAction::FLUSH_ORDER
			.into_iter()
			.find(|action| action.key() == s)
			.ok_or_else(|| CoreError::UnknownAction(s.to_string()))
	}
}

/// A single profile mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum PeopleOperation {
	Set(Map<String, Value>),
	SetOnce(Map<String, Value>),
	Unset(Vec<String>),
	Add(Map<String, Value>),
	Append(Map<String, Value>),
	Remove(Map<String, Value>),
	Union(Map<String, Value>),
}

impl PeopleOperation {
	pub fn set(props: Map<String, Value>) -> Self {
		PeopleOperation::Set(without_reserved(props))
	}

	pub fn set_once(props: Map<String, Value>) -> Self {
		PeopleOperation::SetOnce(without_reserved(props))
	}

	pub fn unset<I, S>(names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut out: Vec<String> = Vec::new();
		for name in names.into_iter().map(Into::into) {
			if !is_reserved(&name) && !out.contains(&name) {
				out.push(name);
			}
		}
		PeopleOperation::Unset(out)
	}

	/// Builds an increment. Non-numeric values are dropped and their keys
	/// returned alongside the operation so the caller can report them.
	pub fn add(props: Map<String, Value>) -> (Self, Vec<String>) {
		let mut accepted = Map::new();
		let mut rejected = Vec::new();
		for (k, v) in without_reserved(props) {
			match numeric_value(&v) {
				Some(n) => {
					accepted.insert(k, n);
				}
				None => rejected.push(k),
			}
		}
		(PeopleOperation::Add(accepted), rejected)
	}

	pub fn append(props: Map<String, Value>) -> Self {
		PeopleOperation::Append(without_reserved(props))
	}

	pub fn remove(props: Map<String, Value>) -> Self {
		PeopleOperation::Remove(without_reserved(props))
	}

	/// Builds a union. Scalar values become one-element lists.
	pub fn union(props: Map<String, Value>) -> Self {
		let props = without_reserved(props)
			.into_iter()
			.map(|(k, v)| match v {
				Value::Array(_) => (k, v),
				other => (k, Value::Array(vec![other])),
			})
			.collect();
		PeopleOperation::Union(props)
	}

	pub fn action(&self) -> PeopleAction {
		match self {
			PeopleOperation::Set(_) => PeopleAction::Set,
			PeopleOperation::SetOnce(_) => PeopleAction::SetOnce,
			PeopleOperation::Unset(_) => PeopleAction::Unset,
			PeopleOperation::Add(_) => PeopleAction::Add,
			PeopleOperation::Append(_) => PeopleAction::Append,
			PeopleOperation::Remove(_) => PeopleAction::Remove,
			PeopleOperation::Union(_) => PeopleAction::Union,
		}
	}

	/// The value placed under the action key.
	pub fn payload(&self) -> Value {
		match self {
			PeopleOperation::Unset(names) => {
				Value::Array(names.iter().cloned().map(Value::String).collect())
			}
			PeopleOperation::Set(m)
			| PeopleOperation::SetOnce(m)
			| PeopleOperation::Add(m)
			| PeopleOperation::Append(m)
			| PeopleOperation::Remove(m)
			| PeopleOperation::Union(m) => Value::Object(m.clone()),
		}
	}

	pub fn is_empty(&self) -> bool {
		match self {
			PeopleOperation::Unset(names) => names.is_empty(),
			PeopleOperation::Set(m)
			| PeopleOperation::SetOnce(m)
			| PeopleOperation::Add(m)
			| PeopleOperation::Append(m)
			| PeopleOperation::Remove(m)
			| PeopleOperation::Union(m) => m.is_empty(),
		}
	}
}

/// What an `/engage/` request does.
#[derive(Debug, Clone, PartialEq)]
pub enum EngageOperation {
	People(PeopleOperation),
	/// Permanently deletes the profile with this distinct id.
	Delete(String),
}

/// A complete `/engage/` payload: the operation plus identity fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EngagePayload {
	pub operation: EngageOperation,
	pub token: String,
	pub distinct_id: String,
	pub device_id: Option<String>,
	pub user_id: Option<String>,
	pub had_persisted_distinct_id: bool,
}

impl EngagePayload {
	pub fn to_value(&self) -> Value {
		let mut obj = Map::new();
		match &self.operation {
			EngageOperation::People(op) => {
				obj.insert(op.action().key().to_string(), op.payload());
			}
			EngageOperation::Delete(id) => {
				obj.insert("$delete".to_string(), Value::String(id.clone()));
			}
		}
		obj.insert("$token".to_string(), Value::String(self.token.clone()));
		obj.insert("$distinct_id".to_string(), Value::String(self.distinct_id.clone()));
		if let Some(device_id) = &self.device_id {
			obj.insert(DEVICE_ID_KEY.to_string(), Value::String(device_id.clone()));
		}
		if let Some(user_id) = &self.user_id {
			obj.insert(USER_ID_KEY.to_string(), Value::String(user_id.clone()));
		}
		if self.had_persisted_distinct_id {
			obj.insert(HAD_PERSISTED_DISTINCT_ID_KEY.to_string(), Value::Bool(true));
		}
		Value::Object(obj)
	}
}

/// Per-action queues of operations waiting for identity resolution.
///
/// Map-shaped actions are merged as they arrive so one request per action is
/// replayed; append and remove keep one entry per call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeopleQueues {
	#[serde(default)]
	set: Map<String, Value>,
	#[serde(default)]
	set_once: Map<String, Value>,
	#[serde(default)]
	unset: Vec<String>,
	#[serde(default)]
	add: Map<String, Value>,
	#[serde(default)]
	union: Map<String, Value>,
	#[serde(default)]
	append: Vec<Map<String, Value>>,
	#[serde(default)]
	remove: Vec<Map<String, Value>>,
}

impl PeopleQueues {
	pub fn new() -> Self {
		Self::default()
	}

	/// Queues a new operation. Later values win on key collision.
	pub fn push(&mut self, op: PeopleOperation) {
		match op {
			PeopleOperation::Set(props) => {
				self.drop_keys_from_unset(props.keys());
				for key in props.keys() {
					self.add.remove(key);
					self.union.remove(key);
				}
				self.set.extend(props);
			}
			PeopleOperation::SetOnce(props) => {
				self.drop_keys_from_unset(props.keys());
				for (k, v) in props {
					self.set_once.entry(k).or_insert(v);
				}
			}
			PeopleOperation::Unset(names) => {
				for name in names {
					self.set.remove(&name);
					self.set_once.remove(&name);
					self.add.remove(&name);
					self.union.remove(&name);
					for item in &mut self.append {
						item.remove(&name);
					}
					self.append.retain(|item| !item.is_empty());
					if !self.unset.contains(&name) {
						self.unset.push(name);
					}
				}
			}
			PeopleOperation::Add(props) => {
				self.drop_keys_from_unset(props.keys());
				for (k, v) in props {
					if let Some(existing) = self.set.get_mut(&k) {
						*existing = sum(existing, &v);
					} else {
						let entry = self.add.entry(k).or_insert_with(|| Value::from(0));
						*entry = sum(entry, &v);
					}
				}
			}
			PeopleOperation::Union(props) => {
				self.drop_keys_from_unset(props.keys());
				for (k, v) in props {
					if let Value::Array(items) = v {
						let entry = self.union.entry(k).or_insert_with(|| Value::Array(Vec::new()));
						if let Value::Array(existing) = entry {
							existing.extend(items);
						}
					}
				}
			}
			PeopleOperation::Append(props) => {
				self.drop_keys_from_unset(props.keys());
				self.append.push(props);
			}
			PeopleOperation::Remove(props) => {
				self.remove.push(props);
			}
		}
	}

	/// Puts back an operation whose delivery failed.
	///
	/// Unlike [`push`](Self::push), values queued since the failed attempt
	/// are kept over the retried ones.
	pub fn requeue(&mut self, op: PeopleOperation) {
		match op {
			PeopleOperation::Set(props) => {
				for (k, v) in props {
					self.set.entry(k).or_insert(v);
				}
			}
			PeopleOperation::Append(props) => self.append.push(props),
			PeopleOperation::Remove(props) => self.remove.push(props),
			other => self.push(other),
		}
	}

	/// Removes and returns the whole merged queue for a map-shaped action.
	///
	/// Returns `None` for an empty queue and for itemized actions.
	pub fn take(&mut self, action: PeopleAction) -> Option<PeopleOperation> {
		let op = match action {
			PeopleAction::Set => PeopleOperation::Set(std::mem::take(&mut self.set)),
			PeopleAction::SetOnce => PeopleOperation::SetOnce(std::mem::take(&mut self.set_once)),
			PeopleAction::Unset => PeopleOperation::Unset(std::mem::take(&mut self.unset)),
			PeopleAction::Add => PeopleOperation::Add(std::mem::take(&mut self.add)),
			PeopleAction::Union => PeopleOperation::Union(std::mem::take(&mut self.union)),
			PeopleAction::Append | PeopleAction::Remove => return None,
		};
		(!op.is_empty()).then_some(op)
	}

	/// Pops the most recently queued item of an itemized action.
	pub fn pop(&mut self, action: PeopleAction) -> Option<PeopleOperation> {
		match action {
			PeopleAction::Append => self.append.pop().map(PeopleOperation::Append),
			PeopleAction::Remove => self.remove.pop().map(PeopleOperation::Remove),
			_ => None,
		}
	}

	/// Number of pending entries for an action (keys for merged queues,
	/// items for itemized ones).
	pub fn len(&self, action: PeopleAction) -> usize {
		match action {
			PeopleAction::Set => self.set.len(),
			PeopleAction::SetOnce => self.set_once.len(),
			PeopleAction::Unset => self.unset.len(),
			PeopleAction::Add => self.add.len(),
			PeopleAction::Union => self.union.len(),
			PeopleAction::Append => self.append.len(),
			PeopleAction::Remove => self.remove.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		PeopleAction::FLUSH_ORDER
			.iter()
			.all(|action| self.len(*action) == 0)
	}

	fn drop_keys_from_unset<'a>(&mut self, keys: impl Iterator<Item = &'a String>) {
		let keys: Vec<&String> = keys.collect();
		self.unset.retain(|name| !keys.contains(&name));
	}
}

fn is_reserved(name: &str) -> bool {
	RESERVED_PEOPLE_PROPERTIES.contains(&name) || name == DISTINCT_ID_KEY
}

fn without_reserved(props: Map<String, Value>) -> Map<String, Value> {
	props.into_iter().filter(|(k, _)| !is_reserved(k)).collect()
}

/// Accepts JSON numbers and numeric strings, returning a JSON number.
fn numeric_value(value: &Value) -> Option<Value> {
	match value {
		Value::Number(_) => Some(value.clone()),
		Value::String(s) => s
			.trim()
			.parse::<f64>()
			.ok()
			.filter(|f| f.is_finite())
			.and_then(Number::from_f64)
			.map(Value::Number),
		_ => None,
	}
}

fn sum(a: &Value, b: &Value) -> Value {
	match (a.as_i64(), b.as_i64()) {
		(Some(x), Some(y)) => Value::from(x.saturating_add(y)),
		_ => {
			let total = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
			Number::from_f64(total)
				.map(Value::Number)
				.unwrap_or_else(|| b.clone())
		}
	}
}
