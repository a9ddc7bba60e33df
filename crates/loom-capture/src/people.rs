// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! People profile operations.
//!
//! Before identify runs, operations are kept in the persistence store and
//! the receipt reports the queued sentinel. identify replays them; a replayed
//! operation whose delivery fails goes back on its queue.

use chrono::{SecondsFormat, Utc};
use loom_capture_core::{
	encode_payload, truncate, DeliveryStatus, EngageOperation, EngagePayload, PeopleAction,
	PeopleOperation, DEVICE_ID_KEY, HAD_PERSISTED_DISTINCT_ID_KEY, MAX_STRING_LENGTH,
	TRANSACTIONS_PROPERTY, USER_ID_KEY,
};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::client::CaptureClient;
use crate::properties::{layered, Properties};
use crate::transport::{DeliveryReceipt, TransportOptions};

/// Profile operations for the current user.
pub struct People<'a> {
	client: &'a CaptureClient,
}

/// Delivery tasks started by a flush of the queued operations.
#[derive(Debug, Default)]
pub struct PeopleFlush {
	tasks: Vec<JoinHandle<()>>,
}

impl PeopleFlush {
	/// Number of operations sent.
	pub fn len(&self) -> usize {
		self.tasks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tasks.is_empty()
	}

	/// Waits until every sent operation was delivered or requeued.
	pub async fn finished(self) {
		for task in self.tasks {
			if let Err(e) = task.await {
				error!(error = %e, "People flush task failed");
			}
		}
	}
}

impl CaptureClient {
	pub fn people(&self) -> People<'_> {
		People { client: self }
	}
}

impl People<'_> {
	/// Sets profile properties, overwriting existing values.
	pub fn set(&self, properties: impl Into<Properties>) -> DeliveryReceipt {
		let inner = &self.client.inner;
		let people_context = inner.context.people_properties();
		let referrer = inner.persistence.referrer_info();
		let caller = properties.into().into_map();
		let merged = layered([&people_context, &referrer, &caller]);
		self.send(PeopleOperation::set(merged))
	}

	/// Sets one profile property.
	pub fn set_property(&self, name: &str, value: impl Into<Value>) -> DeliveryReceipt {
		self.set(Properties::new().insert(name, value))
	}

	/// Sets profile properties only where no value exists yet.
	pub fn set_once(&self, properties: impl Into<Properties>) -> DeliveryReceipt {
		self.send(PeopleOperation::set_once(properties.into().into_map()))
	}

	pub fn unset<I, S>(&self, names: I) -> DeliveryReceipt
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.send(PeopleOperation::unset(names))
	}

	/// Adds to numeric profile properties. Non-numeric values are rejected
	/// per key.
	pub fn increment(&self, properties: impl Into<Properties>) -> DeliveryReceipt {
		let (op, rejected) = PeopleOperation::add(properties.into().into_map());
		for key in &rejected {
			error!(
				property = %key,
				"Invalid increment value passed to people.increment - must be a number"
			);
		}
		if op.is_empty() {
			return DeliveryReceipt::none();
		}
		self.send(op)
	}

	/// Increments one property by 1.
	pub fn increment_one(&self, name: &str) -> DeliveryReceipt {
		self.increment(Properties::new().insert(name, 1))
	}

	pub fn append(&self, properties: impl Into<Properties>) -> DeliveryReceipt {
		self.send(PeopleOperation::append(properties.into().into_map()))
	}

	pub fn remove(&self, properties: impl Into<Properties>) -> DeliveryReceipt {
		self.send(PeopleOperation::remove(properties.into().into_map()))
	}

	/// Merges values into list properties without duplicates.
	pub fn union(&self, properties: impl Into<Properties>) -> DeliveryReceipt {
		self.send(PeopleOperation::union(properties.into().into_map()))
	}

	/// Records a charge on the transactions list.
	///
	/// `amount` must be a number or a numeric string.
	pub fn capture_charge(&self, amount: impl Into<Value>, properties: impl Into<Properties>) -> DeliveryReceipt {
		let amount = match amount.into() {
			Value::Number(n) => Value::Number(n),
			Value::String(s) => match s.trim().parse::<f64>() {
				Ok(parsed) if parsed.is_finite() => Value::from(parsed),
				_ => {
					error!(amount = %s, "Invalid value passed to people.capture_charge - must be a number");
					return DeliveryReceipt::none();
				}
			},
			other => {
				error!(amount = %other, "Invalid value passed to people.capture_charge - must be a number");
				return DeliveryReceipt::none();
			}
		};
		let mut charge = Map::new();
		charge.insert("$amount".to_string(), amount);
		charge.insert(
			"$time".to_string(),
			Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
		);
		charge.extend(properties.into().into_map());
		self.append(Properties::new().insert(TRANSACTIONS_PROPERTY, charge))
	}

	/// Clears the transactions list.
	pub fn clear_charges(&self) -> DeliveryReceipt {
		self.set(Properties::new().insert(TRANSACTIONS_PROPERTY, Value::Array(Vec::new())))
	}

	/// Permanently deletes the current profile. Requires identify.
	pub fn delete_user(&self) -> DeliveryReceipt {
		if !self.client.is_identified() {
			error!("people.delete_user() requires you to call identify() first");
			return DeliveryReceipt::none();
		}
		let distinct_id = self.client.get_distinct_id();
		self.dispatch(EngageOperation::Delete(distinct_id))
	}

	/// Replays queued operations in flush order.
	///
	/// Map-shaped queues go out as one request each. Append and remove go
	/// out one item at a time, newest first. Failed deliveries are requeued.
	/// Nothing is sent before identify; the queues are left as they are.
	pub fn flush(&self) -> PeopleFlush {
		let persistence = &self.client.inner.persistence;
		let mut flush = PeopleFlush::default();
		if !self.client.is_identified() {
			debug!("Identify has not been called, leaving people queues in place");
			return flush;
		}
		for action in PeopleAction::FLUSH_ORDER {
			if action.is_itemized() {
				while let Some(op) = persistence.pop_people(action) {
					flush.tasks.push(self.replay(op));
				}
			} else if let Some(op) = persistence.take_people(action) {
				flush.tasks.push(self.replay(op));
			}
		}
		flush
	}

	fn replay(&self, op: PeopleOperation) -> JoinHandle<()> {
		let receipt = self.deliver(EngageOperation::People(op.clone()));
		let client = self.client.clone();
		self.client.inner.runtime.spawn(async move {
			let Some(status) = receipt.wait().await else {
				return;
			};
			if status.is_failure() {
				warn!(action = %op.action(), "People operation failed, requeueing");
				client.inner.persistence.requeue_people(op);
			}
		})
	}

	fn send(&self, op: PeopleOperation) -> DeliveryReceipt {
		self.dispatch(EngageOperation::People(op))
	}

	/// Sends an operation, or queues it until identify.
	fn dispatch(&self, operation: EngageOperation) -> DeliveryReceipt {
		let inner = &self.client.inner;
		if self.client.is_identified() || inner.consent.has_opted_out() {
			return self.deliver(operation);
		}
		if let EngageOperation::People(op) = operation {
			debug!(action = %op.action(), "Queueing people operation until identify");
			inner.persistence.enqueue_people(op);
		}
		DeliveryReceipt::resolved(DeliveryStatus::queued(inner.config.verbose))
	}

	/// Sends an operation without consulting the identify queue.
	fn deliver(&self, operation: EngageOperation) -> DeliveryReceipt {
		if self.client.inner.consent.has_opted_out() {
			debug!("Capturing opted out, skipping people operation");
			return DeliveryReceipt::resolved(DeliveryStatus::skipped());
		}
		self.send_value(self.engage_value(&operation))
	}

	/// The truncated `/engage/` payload for `operation`.
	fn engage_value(&self, operation: &EngageOperation) -> Value {
		let inner = &self.client.inner;
		let persistence = &inner.persistence;
		let string_prop = |key: &str| {
			persistence
				.get(key)
				.and_then(|v| v.as_str().map(str::to_string))
				.filter(|s| !s.is_empty())
		};
		let payload = EngagePayload {
			operation: operation.clone(),
			token: inner.token.clone(),
			distinct_id: self.client.get_distinct_id(),
			device_id: string_prop(DEVICE_ID_KEY),
			user_id: string_prop(USER_ID_KEY),
			had_persisted_distinct_id: persistence
				.get(HAD_PERSISTED_DISTINCT_ID_KEY)
				.and_then(|v| v.as_bool())
				.unwrap_or(false),
		};
		truncate(&payload.to_value(), MAX_STRING_LENGTH)
	}

	fn send_value(&self, value: Value) -> DeliveryReceipt {
		let inner = &self.client.inner;
		let encoded = match encode_payload(&value) {
			Ok(encoded) => encoded,
			Err(e) => {
				error!(error = %e, "Failed to encode people operation");
				return DeliveryReceipt::none();
			}
		};
		let (tx, receipt) = DeliveryReceipt::channel();
		inner.transport.send(
			&inner.config.engage_url(),
			encoded,
			&TransportOptions::default(),
			Some(tx),
		);
		receipt
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::CaptureConfig;
	use crate::context::StaticContext;
	use crate::testing::{settle, RecordingDispatcher};
	use loom_capture_core::{STATUS_QUEUED, VerboseResponse};
	use serde_json::json;
	use std::sync::Arc;

	fn client_with(config: CaptureConfig) -> (CaptureClient, Arc<RecordingDispatcher>) {
		let dispatcher = Arc::new(RecordingDispatcher::new());
		let client = CaptureClient::builder()
			.token("tok")
			.api_host("https://t.test")
			.config(CaptureConfig {
				capture_pageview: false,
				..config
			})
			.context(Arc::new(StaticContext::new()))
			.dispatcher(dispatcher.clone())
			.build()
			.unwrap();
		(client, dispatcher)
	}

	fn client() -> (CaptureClient, Arc<RecordingDispatcher>) {
		client_with(CaptureConfig::default())
	}

	fn engage(dispatcher: &RecordingDispatcher) -> Vec<Value> {
		dispatcher.request_payloads("/engage/")
	}

	#[tokio::test]
	async fn operations_queue_until_identify() {
		let (client, dispatcher) = client();
		let receipt = client.people().set(json!({"email": "a@example.com"}));
		assert_eq!(receipt.wait().await, Some(DeliveryStatus::Code(STATUS_QUEUED)));
		settle().await;
		assert!(engage(&dispatcher).is_empty());

		client.identify("user-1");
		settle().await;
		let sent = engage(&dispatcher);
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0]["$set"]["email"], "a@example.com");
		assert_eq!(sent[0]["$token"], "tok");
		assert_eq!(sent[0]["$distinct_id"], "user-1");
	}

	#[tokio::test]
	async fn verbose_queued_status_is_structured() {
		let (client, _) = client_with(CaptureConfig {
			verbose: true,
			..Default::default()
		});
		let receipt = client.people().set_once(json!({"first_seen": "today"}));
		assert_eq!(
			receipt.wait().await,
			Some(DeliveryStatus::Verbose(VerboseResponse {
				status: STATUS_QUEUED,
				error: None,
			}))
		);
	}

	#[tokio::test]
	async fn flush_follows_action_order_and_pops_items_newest_first() {
		let (client, dispatcher) = client();
		let people = client.people();
		people.append(json!({"tags": "first"}));
		people.append(json!({"tags": "second"}));
		people.union(json!({"teams": "core"}));
		people.increment(json!({"logins": 1}));
		people.unset(["old"]);
		people.set_once(json!({"signup": "today"}));
		people.set(json!({"name": "Ada"}));

		client.identify("user-1");
		settle().await;

		let keys: Vec<String> = engage(&dispatcher)
			.iter()
			.map(|p| {
				["$set", "$set_once", "$unset", "$add", "$union", "$append", "$remove"]
					.into_iter()
					.find(|k| p.get(*k).is_some())
					.unwrap_or_default()
					.to_string()
			})
			.collect();
		assert_eq!(
			keys,
			vec!["$set", "$set_once", "$unset", "$add", "$union", "$append", "$append"]
		);
		let appends: Vec<Value> = engage(&dispatcher)
			.into_iter()
			.filter_map(|p| p.get("$append").cloned())
			.collect();
		assert_eq!(appends[0]["tags"], "second");
		assert_eq!(appends[1]["tags"], "first");
	}

	#[tokio::test]
	async fn failed_set_is_retried_on_next_identify() {
		let (client, dispatcher) = client();
		client.people().set(json!({"plan": "team"}));

		dispatcher.respond_with("/engage/", 500, "error");
		client.identify("user-1");
		settle().await;
		assert_eq!(engage(&dispatcher).len(), 1);
		assert!(client.inner.persistence.people_queue_len(PeopleAction::Set) > 0);

		dispatcher.reset_responses();
		client.identify("user-1");
		settle().await;
		let sent = engage(&dispatcher);
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[1]["$set"]["plan"], "team");
		assert_eq!(client.inner.persistence.people_queue_len(PeopleAction::Set), 0);
	}

	#[tokio::test]
	async fn explicit_flush_waits_for_delivery() {
		let (client, dispatcher) = client();
		client.people().union(json!({"teams": ["core"]}));
		dispatcher.respond_with("/engage/", 500, "error");
		client.identify("user-1");
		settle().await;
		assert_eq!(client.inner.persistence.people_queue_len(PeopleAction::Union), 1);

		dispatcher.reset_responses();
		let flush = client.people().flush();
		assert_eq!(flush.len(), 1);
		flush.finished().await;
		assert_eq!(client.inner.persistence.people_queue_len(PeopleAction::Union), 0);
		assert!(client.people().flush().is_empty());
	}

	#[tokio::test]
	async fn flush_before_identify_leaves_queues_in_place() {
		let (client, dispatcher) = client();
		client.people().append(json!({"tags": "a"}));
		client.people().set(json!({"plan": "team"}));

		let flush = client.people().flush();
		assert!(flush.is_empty());
		flush.finished().await;
		settle().await;

		assert!(engage(&dispatcher).is_empty());
		assert_eq!(client.inner.persistence.people_queue_len(PeopleAction::Append), 1);
		assert!(client.inner.persistence.people_queue_len(PeopleAction::Set) > 0);

		client.identify("user-1");
		settle().await;
		assert_eq!(engage(&dispatcher).len(), 2);
		assert_eq!(client.inner.persistence.people_queue_len(PeopleAction::Append), 0);
	}

	#[tokio::test]
	async fn failed_append_items_are_requeued() {
		let (client, dispatcher) = client();
		client.people().append(json!({"tags": "a"}));
		client.people().append(json!({"tags": "b"}));
		dispatcher.respond_with("/engage/", 502, "bad gateway");
		client.identify("user-1");
		settle().await;
		assert_eq!(client.inner.persistence.people_queue_len(PeopleAction::Append), 2);
	}

	#[tokio::test]
	async fn identified_operations_are_sent_directly() {
		let (client, dispatcher) = client();
		client.identify("user-1");
		let receipt = client.people().set_property("plan", "team");
		assert_eq!(receipt.wait().await, Some(DeliveryStatus::Code(1)));
		assert_eq!(engage(&dispatcher)[0]["$user_id"], "user-1");
	}

	#[tokio::test]
	async fn reserved_properties_are_stripped() {
		let (client, dispatcher) = client();
		client.identify("user-1");
		client
			.people()
			.set(json!({"$distinct_id": "spoof", "$token": "spoof", "name": "Ada"}))
			.wait()
			.await;
		let sent = &engage(&dispatcher)[0];
		assert_eq!(sent["$set"].get("$distinct_id"), None);
		assert_eq!(sent["$set"].get("$token"), None);
		assert_eq!(sent["$distinct_id"], "user-1");
		assert_eq!(sent["$token"], "tok");
	}

	#[tokio::test]
	async fn increment_rejects_non_numeric_values() {
		let (client, dispatcher) = client();
		client.identify("user-1");
		client.people().increment(json!({"logins": "2", "bad": "many"})).wait().await;
		let sent = &engage(&dispatcher)[0];
		assert!(sent["$add"].get("bad").is_none());
		assert_eq!(sent["$add"]["logins"].as_f64(), Some(2.0));

		let receipt = client.people().increment(json!({"bad": true}));
		assert_eq!(receipt.wait().await, None);
		assert_eq!(engage(&dispatcher).len(), 1);
	}

	#[tokio::test]
	async fn capture_charge_appends_transaction() {
		let (client, dispatcher) = client();
		client.identify("user-1");
		client
			.people()
			.capture_charge("30.5", json!({"sku": "pro"}))
			.wait()
			.await;
		let sent = &engage(&dispatcher)[0];
		let charge = &sent["$append"][TRANSACTIONS_PROPERTY];
		assert_eq!(charge["$amount"], json!(30.5));
		assert_eq!(charge["sku"], "pro");
		assert!(charge["$time"].as_str().unwrap().ends_with('Z'));
	}

	#[tokio::test]
	async fn capture_charge_rejects_non_numeric_amount() {
		let (client, dispatcher) = client();
		client.identify("user-1");
		let receipt = client.people().capture_charge("lots", json!({}));
		assert_eq!(receipt.wait().await, None);
		settle().await;
		assert!(engage(&dispatcher).is_empty());
	}

	#[tokio::test]
	async fn clear_charges_sets_empty_list() {
		let (client, dispatcher) = client();
		client.identify("user-1");
		client.people().clear_charges().wait().await;
		assert_eq!(engage(&dispatcher)[0]["$set"][TRANSACTIONS_PROPERTY], json!([]));
	}

	#[tokio::test]
	async fn delete_user_requires_identify() {
		let (client, dispatcher) = client();
		assert_eq!(client.people().delete_user().wait().await, None);
		settle().await;
		assert!(engage(&dispatcher).is_empty());

		client.identify("user-1");
		client.people().delete_user().wait().await;
		assert_eq!(engage(&dispatcher)[0]["$delete"], "user-1");
	}

	#[tokio::test]
	async fn long_values_are_truncated() {
		let (client, dispatcher) = client();
		client.identify("user-1");
		let long = "y".repeat(300);
		client.people().set(json!({"bio": long})).wait().await;
		let sent = &engage(&dispatcher)[0];
		assert_eq!(sent["$set"]["bio"].as_str().unwrap().chars().count(), 255);
	}
}
