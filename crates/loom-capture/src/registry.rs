// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Named capture clients sharing one host.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::client::{CaptureClient, CaptureClientBuilder, PRIMARY_INSTANCE};
use crate::command::{self, Command, CommandBuffer};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};

/// Owns every named client of a host.
///
/// Commands pushed for a name that has no client yet are buffered and
/// replayed once, when that client is initialized. [`teardown`](Self::teardown)
/// unloads and forgets every client.
pub struct ClientRegistry {
	clients: RwLock<HashMap<String, CaptureClient>>,
	pending: Mutex<HashMap<String, CommandBuffer>>,
	buffer_capacity: usize,
}

impl Default for ClientRegistry {
	fn default() -> Self {
		Self::new(CaptureConfig::default().startup_buffer_capacity)
	}
}

impl ClientRegistry {
	/// Creates a registry whose startup buffers hold `buffer_capacity`
	/// commands per name.
	pub fn new(buffer_capacity: usize) -> Self {
		Self {
			clients: RwLock::new(HashMap::new()),
			pending: Mutex::new(HashMap::new()),
			buffer_capacity,
		}
	}

	/// Builds and registers a client, then replays its buffered commands.
	pub fn init(&self, builder: CaptureClientBuilder) -> Result<CaptureClient> {
		let name = builder.instance_name().to_string();
		if self.clients.read().contains_key(&name) {
			return Err(CaptureError::AlreadyInitialized(name));
		}
		let client = builder.build()?;

		// Pushes check for the client under the pending lock, so none can run
		// ahead of the buffered commands replayed here.
		let mut pending = self.pending.lock();
		{
			let mut clients = self.clients.write();
			if clients.contains_key(&name) {
				return Err(CaptureError::AlreadyInitialized(name));
			}
			clients.insert(name.clone(), client.clone());
		}
		if let Some(buffer) = pending.remove(&name) {
			info!(name = %name, count = buffer.len(), "Replaying buffered commands");
			command::execute(&client, buffer.into_commands());
		}
		drop(pending);
		Ok(client)
	}

	pub fn get(&self, name: &str) -> Option<CaptureClient> {
		self.clients.read().get(name).cloned()
	}

	/// The client registered under the primary name.
	pub fn primary(&self) -> Option<CaptureClient> {
		self.get(PRIMARY_INSTANCE)
	}

	/// Runs a command now, or buffers it until `name` is initialized.
	pub fn push(&self, name: &str, command: impl Into<Command>) {
		let command = command.into();
		let mut pending = self.pending.lock();
		if let Some(client) = self.get(name) {
			drop(pending);
			command::execute(&client, vec![command]);
			return;
		}
		debug!(name = %name, "Client not initialized, buffering command");
		pending
			.entry(name.to_string())
			.or_insert_with(|| CommandBuffer::new(self.buffer_capacity))
			.push(command);
	}

	/// Commands waiting for `name`.
	pub fn pending_len(&self, name: &str) -> usize {
		self.pending.lock().get(name).map_or(0, CommandBuffer::len)
	}

	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
		names.sort();
		names
	}

	/// Shuts down every client and drops all buffered commands.
	pub fn teardown(&self) {
		let clients: Vec<CaptureClient> = self.clients.write().drain().map(|(_, c)| c).collect();
		for client in &clients {
			client.shutdown();
		}
		self.pending.lock().clear();
		info!(count = clients.len(), "Capture registry torn down");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::command::Call;
	use crate::properties::Properties;
	use crate::testing::{settle, RecordingDispatcher};
	use serde_json::json;
	use std::sync::{Arc, Barrier};
	use std::thread;

	fn builder(dispatcher: &Arc<RecordingDispatcher>) -> CaptureClientBuilder {
		CaptureClient::builder()
			.token("tok")
			.api_host("https://t.test")
			.config(CaptureConfig {
				capture_pageview: false,
				request_batching: false,
				..Default::default()
			})
			.dispatcher(dispatcher.clone())
	}

	#[tokio::test]
	async fn buffered_commands_replay_once_on_init() {
		let registry = ClientRegistry::default();
		let dispatcher = Arc::new(RecordingDispatcher::new());
		registry.push(PRIMARY_INSTANCE, Call::capture("queued", json!({})));
		registry.push(PRIMARY_INSTANCE, Call::Register(Properties::new().insert("plan", "team")));
		assert_eq!(registry.pending_len(PRIMARY_INSTANCE), 2);

		let client = registry.init(builder(&dispatcher)).unwrap();
		settle().await;
		assert_eq!(registry.pending_len(PRIMARY_INSTANCE), 0);
		let events = dispatcher.request_payloads("/e/");
		assert_eq!(events.len(), 1);
		assert_eq!(events[0]["properties"]["plan"], "team");
		assert_eq!(registry.primary().map(|c| c.get_distinct_id()), Some(client.get_distinct_id()));
	}

	#[tokio::test]
	async fn push_after_init_runs_immediately() {
		let registry = ClientRegistry::default();
		let dispatcher = Arc::new(RecordingDispatcher::new());
		registry.init(builder(&dispatcher)).unwrap();
		registry.push(PRIMARY_INSTANCE, Call::capture("now", json!({})));
		settle().await;
		assert_eq!(dispatcher.request_payloads("/e/").len(), 1);
		assert_eq!(registry.pending_len(PRIMARY_INSTANCE), 0);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn concurrent_pushes_never_overtake_buffered_commands() {
		let registry = Arc::new(ClientRegistry::default());
		let dispatcher = Arc::new(RecordingDispatcher::new());
		for i in 0..20 {
			registry.push(PRIMARY_INSTANCE, Call::capture(format!("early-{i}"), json!({})));
		}

		let barrier = Arc::new(Barrier::new(2));
		let pusher = {
			let registry = registry.clone();
			let barrier = barrier.clone();
			thread::spawn(move || {
				barrier.wait();
				for i in 0..200 {
					registry.push(PRIMARY_INSTANCE, Call::capture(format!("late-{i}"), json!({})));
				}
			})
		};
		barrier.wait();
		registry.init(builder(&dispatcher)).unwrap();
		pusher.join().unwrap();

		let names: Vec<String> = dispatcher
			.request_payloads("/e/")
			.iter()
			.map(|p| p["event"].as_str().unwrap_or_default().to_string())
			.collect();
		let expected: Vec<String> = (0..20)
			.map(|i| format!("early-{i}"))
			.chain((0..200).map(|i| format!("late-{i}")))
			.collect();
		assert_eq!(names, expected);
		assert_eq!(registry.pending_len(PRIMARY_INSTANCE), 0);
	}

	#[tokio::test]
	async fn double_init_is_rejected() {
		let registry = ClientRegistry::default();
		let dispatcher = Arc::new(RecordingDispatcher::new());
		registry.init(builder(&dispatcher)).unwrap();
		let second = registry.init(builder(&dispatcher));
		assert!(matches!(second, Err(CaptureError::AlreadyInitialized(name)) if name == PRIMARY_INSTANCE));
	}

	#[tokio::test]
	async fn named_instances_are_independent() {
		let registry = ClientRegistry::default();
		let dispatcher = Arc::new(RecordingDispatcher::new());
		registry.push("secondary", Call::capture("for_secondary", json!({})));
		registry.init(builder(&dispatcher)).unwrap();
		assert_eq!(registry.pending_len("secondary"), 1);

		registry.init(builder(&dispatcher).name("secondary")).unwrap();
		assert_eq!(registry.names(), vec!["loom".to_string(), "secondary".to_string()]);
		assert_eq!(registry.pending_len("secondary"), 0);
	}

	#[tokio::test]
	async fn teardown_unloads_clients() {
		let registry = ClientRegistry::default();
		let dispatcher = Arc::new(RecordingDispatcher::new());
		let client = registry.init(builder(&dispatcher)).unwrap();
		registry.push("never", Call::OptIn);
		registry.teardown();
		assert!(client.is_closed());
		assert!(registry.primary().is_none());
		assert_eq!(registry.pending_len("never"), 0);
		assert_eq!(dispatcher.beacon_payloads("/e/").len(), 1);
	}
}
