// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Deferred client calls.
//!
//! Calls made before a client exists are recorded as [`Command`]s in a
//! bounded [`CommandBuffer`] and replayed once the client is initialized.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, warn};

use crate::client::CaptureClient;
use crate::consent::{OptInOptions, OptOutOptions};
use crate::properties::Properties;

/// A deferred people operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PeopleCall {
	Set(Properties),
	SetOnce(Properties),
	Unset(Vec<String>),
	Increment(Properties),
	Append(Properties),
	Remove(Properties),
	Union(Properties),
	CaptureCharge { amount: Value, properties: Properties },
	ClearCharges,
	DeleteUser,
}

/// A deferred client call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
	Capture { event: String, properties: Properties },
	Identify(String),
	Alias { alias: String, original: Option<String> },
	Register(Properties),
	RegisterOnce { properties: Properties, default_value: Option<Value> },
	Unregister(String),
	Reset { regenerate_device_id: bool },
	TimeEvent(String),
	OptIn,
	OptOut,
	People(PeopleCall),
}

impl Call {
	pub fn capture(event: impl Into<String>, properties: impl Into<Properties>) -> Self {
		Call::Capture {
			event: event.into(),
			properties: properties.into(),
		}
	}

	fn phase(&self) -> Phase {
		match self {
			Call::People(_) => Phase::People,
			Call::Alias { .. } => Phase::Alias,
			Call::Capture { .. } => Phase::Capture,
			_ => Phase::Other,
		}
	}

	/// Runs the call against `client`.
	pub fn apply(self, client: &CaptureClient) {
		match self {
			Call::Capture { event, properties } => {
				client.capture(&event, properties);
			}
			Call::Identify(id) => {
				client.identify(&id);
			}
			Call::Alias { alias, original } => {
				client.alias(&alias, original.as_deref());
			}
			Call::Register(properties) => client.register(properties),
			Call::RegisterOnce {
				properties,
				default_value,
			} => client.register_once(properties, default_value),
			Call::Unregister(key) => client.unregister(&key),
			Call::Reset {
				regenerate_device_id,
			} => client.reset(regenerate_device_id),
			Call::TimeEvent(event) => client.time_event(&event),
			Call::OptIn => {
				client.opt_in_capturing(OptInOptions::default());
			}
			Call::OptOut => client.opt_out_capturing(OptOutOptions::default()),
			Call::People(call) => {
				let people = client.people();
				let _receipt = match call {
					PeopleCall::Set(p) => people.set(p),
					PeopleCall::SetOnce(p) => people.set_once(p),
					PeopleCall::Unset(names) => people.unset(names),
					PeopleCall::Increment(p) => people.increment(p),
					PeopleCall::Append(p) => people.append(p),
					PeopleCall::Remove(p) => people.remove(p),
					PeopleCall::Union(p) => people.union(p),
					PeopleCall::CaptureCharge { amount, properties } => {
						people.capture_charge(amount, properties)
					}
					PeopleCall::ClearCharges => people.clear_charges(),
					PeopleCall::DeleteUser => people.delete_user(),
				};
			}
		}
	}
}

/// One recorded entry: a single call or a chain run in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
	Call(Call),
	Chain(Vec<Call>),
}

impl From<Call> for Command {
	fn from(call: Call) -> Self {
		Command::Call(call)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
	People,
	Alias,
	Other,
	Capture,
}

impl Command {
	fn phase(&self) -> Phase {
		match self {
			Command::Call(call) => call.phase(),
			Command::Chain(_) => Phase::Capture,
		}
	}

	fn apply(self, client: &CaptureClient) {
		match self {
			Command::Call(call) => call.apply(client),
			Command::Chain(calls) => {
				for call in calls {
					call.apply(client);
				}
			}
		}
	}
}

/// Replays commands against `client`.
///
/// People calls run first, then alias calls, then other calls, then capture
/// calls and chains. Order within a phase is preserved, so identity and
/// super properties are in place before any deferred event is captured.
pub fn execute(client: &CaptureClient, commands: Vec<Command>) {
	let mut commands: Vec<(usize, Command)> = commands.into_iter().enumerate().collect();
	commands.sort_by_key(|(index, command)| (command.phase(), *index));
	debug!(count = commands.len(), name = %client.name(), "Replaying deferred commands");
	for (_, command) in commands {
		command.apply(client);
	}
}

/// Bounded buffer of commands for a client that does not exist yet.
///
/// When full, the oldest command is dropped.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
	capacity: usize,
	entries: VecDeque<Command>,
}

impl CommandBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: VecDeque::new(),
		}
	}

	pub fn push(&mut self, command: impl Into<Command>) {
		if self.capacity == 0 {
			warn!("Command buffer has no capacity, dropping command");
			return;
		}
		while self.entries.len() >= self.capacity {
			if let Some(dropped) = self.entries.pop_front() {
				warn!(command = ?dropped, "Dropped deferred command due to buffer overflow");
			}
		}
		self.entries.push_back(command.into());
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn into_commands(self) -> Vec<Command> {
		self.entries.into()
	}
}
