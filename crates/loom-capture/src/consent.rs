// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Opt-in/opt-out state and its storage.

use std::collections::HashMap;
use std::sync::Arc;

use loom_capture_core::consent::storage_key;
use loom_capture_core::{ConsentRecord, ConsentState, StorageMedium, OPT_IN_EVENT};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::client::{CaptureClient, Captured};
use crate::persistence::PersistenceStore;
use crate::properties::Properties;

/// Storage for consent records, addressed by medium and key.
pub trait ConsentStore: Send + Sync {
	fn read(&self, medium: StorageMedium, key: &str) -> Option<String>;
	fn write(&self, medium: StorageMedium, key: &str, value: &str);
	fn remove(&self, medium: StorageMedium, key: &str);
}

/// A [`ConsentStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryConsentStore {
	entries: Mutex<HashMap<(StorageMedium, String), String>>,
}

impl MemoryConsentStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl ConsentStore for MemoryConsentStore {
	fn read(&self, medium: StorageMedium, key: &str) -> Option<String> {
		self.entries.lock().get(&(medium, key.to_string())).cloned()
	}

	fn write(&self, medium: StorageMedium, key: &str, value: &str) {
		self
			.entries
			.lock()
			.insert((medium, key.to_string()), value.to_string());
	}

	fn remove(&self, medium: StorageMedium, key: &str) {
		self.entries.lock().remove(&(medium, key.to_string()));
	}
}

/// How persistence should change alongside a consent transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PersistenceChange {
	None,
	Enable,
	Disable,
}

/// Reads and writes the consent record for one project token and applies
/// the matching persistence changes.
pub struct ConsentManager {
	token: String,
	medium: StorageMedium,
	prefix: String,
	store: Arc<dyn ConsentStore>,
	persistence: Arc<dyn PersistenceStore>,
	/// When false, consent never toggles persistence.
	manage_persistence: bool,
}

impl ConsentManager {
	pub(crate) fn new(
		token: impl Into<String>,
		medium: StorageMedium,
		prefix: impl Into<String>,
		store: Arc<dyn ConsentStore>,
		persistence: Arc<dyn PersistenceStore>,
		manage_persistence: bool,
	) -> Self {
		Self {
			token: token.into(),
			medium,
			prefix: prefix.into(),
			store,
			persistence,
			manage_persistence,
		}
	}

	fn key(&self) -> String {
		storage_key(&self.prefix, &self.token)
	}

	pub fn state(&self) -> ConsentState {
		self.state_in(self.medium)
	}

	fn state_in(&self, medium: StorageMedium) -> ConsentState {
		self
			.store
			.read(medium, &self.key())
			.map(|v| ConsentState::from_stored(&v))
			.unwrap_or(ConsentState::Unknown)
	}

	pub fn record(&self) -> ConsentRecord {
		ConsentRecord::new(self.state(), self.medium, self.prefix.clone())
	}

	pub fn has_opted_in(&self) -> bool {
		self.state() == ConsentState::OptedIn
	}

	pub fn has_opted_out(&self) -> bool {
		self.state() == ConsentState::OptedOut
	}

	/// Moves a cookie record into local storage and clears the cookie.
	///
	/// Only the stored value moves; no consent events are emitted.
	pub(crate) fn migrate_legacy(&self) {
		if self.medium != StorageMedium::Local {
			return;
		}
		let legacy = self.state_in(StorageMedium::Cookie);
		if legacy != ConsentState::Unknown && self.state() == ConsentState::Unknown {
			if let Some(stored) = legacy.to_stored() {
				info!(state = ?legacy, "Migrating consent record from cookie to local storage");
				self.store.write(self.medium, &self.key(), stored);
			}
		}
		self.store.remove(StorageMedium::Cookie, &self.key());
	}

	pub(crate) fn set_state(&self, state: ConsentState, change: PersistenceChange) {
		let key = self.key();
		match state.to_stored() {
			Some(stored) => self.store.write(self.medium, &key, stored),
			None => self.store.remove(self.medium, &key),
		}
		debug!(state = ?state, "Consent state updated");
		self.apply(change);
	}

	pub(crate) fn apply(&self, change: PersistenceChange) {
		if !self.manage_persistence {
			return;
		}
		match change {
			PersistenceChange::None => {}
			PersistenceChange::Enable => {
				if self.persistence.is_disabled() {
					self.persistence.set_disabled(false);
				}
			}
			PersistenceChange::Disable => {
				if !self.persistence.is_disabled() {
					self.persistence.set_disabled(true);
				}
			}
		}
	}
}

/// Options for [`CaptureClient::opt_in_capturing`].
#[derive(Debug, Clone)]
pub struct OptInOptions {
	/// Capture `$opt_in` after opting in.
	pub capture_event: bool,
	pub enable_persistence: bool,
	/// Properties for the `$opt_in` event.
	pub properties: Properties,
}

impl Default for OptInOptions {
	fn default() -> Self {
		Self {
			capture_event: true,
			enable_persistence: true,
			properties: Properties::new(),
		}
	}
}

/// Options for [`CaptureClient::opt_out_capturing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptOutOptions {
	/// Delete the people profile and its charges if identify was called.
	pub delete_user: bool,
	/// Disable persistence, removing its durable copy.
	pub clear_persistence: bool,
}

impl Default for OptOutOptions {
	fn default() -> Self {
		Self {
			delete_user: true,
			clear_persistence: true,
		}
	}
}

impl CaptureClient {
	/// Applies stored consent at startup.
	pub(crate) fn init_consent(&self) {
		let consent = &self.inner.consent;
		consent.migrate_legacy();
		if consent.has_opted_out() {
			consent.apply(PersistenceChange::Disable);
		} else if !consent.has_opted_in() && self.inner.config.opt_out_capturing_by_default {
			self.opt_out_capturing(OptOutOptions {
				clear_persistence: self.inner.config.opt_out_persistence_by_default,
				..Default::default()
			});
		}
	}

	/// Opts in to capturing and, by default, captures `$opt_in`.
	pub fn opt_in_capturing(&self, options: OptInOptions) -> Option<Captured> {
		let change = if options.enable_persistence {
			PersistenceChange::Enable
		} else {
			PersistenceChange::None
		};
		self.inner.consent.set_state(ConsentState::OptedIn, change);
		info!(name = %self.inner.name, "Opted in to capturing");
		options
			.capture_event
			.then(|| self.capture_exempt(OPT_IN_EVENT, options.properties.into_map()))
	}

	/// Opts out of capturing.
	pub fn opt_out_capturing(&self, options: OptOutOptions) {
		if options.delete_user && self.is_identified() {
			let people = self.people();
			people.delete_user();
			people.clear_charges();
		}
		let change = if options.clear_persistence {
			PersistenceChange::Disable
		} else {
			PersistenceChange::None
		};
		self.inner.consent.set_state(ConsentState::OptedOut, change);
		info!(name = %self.inner.name, "Opted out of capturing");
	}

	pub fn has_opted_in_capturing(&self) -> bool {
		self.inner.consent.has_opted_in()
	}

	pub fn has_opted_out_capturing(&self) -> bool {
		self.inner.consent.has_opted_out()
	}

	/// Forgets the recorded consent decision.
	pub fn clear_opt_in_out_capturing(&self, enable_persistence: bool) {
		let change = if enable_persistence {
			PersistenceChange::Enable
		} else {
			PersistenceChange::None
		};
		self.inner.consent.set_state(ConsentState::Unknown, change);
	}

	pub fn consent_record(&self) -> ConsentRecord {
		self.inner.consent.record()
	}
}
