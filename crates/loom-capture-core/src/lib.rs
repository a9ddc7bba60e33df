// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom client-side capture pipeline.
//!
//! This crate holds the wire-level data model shared by the capture SDK:
//!
//! - [`EventEnvelope`] / [`BatchedEvent`] - single and batched `/e/` payloads
//! - [`PeopleOperation`] / [`PeopleQueues`] - profile mutations for `/engage/`
//! - [`IdentityState`] - distinct id, device id and alias bookkeeping
//! - [`ConsentRecord`] - opt-in/opt-out status snapshot
//! - [`truncate`] and [`encode_payload`] - the shape every payload takes before
//!   it reaches the network
//!
//! Nothing here performs I/O.

pub mod consent;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod people;
pub mod referrer;
pub mod status;
pub mod truncate;

pub use consent::{ConsentRecord, ConsentState, StorageMedium, DEFAULT_CONSENT_PREFIX};
pub use encoding::{decode_payload, encode_payload, form_body};
pub use envelope::{
	BatchedEvent, EventEnvelope, CREATE_ALIAS_EVENT, IDENTIFY_EVENT, OPT_IN_EVENT,
	PAGELEAVE_EVENT, PAGEVIEW_EVENT,
};
pub use error::{CoreError, Result};
pub use identity::{
	generate_distinct_id, IdentityState, ALIAS_ID_KEY, DEVICE_ID_KEY, DISTINCT_ID_KEY,
	HAD_PERSISTED_DISTINCT_ID_KEY, PEOPLE_DISTINCT_ID_KEY, USER_ID_KEY,
};
pub use people::{
	EngageOperation, EngagePayload, PeopleAction, PeopleOperation, PeopleQueues,
	RESERVED_PEOPLE_PROPERTIES, TRANSACTIONS_PROPERTY,
};
pub use status::{DeliveryStatus, VerboseResponse, STATUS_FAILED, STATUS_OK, STATUS_QUEUED};
pub use truncate::{truncate, MAX_STRING_LENGTH};
