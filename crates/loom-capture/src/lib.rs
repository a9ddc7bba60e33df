// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client-side event capture SDK for Loom product analytics.
//!
//! Captures behavioral events and people profile mutations from an
//! application and delivers them to a Loom collection endpoint.
//!
//! # Features
//!
//! - **Batching**: default-path events are sent once per batching window as
//!   one array per destination
//! - **Transport strategies**: standard request, beacon, image pixel and a
//!   script fallback for hosts without cross-origin requests
//! - **Identity**: identify, alias and reset with duplicate-profile
//!   protection
//! - **People queue**: profile mutations wait for identify and are retried
//!   when delivery fails
//! - **Consent**: opt-in/opt-out gating of capture and persistence
//!
//! # Example
//!
//! ```ignore
//! use loom_capture::{CaptureClient, Properties};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CaptureClient::builder()
//!         .token("phc_project_token")
//!         .api_host("https://t.loom.dev")
//!         .build()?;
//!
//!     client.capture("checkout_started", Properties::new().insert("items", 3));
//!     client.identify("user_123");
//!     client.people().set(Properties::new().insert("plan", "team"));
//!
//!     // Flush queued events with a beacon before exiting.
//!     client.shutdown();
//!     Ok(())
//! }
//! ```

mod batch;
mod client;
mod command;
mod config;
mod consent;
mod context;
mod error;
mod identity;
mod people;
mod persistence;
mod properties;
mod registry;
pub mod testing;
mod transport;

pub use batch::{BatchConfig, BatchGroup, BatchQueue, QueuedRequest};
pub use client::{CaptureClient, CaptureClientBuilder, CaptureOptions, Captured, PRIMARY_INSTANCE};
pub use command::{execute, Call, Command, CommandBuffer, PeopleCall};
pub use config::{CaptureConfig, DEFAULT_API_HOST};
pub use consent::{ConsentManager, ConsentStore, MemoryConsentStore, OptInOptions, OptOutOptions};
pub use context::{is_blocked_user_agent, ContextProvider, StaticContext, LIB_NAME, LIB_VERSION};
pub use error::{CaptureError, Result};
pub use identity::{AliasOutcome, ALIAS_CONFLICT, ALIAS_SAME_AS_ORIGINAL};
pub use people::{People, PeopleFlush};
pub use persistence::{MemoryPersistence, PersistedState, PersistenceStore};
pub use properties::Properties;
pub use registry::ClientRegistry;
pub use transport::{
	user_agent, DeliveryReceipt, Dispatcher, Environment, HttpRequest, HttpResponse,
	ReqwestDispatcher, RequestMethod, Transport, TransportKind, TransportOptions,
	TransportSettings, FORM_CONTENT_TYPE,
};

// Re-export core types for convenience
pub use loom_capture_core::{
	ConsentRecord, ConsentState, DeliveryStatus, EventEnvelope, IdentityState, PeopleAction,
	PeopleOperation, StorageMedium, VerboseResponse, MAX_STRING_LENGTH,
};
