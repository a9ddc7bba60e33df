// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The capture client and its event pipeline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use loom_capture_core::{
	encode_payload, generate_distinct_id, DeliveryStatus, EventEnvelope, DEVICE_ID_KEY,
	DISTINCT_ID_KEY, MAX_STRING_LENGTH, PAGELEAVE_EVENT, PAGEVIEW_EVENT,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchQueue, QueuedRequest};
use crate::config::CaptureConfig;
use crate::consent::{ConsentManager, ConsentStore, MemoryConsentStore};
use crate::context::{is_blocked_user_agent, ContextProvider, StaticContext};
use crate::error::{CaptureError, Result};
use crate::persistence::{MemoryPersistence, PersistenceStore};
use crate::properties::{layered, strip_blacklisted, Properties};
use crate::transport::{
	DeliveryReceipt, Dispatcher, Environment, ReqwestDispatcher, Transport, TransportOptions,
	TransportSettings,
};

/// Name of the primary client instance.
pub const PRIMARY_INSTANCE: &str = "loom";

/// Per-call capture options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
	/// Transport overrides. Any override sends the event immediately.
	pub transport: TransportOptions,
	/// Report the delivery status through the returned receipt. Tracked
	/// events are sent immediately instead of being batched.
	pub track_delivery: bool,
}

impl CaptureOptions {
	pub fn tracked() -> Self {
		Self {
			track_delivery: true,
			..Default::default()
		}
	}

	pub fn beacon() -> Self {
		Self {
			transport: TransportOptions::beacon(),
			..Default::default()
		}
	}

	fn is_fire_and_forget(&self) -> bool {
		self.transport.is_default() && !self.track_delivery
	}
}

/// Result of a capture call.
#[derive(Debug)]
pub struct Captured {
	/// The truncated payload, or `None` if nothing was captured.
	pub payload: Option<Value>,
	pub receipt: DeliveryReceipt,
}

impl Captured {
	fn skipped() -> Self {
		Self {
			payload: None,
			receipt: DeliveryReceipt::resolved(DeliveryStatus::skipped()),
		}
	}

	fn rejected() -> Self {
		Self {
			payload: None,
			receipt: DeliveryReceipt::none(),
		}
	}
}

/// Builder for constructing a [`CaptureClient`].
pub struct CaptureClientBuilder {
	token: Option<String>,
	api_host: Option<String>,
	name: String,
	config: CaptureConfig,
	persistence: Option<Arc<dyn PersistenceStore>>,
	consent_store: Option<Arc<dyn ConsentStore>>,
	context: Option<Arc<dyn ContextProvider>>,
	dispatcher: Option<Arc<dyn Dispatcher>>,
	environment: Environment,
}

impl CaptureClientBuilder {
	pub fn new() -> Self {
		Self {
			token: None,
			api_host: None,
			name: PRIMARY_INSTANCE.to_string(),
			config: CaptureConfig::default(),
			persistence: None,
			consent_store: None,
			context: None,
			dispatcher: None,
			environment: Environment::default(),
		}
	}

	/// Sets the project token sent with every payload.
	pub fn token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	/// Overrides `config.api_host`.
	///
	/// Example: `https://t.loom.dev`
	pub fn api_host(mut self, host: impl Into<String>) -> Self {
		self.api_host = Some(host.into());
		self
	}

	pub fn config(mut self, config: CaptureConfig) -> Self {
		self.config = config;
		self
	}

	/// Sets the instance name used in logs and by the registry.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	pub(crate) fn instance_name(&self) -> &str {
		&self.name
	}

	pub fn persistence(mut self, persistence: Arc<dyn PersistenceStore>) -> Self {
		self.persistence = Some(persistence);
		self
	}

	pub fn consent_store(mut self, store: Arc<dyn ConsentStore>) -> Self {
		self.consent_store = Some(store);
		self
	}

	pub fn context(mut self, context: Arc<dyn ContextProvider>) -> Self {
		self.context = Some(context);
		self
	}

	/// Replaces the reqwest-backed dispatcher.
	pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
		self.dispatcher = Some(dispatcher);
		self
	}

	/// Describes what the host environment can do.
	pub fn environment(mut self, environment: Environment) -> Self {
		self.environment = environment;
		self
	}

	/// Builds the client.
	///
	/// Must run inside a tokio runtime. Seeds the identity, applies stored
	/// consent and captures the initial page view when configured.
	pub fn build(self) -> Result<CaptureClient> {
		let token = self
			.token
			.filter(|t| !t.trim().is_empty())
			.ok_or(CaptureError::InvalidToken)?;

		let mut config = self.config;
		if let Some(host) = self.api_host {
			config.api_host = host;
		}
		let parsed = url::Url::parse(&config.api_host)
			.map_err(|e| CaptureError::InvalidApiHost(format!("{}: {e}", config.api_host)))?;
		if !matches!(parsed.scheme(), "http" | "https") {
			return Err(CaptureError::InvalidApiHost(config.api_host.clone()));
		}
		config.api_host = config.api_host.trim_end_matches('/').to_string();

		let runtime = Handle::try_current().map_err(|_| CaptureError::NoRuntime)?;

		let dispatcher = match self.dispatcher {
			Some(dispatcher) => dispatcher,
			None => Arc::new(ReqwestDispatcher::new(config.request_timeout())?),
		};
		let persistence = self
			.persistence
			.unwrap_or_else(|| Arc::new(MemoryPersistence::new()));
		if config.disable_persistence {
			persistence.set_disabled(true);
		}
		let consent_store = self
			.consent_store
			.unwrap_or_else(|| Arc::new(MemoryConsentStore::new()));
		let context = self
			.context
			.unwrap_or_else(|| Arc::new(StaticContext::new()));

		let transport = Arc::new(Transport::new(
			TransportSettings {
				method: config.api_method,
				ip: config.ip,
				test: config.test,
				verbose: config.verbose,
				img: config.img,
				debug: config.debug,
				headers: config.xhr_headers.clone(),
			},
			dispatcher,
			runtime.clone(),
			self.environment,
		));
		let batch = BatchQueue::new(config.batch_config(), transport.clone(), runtime.clone());
		let consent = ConsentManager::new(
			token.clone(),
			config.opt_out_capturing_persistence_type,
			config.consent_prefix(),
			consent_store,
			persistence.clone(),
			!config.disable_persistence,
		);

		let client = CaptureClient {
			inner: Arc::new(ClientInner {
				name: self.name,
				token,
				config,
				persistence,
				consent,
				context,
				transport,
				batch,
				runtime,
				identify_called: AtomicBool::new(false),
				disabled_events: RwLock::new(HashSet::new()),
				disable_all_events: AtomicBool::new(false),
				unloaded: AtomicBool::new(false),
				closed: AtomicBool::new(false),
			}),
		};
		client.initialize();

		info!(
			name = %client.inner.name,
			api_host = %client.inner.config.api_host,
			"Capture client initialized"
		);
		Ok(client)
	}
}

impl Default for CaptureClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

pub(crate) struct ClientInner {
	pub(crate) name: String,
	pub(crate) token: String,
	pub(crate) config: CaptureConfig,
	pub(crate) persistence: Arc<dyn PersistenceStore>,
	pub(crate) consent: ConsentManager,
	pub(crate) context: Arc<dyn ContextProvider>,
	pub(crate) transport: Arc<Transport>,
	pub(crate) batch: Arc<BatchQueue>,
	pub(crate) runtime: Handle,
	pub(crate) identify_called: AtomicBool,
	disabled_events: RwLock<HashSet<String>>,
	disable_all_events: AtomicBool,
	unloaded: AtomicBool,
	closed: AtomicBool,
}

/// A client-side capture client.
///
/// Cheap to clone; clones share state.
///
/// # Example
///
/// ```ignore
/// let client = CaptureClient::builder()
///     .token("phc_project_token")
///     .api_host("https://t.loom.dev")
///     .build()?;
///
/// client.capture("signup_clicked", Properties::new().insert("plan", "team"));
/// client.identify("user_123");
/// client.people().set(Properties::new().insert("email", "a@example.com"));
/// ```
#[derive(Clone)]
pub struct CaptureClient {
	pub(crate) inner: Arc<ClientInner>,
}

impl CaptureClient {
	pub fn builder() -> CaptureClientBuilder {
		CaptureClientBuilder::new()
	}

	fn initialize(&self) {
		let id = generate_distinct_id();
		let mut seed = Map::new();
		seed.insert(DISTINCT_ID_KEY.to_string(), Value::String(id.clone()));
		seed.insert(DEVICE_ID_KEY.to_string(), Value::String(id));
		self
			.inner
			.persistence
			.register_once(seed, Some(&Value::String(String::new())));

		self.init_consent();

		if self.inner.config.capture_pageview {
			self.capture_pageview();
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn config(&self) -> &CaptureConfig {
		&self.inner.config
	}

	/// Captures an event and returns the truncated payload.
	///
	/// Returns `None` when the event is rejected, disabled or blocked by
	/// consent.
	pub fn capture(&self, event: &str, properties: impl Into<Properties>) -> Option<Value> {
		self.capture_with(event, properties, CaptureOptions::default()).payload
	}

	/// Captures an event with per-call options.
	pub fn capture_with(
		&self,
		event: &str,
		properties: impl Into<Properties>,
		options: CaptureOptions,
	) -> Captured {
		self.capture_event(event, properties.into().into_map(), options, false)
	}

	/// Captures an event that the consent gate lets through.
	pub(crate) fn capture_exempt(&self, event: &str, properties: Map<String, Value>) -> Captured {
		self.capture_event(event, properties, CaptureOptions::default(), true)
	}

	fn capture_event(
		&self,
		event: &str,
		properties: Map<String, Value>,
		options: CaptureOptions,
		consent_exempt: bool,
	) -> Captured {
		let inner = &self.inner;
		if inner.closed.load(Ordering::SeqCst) {
			warn!(event = %event, "Capture called on a closed client");
			return Captured::rejected();
		}
		if event.is_empty() {
			error!("No event name provided to capture");
			return Captured::rejected();
		}
		if self.is_event_disabled(event) {
			debug!(event = %event, "Event disabled, not capturing");
			return Captured::skipped();
		}
		if !consent_exempt && inner.consent.has_opted_out() {
			debug!(event = %event, "Capturing opted out, skipping event");
			return Captured::skipped();
		}

		let mut caller = properties;
		if let Some(started_at) = inner.persistence.remove_event_timer(event) {
			let elapsed_ms = (Utc::now() - started_at).num_milliseconds().max(0);
			caller.insert("$duration".to_string(), Value::from(elapsed_ms as f64 / 1000.0));
		}

		let current_url = inner.context.current_url();
		let referrer = inner.context.referrer();
		if let Some(referrer) = &referrer {
			inner.persistence.update_search_keyword(referrer);
		}
		if inner.config.store_google {
			if let Some(url) = &current_url {
				inner.persistence.update_campaign_params(url);
			}
		}
		if inner.config.save_referrer {
			inner
				.persistence
				.update_referrer_info(referrer.as_deref().unwrap_or_default());
		}

		let context_props = inner.context.event_properties();
		let super_props = inner.persistence.properties();
		let referrer_props = if inner.config.save_referrer {
			inner.persistence.referrer_info()
		} else {
			Map::new()
		};
		let campaign_props = match (&current_url, inner.config.store_google) {
			(Some(url), true) => loom_capture_core::referrer::campaign_params(url),
			_ => Map::new(),
		};
		let mut merged = layered([
			&context_props,
			&super_props,
			&referrer_props,
			&campaign_props,
			&caller,
		]);
		merged.insert("token".to_string(), Value::String(inner.token.clone()));
		strip_blacklisted(&mut merged, &inner.config.property_blacklist);

		let envelope = EventEnvelope::new(event, merged).truncated(MAX_STRING_LENGTH);
		let payload = envelope.to_value();

		if inner.config.debug {
			debug!(event = %event, payload = %payload, "Captured event");
		}

		let url = inner.config.events_url();
		if !inner.config.request_batching || !options.is_fire_and_forget() {
			let (completion, receipt) = if options.track_delivery {
				let (tx, receipt) = DeliveryReceipt::channel();
				(Some(tx), receipt)
			} else {
				(None, DeliveryReceipt::none())
			};
			match encode_payload(&payload) {
				Ok(encoded) => inner.transport.send(&url, encoded, &options.transport, completion),
				Err(e) => error!(error = %e, event = %event, "Failed to encode event"),
			}
			return Captured {
				payload: Some(payload),
				receipt,
			};
		}

		inner.batch.enqueue(QueuedRequest {
			url,
			data: envelope.captured_at(Utc::now()),
			options: options.transport,
		});
		Captured {
			payload: Some(payload),
			receipt: DeliveryReceipt::none(),
		}
	}

	fn is_event_disabled(&self, event: &str) -> bool {
		if self.inner.disable_all_events.load(Ordering::SeqCst) {
			return true;
		}
		if let Some(ua) = self.inner.context.user_agent() {
			if is_blocked_user_agent(&ua) {
				return true;
			}
		}
		self.inner.disabled_events.read().contains(event)
	}

	/// Captures a `$pageview` for the current page.
	pub fn capture_pageview(&self) -> Option<Value> {
		let mut props = Map::new();
		if let Some(url) = self.inner.context.current_url() {
			props.insert("$current_url".to_string(), Value::String(url));
		}
		self.capture(PAGEVIEW_EVENT, props)
	}

	/// Registers super properties sent with every event.
	pub fn register(&self, properties: impl Into<Properties>) {
		self.inner.persistence.register(properties.into().into_map());
	}

	/// Registers super properties that are not already set, or whose current
	/// value equals `default_value`.
	pub fn register_once(&self, properties: impl Into<Properties>, default_value: Option<Value>) {
		self
			.inner
			.persistence
			.register_once(properties.into().into_map(), default_value.as_ref());
	}

	pub fn unregister(&self, key: &str) {
		self.inner.persistence.unregister(key);
	}

	pub fn get_property(&self, key: &str) -> Option<Value> {
		self.inner.persistence.get(key)
	}

	pub fn get_distinct_id(&self) -> String {
		self
			.inner
			.persistence
			.get(DISTINCT_ID_KEY)
			.and_then(|v| v.as_str().map(str::to_string))
			.unwrap_or_default()
	}

	/// Starts a timer for `event`; the next capture of it carries
	/// `$duration` in seconds.
	pub fn time_event(&self, event: &str) {
		if event.is_empty() {
			error!("No event name provided to time_event");
			return;
		}
		self.inner.persistence.set_event_timer(event, Utc::now());
	}

	/// Stops capturing the named events.
	pub fn disable_events<I, S>(&self, events: I)
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut disabled = self.inner.disabled_events.write();
		disabled.extend(events.into_iter().map(Into::into));
	}

	/// Global kill switch for event capture.
	pub fn set_disable_all_events(&self, disabled: bool) {
		self.inner.disable_all_events.store(disabled, Ordering::SeqCst);
	}

	/// Signals that the host can now make requests.
	///
	/// Replays sends deferred until now, unless capturing is opted out, and
	/// starts the batch poller.
	pub fn environment_ready(&self) {
		let opted_out = self.inner.consent.has_opted_out();
		self.inner.transport.mark_ready(opted_out);
		if self.inner.config.request_batching && !opted_out {
			self.inner.batch.start();
		}
	}

	/// Flushes everything at host teardown.
	///
	/// Cancels the batch poller, captures `$pageleave` and sends each queued
	/// destination as one beacon. Runs once per client.
	pub fn handle_unload(&self) {
		if self.inner.unloaded.swap(true, Ordering::SeqCst) {
			return;
		}
		if !self.inner.config.request_batching {
			self.capture_with(PAGELEAVE_EVENT, Map::new(), CaptureOptions::beacon());
			return;
		}

		self.inner.batch.cancel();
		self.capture(PAGELEAVE_EVENT, Map::new());
		let groups = self.inner.batch.drain();
		debug!(groups = groups.len(), "Flushing batch queue on unload");
		for group in groups {
			self
				.inner
				.transport
				.send(&group.url, group.encoded, &TransportOptions::beacon(), None);
		}
	}

	/// Flushes pending events and closes the client.
	pub fn shutdown(&self) {
		if self.inner.closed.load(Ordering::SeqCst) {
			return;
		}
		self.handle_unload();
		self.inner.closed.store(true, Ordering::SeqCst);
		info!(name = %self.inner.name, "Capture client shut down");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Number of events waiting for the next batch.
	pub fn queued_events(&self) -> usize {
		self.inner.batch.len()
	}
}
