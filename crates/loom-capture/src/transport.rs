// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery of encoded payloads.
//!
//! [`Transport`] picks one of four strategies for every send:
//!
//! 1. beacon, when the caller asks for it (used at teardown)
//! 2. image pixel, when image mode is configured
//! 3. a standard request, POST or GET
//! 4. a script load with a JSONP callback, when the environment cannot make
//!    cross-origin requests
//!
//! The network itself sits behind [`Dispatcher`] so hosts and tests can
//! replace it. [`ReqwestDispatcher`] is the default.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use loom_capture_core::{form_body, DeliveryStatus, VerboseResponse, STATUS_OK};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{CaptureError, Result};

/// Content type of every payload body.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Name of the JSONP callback table.
const JSONP_CALLBACK_TABLE: &str = "callback_fn";

/// Callback sent when the server should answer a script load but nobody
/// listens for the answer.
const NOOP_CALLBACK: &str = "(function(){})";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
	#[default]
	Post,
	Get,
}

impl RequestMethod {
	pub fn as_str(&self) -> &'static str {
		match self {
			RequestMethod::Post => "POST",
			RequestMethod::Get => "GET",
		}
	}
}

/// Delivery mechanism requested by a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
	/// A standard request whose response is observed.
	#[default]
	#[serde(alias = "XHR", alias = "xhr")]
	Standard,
	/// Fire-and-forget delivery with no response.
	#[serde(alias = "sendBeacon")]
	Beacon,
}

/// Per-call overrides. The default value means "use the configuration".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportOptions {
	pub method: Option<RequestMethod>,
	pub transport: Option<TransportKind>,
}

impl TransportOptions {
	pub fn beacon() -> Self {
		Self {
			method: Some(RequestMethod::Post),
			transport: Some(TransportKind::Beacon),
		}
	}

	pub fn is_default(&self) -> bool {
		self.method.is_none() && self.transport.is_none()
	}
}

/// What the host environment can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
	/// Cross-origin requests are available.
	pub supports_cors: bool,
	/// The host has finished loading. Sends made before then are deferred.
	pub ready: bool,
}

impl Default for Environment {
	fn default() -> Self {
		Self {
			supports_cors: true,
			ready: true,
		}
	}
}

/// An outbound request handed to a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
	pub method: RequestMethod,
	pub url: String,
	pub body: Option<String>,
	pub headers: Vec<(String, String)>,
	pub with_credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
	pub status: u16,
	pub body: String,
}

/// Performs the actual network operations.
pub trait Dispatcher: Send + Sync {
	/// A standard request whose response is reported back.
	fn request(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>>;

	/// Queues a fire-and-forget POST. Returns false if the dispatch was refused.
	fn send_beacon(&self, url: &str, body: Option<String>) -> bool;

	/// Fires a GET whose response is ignored.
	fn load_image(&self, url: &str);

	/// Loads a script; the body is the JSONP response.
	fn load_script(&self, url: &str) -> BoxFuture<'static, Result<HttpResponse>>;
}

/// Transport settings taken from the client configuration.
#[derive(Debug, Clone, Default)]
pub struct TransportSettings {
	pub method: RequestMethod,
	pub ip: bool,
	pub test: bool,
	pub verbose: bool,
	pub img: bool,
	pub debug: bool,
	pub headers: BTreeMap<String, String>,
}

/// Resolves when a send completes.
///
/// Resolves to `None` when the strategy cannot observe a response (beacon,
/// image), when the client never requested a status, or when the response
/// could not be read.
#[derive(Debug, Default)]
pub struct DeliveryReceipt {
	rx: Option<oneshot::Receiver<DeliveryStatus>>,
}

impl DeliveryReceipt {
	pub(crate) fn channel() -> (oneshot::Sender<DeliveryStatus>, Self) {
		let (tx, rx) = oneshot::channel();
		(tx, Self { rx: Some(rx) })
	}

	/// A receipt that is already resolved.
	pub fn resolved(status: DeliveryStatus) -> Self {
		let (tx, receipt) = Self::channel();
		let _ = tx.send(status);
		receipt
	}

	/// A receipt that never carries a status.
	pub fn none() -> Self {
		Self { rx: None }
	}

	pub async fn wait(self) -> Option<DeliveryStatus> {
		match self.rx {
			Some(rx) => rx.await.ok(),
			None => None,
		}
	}
}

/// Pending JSONP completions keyed by callback id.
#[derive(Default)]
struct JsonpCallbacks {
	next_id: AtomicU64,
	pending: Mutex<HashMap<u64, oneshot::Sender<DeliveryStatus>>>,
}

impl JsonpCallbacks {
	fn register(&self, tx: oneshot::Sender<DeliveryStatus>) -> (u64, String) {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		self.pending.lock().insert(id, tx);
		(id, format!("{JSONP_CALLBACK_TABLE}[{id}]"))
	}

	fn take(&self, id: u64) -> Option<oneshot::Sender<DeliveryStatus>> {
		self.pending.lock().remove(&id)
	}
}

/// Splits `callback_fn[7]({"status":1})` into the id and argument.
fn parse_jsonp(body: &str) -> Option<(u64, &str)> {
	let rest = body.trim().strip_prefix(JSONP_CALLBACK_TABLE)?.strip_prefix('[')?;
	let (id, rest) = rest.split_once(']')?;
	let arg = rest.trim().strip_prefix('(')?;
	let arg = arg.trim_end().trim_end_matches(';').strip_suffix(')')?;
	Some((id.parse().ok()?, arg))
}

struct Deferred {
	url: String,
	data: String,
	options: TransportOptions,
	completion: Option<oneshot::Sender<DeliveryStatus>>,
}

#[derive(Default)]
struct EnvironmentState {
	env: Environment,
	deferred: Vec<Deferred>,
}

/// Sends encoded payloads using the configured strategy.
pub struct Transport {
	settings: TransportSettings,
	dispatcher: Arc<dyn Dispatcher>,
	runtime: Handle,
	environment: Mutex<EnvironmentState>,
	jsonp: JsonpCallbacks,
}

impl Transport {
	pub fn new(
		settings: TransportSettings,
		dispatcher: Arc<dyn Dispatcher>,
		runtime: Handle,
		environment: Environment,
	) -> Self {
		Self {
			settings,
			dispatcher,
			runtime,
			environment: Mutex::new(EnvironmentState {
				env: environment,
				deferred: Vec::new(),
			}),
			jsonp: JsonpCallbacks::default(),
		}
	}

	pub fn settings(&self) -> &TransportSettings {
		&self.settings
	}

	pub fn is_ready(&self) -> bool {
		self.environment.lock().env.ready
	}

	/// Number of sends waiting for the environment to become ready.
	pub fn deferred_len(&self) -> usize {
		self.environment.lock().deferred.len()
	}

	/// Marks the environment ready and replays deferred sends.
	///
	/// Deferred sends are dropped instead when `drop_deferred` is set.
	pub fn mark_ready(&self, drop_deferred: bool) {
		let deferred = {
			let mut state = self.environment.lock();
			state.env.ready = true;
			std::mem::take(&mut state.deferred)
		};
		if drop_deferred {
			if !deferred.is_empty() {
				debug!(count = deferred.len(), "Dropping deferred sends");
			}
			return;
		}
		for item in deferred {
			self.send(&item.url, item.data, &item.options, item.completion);
		}
	}

	/// Sends one encoded payload.
	///
	/// `data` is the base64 payload. Failures are logged and reported through
	/// `completion`; nothing is returned to the caller.
	pub fn send(
		&self,
		url: &str,
		data: String,
		options: &TransportOptions,
		completion: Option<oneshot::Sender<DeliveryStatus>>,
	) {
		let supports_cors = {
			let mut state = self.environment.lock();
			if !state.env.ready {
				debug!(url = %url, "Environment not ready, deferring send");
				state.deferred.push(Deferred {
					url: url.to_string(),
					data,
					options: *options,
					completion,
				});
				return;
			}
			state.env.supports_cors
		};

		let use_beacon = options.transport == Some(TransportKind::Beacon);
		let mut method = options.method.unwrap_or(self.settings.method);
		if !supports_cors || (self.settings.img && !use_beacon) {
			method = RequestMethod::Get;
		}
		if use_beacon {
			method = RequestMethod::Post;
		}
		let verbose = self.settings.verbose;

		let mut query = url::form_urlencoded::Serializer::new(String::new());
		if method == RequestMethod::Get {
			query.append_pair("data", &data);
		}
		if self.settings.test {
			query.append_pair("test", "1");
		}
		if verbose {
			query.append_pair("verbose", "1");
		}
		if self.settings.img {
			query.append_pair("img", "1");
		}

		let use_script = !supports_cors && !use_beacon && !self.settings.img;
		let mut completion = completion;
		let mut jsonp_id = None;
		if use_script {
			if let Some(tx) = completion.take() {
				let (id, name) = self.jsonp.register(tx);
				jsonp_id = Some(id);
				query.append_pair("callback", &name);
			} else if verbose || self.settings.test {
				query.append_pair("callback", NOOP_CALLBACK);
			}
		}
		query.append_pair("ip", if self.settings.ip { "1" } else { "0" });
		query.append_pair("_", &Utc::now().timestamp_millis().to_string());

		let separator = if url.contains('?') { '&' } else { '?' };
		let full_url = format!("{url}{separator}{}", query.finish());
		let body = (method == RequestMethod::Post).then(|| form_body(&data));

		if self.settings.debug {
			debug!(url = %full_url, method = method.as_str(), "Sending payload");
		}

		if use_beacon {
			if !self.dispatcher.send_beacon(&full_url, body) {
				error!(url = %url, "Beacon dispatch was refused");
			}
		} else if self.settings.img {
			self.dispatcher.load_image(&full_url);
		} else if use_script {
			self.send_script(full_url, jsonp_id, verbose);
		} else {
			self.send_standard(full_url, method, body, completion, verbose);
		}
	}

	fn send_standard(
		&self,
		url: String,
		method: RequestMethod,
		body: Option<String>,
		completion: Option<oneshot::Sender<DeliveryStatus>>,
		verbose: bool,
	) {
		let mut headers: Vec<(String, String)> = Vec::with_capacity(self.settings.headers.len() + 1);
		if method == RequestMethod::Post {
			headers.push(("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string()));
		}
		headers.extend(
			self
				.settings
				.headers
				.iter()
				.map(|(k, v)| (k.clone(), v.clone())),
		);
		let request = HttpRequest {
			method,
			url,
			body,
			headers,
			with_credentials: true,
		};
		let fut = self.dispatcher.request(request);
		self.runtime.spawn(async move {
			let status = interpret_response(fut.await, verbose);
			if let (Some(tx), Some(status)) = (completion, status) {
				let _ = tx.send(status);
			}
		});
	}

	fn send_script(&self, url: String, jsonp_id: Option<u64>, verbose: bool) {
		let fut = self.dispatcher.load_script(&url);
		let pending = jsonp_id.and_then(|id| self.jsonp.take(id).map(|tx| (id, tx)));
		self.runtime.spawn(async move {
			let response = match fut.await {
				Ok(response) => response,
				Err(e) => {
					error!(error = %e, "Script request failed");
					if let Some((_, tx)) = pending {
						let _ = tx.send(DeliveryStatus::failed(verbose, e.to_string()));
					}
					return;
				}
			};
			let Some((id, tx)) = pending else {
				return;
			};
			match parse_jsonp(&response.body) {
				Some((called, arg)) if called == id => {
					if let Some(status) = parse_status(arg, verbose) {
						let _ = tx.send(status);
					}
				}
				_ => {
					warn!(body = %response.body, "Unexpected JSONP response");
				}
			}
		});
	}
}

/// Maps a standard response onto a delivery status.
///
/// Returns `None` when a verbose 200 response cannot be parsed; that failure
/// is logged and no status is reported.
fn interpret_response(response: Result<HttpResponse>, verbose: bool) -> Option<DeliveryStatus> {
	match response {
		Ok(response) if response.status == 200 => parse_status(&response.body, verbose),
		Ok(response) => {
			let message = format!("Bad HTTP status: {} {}", response.status, response.body);
			error!(status = response.status, body = %response.body, "Bad HTTP status");
			Some(DeliveryStatus::failed(verbose, message))
		}
		Err(e) => {
			error!(error = %e, "Request failed");
			Some(DeliveryStatus::failed(verbose, e.to_string()))
		}
	}
}

fn parse_status(body: &str, verbose: bool) -> Option<DeliveryStatus> {
	if verbose {
		match serde_json::from_str::<VerboseResponse>(body) {
			Ok(response) => Some(DeliveryStatus::Verbose(response)),
			Err(e) => {
				error!(error = %e, "Failed to parse verbose response");
				None
			}
		}
	} else {
		Some(DeliveryStatus::Code(body.trim().parse().unwrap_or(STATUS_OK)))
	}
}

/// The default [`Dispatcher`], backed by reqwest.
#[derive(Clone)]
pub struct ReqwestDispatcher {
	client: Client,
	runtime: Handle,
}

impl ReqwestDispatcher {
	/// Builds a dispatcher on the current tokio runtime.
	pub fn new(timeout: Duration) -> Result<Self> {
		let runtime = Handle::try_current().map_err(|_| CaptureError::NoRuntime)?;
		let client = Client::builder()
			.user_agent(user_agent())
			.timeout(timeout)
			.build()
			.map_err(CaptureError::RequestFailed)?;
		Ok(Self { client, runtime })
	}

	async fn execute(client: Client, request: HttpRequest) -> Result<HttpResponse> {
		let mut builder = match request.method {
			RequestMethod::Post => client.post(&request.url),
			RequestMethod::Get => client.get(&request.url),
		};
		for (name, value) in &request.headers {
			builder = builder.header(name, value);
		}
		if let Some(body) = request.body {
			builder = builder.body(body);
		}
		let response = builder.send().await?;
		let status = response.status().as_u16();
		let body = response.text().await?;
		Ok(HttpResponse { status, body })
	}
}

impl Dispatcher for ReqwestDispatcher {
	fn request(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
		Box::pin(Self::execute(self.client.clone(), request))
	}

	fn send_beacon(&self, url: &str, body: Option<String>) -> bool {
		let request = HttpRequest {
			method: RequestMethod::Post,
			url: url.to_string(),
			body,
			headers: vec![("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string())],
			with_credentials: false,
		};
		let client = self.client.clone();
		self.runtime.spawn(async move {
			if let Err(e) = Self::execute(client, request).await {
				debug!(error = %e, "Beacon delivery failed");
			}
		});
		true
	}

	fn load_image(&self, url: &str) {
		let request = HttpRequest {
			method: RequestMethod::Get,
			url: url.to_string(),
			body: None,
			headers: Vec::new(),
			with_credentials: false,
		};
		let client = self.client.clone();
		self.runtime.spawn(async move {
			if let Err(e) = Self::execute(client, request).await {
				debug!(error = %e, "Image request failed");
			}
		});
	}

	fn load_script(&self, url: &str) -> BoxFuture<'static, Result<HttpResponse>> {
		let request = HttpRequest {
			method: RequestMethod::Get,
			url: url.to_string(),
			body: None,
			headers: Vec::new(),
			with_credentials: false,
		};
		Box::pin(Self::execute(self.client.clone(), request))
	}
}

/// User agent sent by [`ReqwestDispatcher`].
pub fn user_agent() -> String {
	format!("loom-capture/{}", env!("CARGO_PKG_VERSION"))
}
