// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Test support: a dispatcher that records instead of sending.

use futures::future::{self, BoxFuture};
use loom_capture_core::decode_payload;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::transport::{Dispatcher, HttpRequest, HttpResponse};

#[derive(Debug)]
struct RecordingState {
	requests: Vec<HttpRequest>,
	beacons: Vec<(String, Option<String>)>,
	images: Vec<String>,
	scripts: Vec<String>,
	responses: Vec<(String, HttpResponse)>,
	accept_beacons: bool,
}

/// Records every dispatch synchronously.
///
/// Requests and script loads answer `200 "1"` unless a response was
/// configured with [`respond_with`](Self::respond_with).
#[derive(Debug)]
pub struct RecordingDispatcher {
	state: Mutex<RecordingState>,
}

impl Default for RecordingDispatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl RecordingDispatcher {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(RecordingState {
				requests: Vec::new(),
				beacons: Vec::new(),
				images: Vec::new(),
				scripts: Vec::new(),
				responses: Vec::new(),
				accept_beacons: true,
			}),
		}
	}

	/// Answers requests whose url contains `pattern`. The latest matching
	/// rule wins.
	pub fn respond_with(&self, pattern: impl Into<String>, status: u16, body: impl Into<String>) {
		self.state.lock().responses.push((
			pattern.into(),
			HttpResponse {
				status,
				body: body.into(),
			},
		));
	}

	/// Drops every configured response.
	pub fn reset_responses(&self) {
		self.state.lock().responses.clear();
	}

	pub fn refuse_beacons(&self) {
		self.state.lock().accept_beacons = false;
	}

	pub fn requests(&self) -> Vec<HttpRequest> {
		self.state.lock().requests.clone()
	}

	pub fn beacons(&self) -> Vec<(String, Option<String>)> {
		self.state.lock().beacons.clone()
	}

	pub fn images(&self) -> Vec<String> {
		self.state.lock().images.clone()
	}

	pub fn scripts(&self) -> Vec<String> {
		self.state.lock().scripts.clone()
	}

	/// Total dispatches of any kind.
	pub fn dispatch_count(&self) -> usize {
		let state = self.state.lock();
		state.requests.len() + state.beacons.len() + state.images.len() + state.scripts.len()
	}

	/// Decoded payloads of standard requests whose url contains `path`.
	pub fn request_payloads(&self, path: &str) -> Vec<Value> {
		self
			.requests()
			.into_iter()
			.filter(|r| r.url.contains(path))
			.filter_map(|r| r.body.as_deref().and_then(decode_body))
			.collect()
	}

	/// Decoded payloads of beacons whose url contains `path`.
	pub fn beacon_payloads(&self, path: &str) -> Vec<Value> {
		self
			.beacons()
			.into_iter()
			.filter(|(url, _)| url.contains(path))
			.filter_map(|(_, body)| body.as_deref().and_then(decode_body))
			.collect()
	}

	pub fn clear(&self) {
		let mut state = self.state.lock();
		state.requests.clear();
		state.beacons.clear();
		state.images.clear();
		state.scripts.clear();
	}

	fn response_for(&self, url: &str) -> HttpResponse {
		self
			.state
			.lock()
			.responses
			.iter()
			.rev()
			.find(|(pattern, _)| url.contains(pattern.as_str()))
			.map(|(_, response)| response.clone())
			.unwrap_or(HttpResponse {
				status: 200,
				body: "1".to_string(),
			})
	}
}

/// Decodes a `data=<base64>` body.
pub fn decode_body(body: &str) -> Option<Value> {
	decode_payload(body.strip_prefix("data=")?).ok()
}

impl Dispatcher for RecordingDispatcher {
	fn request(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
		let response = self.response_for(&request.url);
		self.state.lock().requests.push(request);
		Box::pin(future::ready(Ok(response)))
	}

	fn send_beacon(&self, url: &str, body: Option<String>) -> bool {
		let mut state = self.state.lock();
		if !state.accept_beacons {
			return false;
		}
		state.beacons.push((url.to_string(), body));
		true
	}

	fn load_image(&self, url: &str) {
		self.state.lock().images.push(url.to_string());
	}

	fn load_script(&self, url: &str) -> BoxFuture<'static, Result<HttpResponse>> {
		let response = self.response_for(url);
		self.state.lock().scripts.push(url.to_string());
		Box::pin(future::ready(Ok(response)))
	}
}

/// Lets spawned delivery tasks run to completion.
pub async fn settle() {
	for _ in 0..20 {
		tokio::task::yield_now().await;
	}
}
