// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Outbound event batching.
//!
//! Default-path events are queued here and sent once per batching window as
//! one array payload per destination url. The poller stops itself after a
//! run of empty windows and restarts on the next enqueue.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loom_capture_core::{encode_payload, BatchedEvent, EventEnvelope};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::transport::{Transport, TransportOptions};

/// Configuration for the outbound batch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
	/// Interval between polls of the queue.
	pub poll_interval: Duration,
	/// Consecutive empty polls after which the poller stops.
	pub max_empty_polls: u32,
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_millis(3000),
			max_empty_polls: 5,
		}
	}
}

/// An event waiting for the next batch.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
	pub url: String,
	pub data: EventEnvelope,
	pub options: TransportOptions,
}

/// One url's worth of queued events, encoded as a single array payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGroup {
	pub url: String,
	pub encoded: String,
	pub count: usize,
}

#[derive(Default)]
struct QueueState {
	queue: Vec<QueuedRequest>,
	empty_polls: u32,
	polling: bool,
	/// Set by [`BatchQueue::cancel`]; no poller is started afterwards.
	halted: bool,
	poller: Option<JoinHandle<()>>,
}

/// The outbound batch queue.
pub struct BatchQueue {
	config: BatchConfig,
	transport: Arc<Transport>,
	runtime: Handle,
	state: Mutex<QueueState>,
}

impl BatchQueue {
	pub fn new(config: BatchConfig, transport: Arc<Transport>, runtime: Handle) -> Arc<Self> {
		Arc::new(Self {
			config,
			transport,
			runtime,
			state: Mutex::new(QueueState::default()),
		})
	}

	/// Appends a request and starts the poller if it is idle.
	pub fn enqueue(self: &Arc<Self>, request: QueuedRequest) {
		let mut state = self.state.lock();
		state.queue.push(request);
		if !state.polling && !state.halted {
			self.start_poller(&mut state);
		}
	}

	/// Starts the poller if it is idle.
	pub fn start(self: &Arc<Self>) {
		let mut state = self.state.lock();
		if !state.polling && !state.halted {
			self.start_poller(&mut state);
		}
	}

	fn start_poller(self: &Arc<Self>, state: &mut QueueState) {
		debug!(
			poll_interval_ms = self.config.poll_interval.as_millis() as u64,
			"Starting batch poller"
		);
		state.polling = true;
		state.empty_polls = 0;
		let weak: Weak<Self> = Arc::downgrade(self);
		let interval = self.config.poll_interval;
		state.poller = Some(self.runtime.spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				let Some(queue) = weak.upgrade() else {
					break;
				};
				if !queue.tick() {
					break;
				}
			}
		}));
	}

	/// Runs one poll cycle. Returns false once the poller should stop.
	pub fn tick(&self) -> bool {
		let requests = {
			let mut state = self.state.lock();
			if state.halted {
				return false;
			}
			if state.queue.is_empty() {
				state.empty_polls += 1;
				if state.empty_polls >= self.config.max_empty_polls {
					debug!(empty_polls = state.empty_polls, "Batch queue idle, stopping poller");
					state.empty_polls = 0;
					state.polling = false;
					state.poller = None;
					return false;
				}
				return true;
			}
			state.empty_polls = 0;
			std::mem::take(&mut state.queue)
		};

		for group in build_groups(requests, Utc::now()) {
			debug!(url = %group.url, count = group.count, "Sending event batch");
			self
				.transport
				.send(&group.url, group.encoded, &TransportOptions::default(), None);
		}
		true
	}

	/// Stops the poller for good.
	pub fn cancel(&self) {
		let mut state = self.state.lock();
		state.halted = true;
		state.polling = false;
		if let Some(poller) = state.poller.take() {
			poller.abort();
		}
		info!("Batch poller cancelled");
	}

	/// Empties the queue and returns its contents grouped and encoded.
	pub fn drain(&self) -> Vec<BatchGroup> {
		let requests = std::mem::take(&mut self.state.lock().queue);
		build_groups(requests, Utc::now())
	}

	pub fn len(&self) -> usize {
		self.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state.lock().queue.is_empty()
	}

	pub fn is_polling(&self) -> bool {
		self.state.lock().polling
	}
}

/// Groups requests by url in first-seen order, keeping insertion order
/// within each url, and encodes every group as one array.
fn build_groups(requests: Vec<QueuedRequest>, now: DateTime<Utc>) -> Vec<BatchGroup> {
	let mut grouped: Vec<(String, Vec<BatchedEvent>)> = Vec::new();
	for request in requests {
		let item = request.data.into_batched(now);
		match grouped.iter_mut().find(|(url, _)| *url == request.url) {
			Some((_, items)) => items.push(item),
			None => grouped.push((request.url, vec![item])),
		}
	}

	grouped
		.into_iter()
		.filter_map(|(url, items)| match encode_payload(&items) {
			Ok(encoded) => Some(BatchGroup {
				url,
				encoded,
				count: items.len(),
			}),
			Err(e) => {
				error!(error = %e, url = %url, "Failed to encode event batch");
				None
			}
		})
		.collect()
}
