// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use loom_capture_core::{StorageMedium, DEFAULT_CONSENT_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::BatchConfig;
use crate::error::Result;
use crate::transport::{RequestMethod, TransportKind};

/// Default collection endpoint.
pub const DEFAULT_API_HOST: &str = "https://t.loom.dev";

/// Configuration for a capture client.
///
/// Every field has a default, so partial TOML documents are accepted:
///
/// ```
/// use loom_capture::CaptureConfig;
///
/// let config = CaptureConfig::from_toml_str(r#"
/// api_host = "https://collect.example.com"
/// request_batching = false
/// "#).unwrap();
/// assert!(!config.request_batching);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
	pub api_host: String,
	pub api_method: RequestMethod,
	pub api_transport: TransportKind,
	/// Queue default-path events and send them in batches.
	pub request_batching: bool,
	pub batch_poll_interval_ms: u64,
	/// Consecutive empty polls after which the poller goes idle.
	pub batch_max_empty_polls: u32,
	/// Ask the server to record the client IP.
	pub ip: bool,
	pub test: bool,
	pub verbose: bool,
	/// Deliver through image-pixel requests; no delivery status is available.
	pub img: bool,
	pub debug: bool,
	pub save_referrer: bool,
	pub store_google: bool,
	pub capture_pageview: bool,
	/// Property names removed from every event. Must be an array of strings.
	pub property_blacklist: Value,
	pub xhr_headers: BTreeMap<String, String>,
	pub disable_persistence: bool,
	pub opt_out_capturing_by_default: bool,
	pub opt_out_persistence_by_default: bool,
	pub opt_out_capturing_persistence_type: StorageMedium,
	pub opt_out_capturing_cookie_prefix: Option<String>,
	/// Maximum commands held for an instance that is not yet initialized.
	pub startup_buffer_capacity: usize,
	pub request_timeout_secs: u64,
}

impl Default for CaptureConfig {
	fn default() -> Self {
		Self {
			api_host: DEFAULT_API_HOST.to_string(),
			api_method: RequestMethod::Post,
			api_transport: TransportKind::Standard,
			request_batching: true,
			batch_poll_interval_ms: 3000,
			batch_max_empty_polls: 5,
			ip: true,
			test: false,
			verbose: false,
			img: false,
			debug: false,
			save_referrer: true,
			store_google: true,
			capture_pageview: true,
			property_blacklist: Value::Array(Vec::new()),
			xhr_headers: BTreeMap::new(),
			disable_persistence: false,
			opt_out_capturing_by_default: false,
			opt_out_persistence_by_default: false,
			opt_out_capturing_persistence_type: StorageMedium::Local,
			opt_out_capturing_cookie_prefix: None,
			startup_buffer_capacity: 1000,
			request_timeout_secs: 30,
		}
	}
}

impl CaptureConfig {
	/// Parses a TOML document, filling unspecified fields with defaults.
	pub fn from_toml_str(s: &str) -> Result<Self> {
		Ok(toml::from_str(s)?)
	}

	/// Batching parameters derived from this config.
	pub fn batch_config(&self) -> BatchConfig {
		BatchConfig {
			poll_interval: Duration::from_millis(self.batch_poll_interval_ms),
			max_empty_polls: self.batch_max_empty_polls,
		}
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	/// Prefix for consent storage keys.
	pub fn consent_prefix(&self) -> &str {
		self
			.opt_out_capturing_cookie_prefix
			.as_deref()
			.unwrap_or(DEFAULT_CONSENT_PREFIX)
	}

	pub(crate) fn events_url(&self) -> String {
		format!("{}/e/", self.api_host.trim_end_matches('/'))
	}

	pub(crate) fn engage_url(&self) -> String {
		format!("{}/engage/", self.api_host.trim_end_matches('/'))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let config = CaptureConfig::default();
		assert!(config.request_batching);
		assert_eq!(config.batch_poll_interval_ms, 3000);
		assert_eq!(config.batch_max_empty_polls, 5);
		assert_eq!(config.api_method, RequestMethod::Post);
		assert_eq!(config.api_transport, TransportKind::Standard);
		assert!(config.ip);
		assert!(config.property_blacklist.is_array());
		assert_eq!(config.opt_out_capturing_persistence_type, StorageMedium::Local);
	}

	#[test]
	fn partial_toml_keeps_defaults() {
		let config = CaptureConfig::from_toml_str(
			r#"
api_host = "https://collect.example.com/"
verbose = true
property_blacklist = ["$current_url"]
"#,
		)
		.unwrap();
		assert!(config.verbose);
		assert!(config.request_batching);
		assert_eq!(config.events_url(), "https://collect.example.com/e/");
		assert_eq!(config.engage_url(), "https://collect.example.com/engage/");
		assert_eq!(config.property_blacklist, serde_json::json!(["$current_url"]));
	}

	#[test]
	fn invalid_toml_is_reported() {
		let result = CaptureConfig::from_toml_str("request_batching = \"sometimes\"");
		assert!(result.is_err());
	}

	#[test]
	fn consent_prefix_falls_back_to_default() {
		let mut config = CaptureConfig::default();
		assert_eq!(config.consent_prefix(), DEFAULT_CONSENT_PREFIX);
		config.opt_out_capturing_cookie_prefix = Some("__custom_".to_string());
		assert_eq!(config.consent_prefix(), "__custom_");
	}

	#[test]
	fn batch_config_uses_interval() {
		let mut config = CaptureConfig::default();
		config.batch_poll_interval_ms = 50;
		assert_eq!(config.batch_config().poll_interval, Duration::from_millis(50));
	}
}
