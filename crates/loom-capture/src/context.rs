// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Contextual properties supplied by the host environment.

use serde_json::{Map, Value};

/// Library name reported in `$lib`.
pub const LIB_NAME: &str = "loom-capture-rust";
/// Library version reported in `$lib_version`.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agents of crawlers whose events are never captured.
const BLOCKED_USER_AGENTS: &[&str] = &[
	"google web preview",
	"baiduspider",
	"yandexbot",
	"bingbot",
	"googlebot",
	"yahoo! slurp",
];

/// Supplies device, page and library metadata for captured events.
///
/// Context properties have the lowest priority: super properties and caller
/// properties override them.
pub trait ContextProvider: Send + Sync {
	/// Properties merged into every event.
	fn event_properties(&self) -> Map<String, Value>;

	/// Properties merged into every people `set`.
	fn people_properties(&self) -> Map<String, Value> {
		Map::new()
	}

	/// The referring url of the current page, if any.
	fn referrer(&self) -> Option<String> {
		None
	}

	/// The url of the current page, if any.
	fn current_url(&self) -> Option<String> {
		None
	}

	/// The host user agent, if known.
	fn user_agent(&self) -> Option<String> {
		None
	}
}

/// A context that reports fixed values.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
	current_url: Option<String>,
	referrer: Option<String>,
	user_agent: Option<String>,
	extra: Map<String, Value>,
}

impl StaticContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn current_url(mut self, url: impl Into<String>) -> Self {
		self.current_url = Some(url.into());
		self
	}

	pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
		self.referrer = Some(referrer.into());
		self
	}

	pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = Some(user_agent.into());
		self
	}

	/// Adds a property reported with every event.
	pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.extra.insert(key.into(), value.into());
		self
	}

	fn library_properties() -> Map<String, Value> {
		let mut props = Map::new();
		props.insert("$lib".to_string(), Value::from(LIB_NAME));
		props.insert("$lib_version".to_string(), Value::from(LIB_VERSION));
		props.insert("$os".to_string(), Value::from(std::env::consts::OS));
		props
	}
}

impl ContextProvider for StaticContext {
	fn event_properties(&self) -> Map<String, Value> {
		let mut props = Self::library_properties();
		if let Some(url) = &self.current_url {
			props.insert("$current_url".to_string(), Value::from(url.as_str()));
			if let Ok(parsed) = url::Url::parse(url) {
				if let Some(host) = parsed.host_str() {
					props.insert("$host".to_string(), Value::from(host));
				}
				props.insert("$pathname".to_string(), Value::from(parsed.path()));
			}
		}
		if let Some(referrer) = &self.referrer {
			props.insert("$referrer".to_string(), Value::from(referrer.as_str()));
		}
		props.extend(self.extra.clone());
		props
	}

	fn people_properties(&self) -> Map<String, Value> {
		let mut props = Map::new();
		props.insert("$os".to_string(), Value::from(std::env::consts::OS));
		props.insert("$lib_version".to_string(), Value::from(LIB_VERSION));
		props
	}

	fn referrer(&self) -> Option<String> {
		self.referrer.clone()
	}

	fn current_url(&self) -> Option<String> {
		self.current_url.clone()
	}

	fn user_agent(&self) -> Option<String> {
		self.user_agent.clone()
	}
}

/// Returns true for crawler user agents whose events are dropped.
pub fn is_blocked_user_agent(user_agent: &str) -> bool {
	let ua = user_agent.to_lowercase();
	BLOCKED_USER_AGENTS.iter().any(|blocked| ua.contains(blocked))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn static_context_reports_library_and_page() {
		let ctx = StaticContext::new()
			.current_url("https://app.example.com/settings?tab=1")
			.referrer("https://www.google.com/search?q=loom")
			.property("$browser", "Firefox");
		let props = ctx.event_properties();
		assert_eq!(props["$lib"], LIB_NAME);
		assert_eq!(props["$host"], "app.example.com");
		assert_eq!(props["$pathname"], "/settings");
		assert_eq!(props["$browser"], "Firefox");
		assert_eq!(props["$referrer"], "https://www.google.com/search?q=loom");
	}

	#[test]
	fn unparseable_url_still_reported() {
		let props = StaticContext::new().current_url("not a url").event_properties();
		assert_eq!(props["$current_url"], "not a url");
		assert!(!props.contains_key("$host"));
	}

	#[test]
	fn crawlers_are_blocked() {
		assert!(is_blocked_user_agent(
			"Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
		));
		assert!(is_blocked_user_agent("Mozilla/5.0 (compatible; Yahoo! Slurp)"));
		assert!(is_blocked_user_agent("Mozilla/5.0 (compatible; bingbot/2.0)"));
		assert!(!is_blocked_user_agent(
			"Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0"
		));
	}
}
