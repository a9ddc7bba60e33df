// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Referrer, campaign and search-keyword properties derived from URLs.

use serde_json::{Map, Value};
use url::Url;

/// Campaign query parameters copied onto events.
pub const CAMPAIGN_KEYWORDS: &[&str] = &[
	"utm_source",
	"utm_medium",
	"utm_campaign",
	"utm_content",
	"utm_term",
];

/// Value used when there is no referrer.
pub const DIRECT: &str = "$direct";

/// Extracts `utm_*` parameters from the current page URL.
pub fn campaign_params(current_url: &str) -> Map<String, Value> {
	let mut params = Map::new();
	let Ok(url) = Url::parse(current_url) else {
		return params;
	};
	for (k, v) in url.query_pairs() {
		if CAMPAIGN_KEYWORDS.contains(&&*k) && !params.contains_key(&*k) {
			params.insert(k.into_owned(), Value::String(v.into_owned()));
		}
	}
	params
}

/// Returns the search engine a referrer belongs to, if any.
pub fn search_engine(referrer: &str) -> Option<&'static str> {
	let host = Url::parse(referrer).ok()?.host_str()?.to_ascii_lowercase();
	let labels: Vec<&str> = host.split('.').collect();
	let has = |name: &str| labels.iter().any(|l| *l == name);
	if has("google") {
		Some("google")
	} else if has("bing") {
		Some("bing")
	} else if has("yahoo") {
		Some("yahoo")
	} else if has("duckduckgo") {
		Some("duckduckgo")
	} else {
		None
	}
}

/// Search engine and keyword for a search-engine referrer.
pub fn search_info(referrer: &str) -> Map<String, Value> {
	let mut info = Map::new();
	let Some(engine) = search_engine(referrer) else {
		return info;
	};
	info.insert("$search_engine".to_string(), Value::String(engine.to_string()));

	let param = if engine == "yahoo" { "p" } else { "q" };
	if let Ok(url) = Url::parse(referrer) {
		if let Some((_, keyword)) = url.query_pairs().find(|(k, _)| k == param) {
			info.insert("ph_keyword".to_string(), Value::String(keyword.into_owned()));
		}
	}
	info
}

/// Initial referrer and referring domain, defaulting to `$direct`.
pub fn referrer_info(referrer: &str) -> Map<String, Value> {
	let mut info = Map::new();
	let referrer = referrer.trim();
	let (value, domain) = if referrer.is_empty() {
		(DIRECT.to_string(), DIRECT.to_string())
	} else {
		let domain = Url::parse(referrer)
			.ok()
			.and_then(|u| u.host_str().map(str::to_string))
			.unwrap_or_else(|| DIRECT.to_string());
		(referrer.to_string(), domain)
	};
	info.insert("$initial_referrer".to_string(), Value::String(value));
	info.insert("$initial_referring_domain".to_string(), Value::String(domain));
	info
}
