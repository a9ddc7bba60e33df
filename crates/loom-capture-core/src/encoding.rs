// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire encoding: `data=<base64(JSON(payload))>`.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Serializes `payload` to JSON and base64-encodes the UTF-8 bytes.
pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
	let json = serde_json::to_vec(payload)?;
	Ok(STANDARD.encode(json))
}

/// Reverses [`encode_payload`].
pub fn decode_payload<T: DeserializeOwned>(encoded: &str) -> Result<T> {
	let bytes = STANDARD.decode(encoded.trim())?;
	Ok(serde_json::from_slice(&bytes)?)
}

/// Builds the form body submitted by POST and beacon deliveries.
///
/// The encoded payload is placed verbatim after `data=`; receivers decode the
/// base64 alphabet as-is.
pub fn form_body(encoded: &str) -> String {
	format!("data={encoded}")
}
