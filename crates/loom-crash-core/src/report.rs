// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery envelopes sent to the collector.

use serde::{Deserialize, Serialize};

use crate::event::{ContextMap, Event};
use crate::session::Session;

/// Wire payload version sent with every report.
pub const PAYLOAD_VERSION: &str = "4.0";

/// Identity of the SDK that produced a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notifier {
	pub name: String,
	pub version: String,
	pub url: String,
}

impl Notifier {
	pub fn new(name: impl Into<String>, version: impl Into<String>, url: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			version: version.into(),
			url: url.into(),
		}
	}
}

/// Envelope wrapping one or more events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
	pub api_key: String,
	pub payload_version: String,
	pub notifier: Notifier,
	pub events: Vec<Event>,
}

impl Report {
	pub fn new(api_key: impl Into<String>, notifier: Notifier, events: Vec<Event>) -> Self {
		Self {
			api_key: api_key.into(),
			payload_version: PAYLOAD_VERSION.to_string(),
			notifier,
			events,
		}
	}

	/// Wraps a single event.
	pub fn single(api_key: impl Into<String>, notifier: Notifier, event: Event) -> Self {
		Self::new(api_key, notifier, vec![event])
	}
}

/// Envelope posted to the sessions endpoint when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
	pub notifier: Notifier,
	#[serde(default)]
	pub app: ContextMap,
	#[serde(default)]
	pub device: ContextMap,
	pub sessions: Vec<Session>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::{Exception, SeverityReason, Stacktrace};

	fn notifier() -> Notifier {
		Notifier::new("loom-crash-rust", "0.1.0", "https://loom.invalid")
	}

	#[test]
	fn report_wire_shape() {
		let event = Event::new(
			vec![Exception::new("Panic", "boom", Stacktrace::default())],
			SeverityReason::UnhandledPanic,
		);
		let report = Report::single("abc123", notifier(), event);
		let json = serde_json::to_value(&report).unwrap();

		assert_eq!(json["apiKey"], "abc123");
		assert_eq!(json["payloadVersion"], PAYLOAD_VERSION);
		assert_eq!(json["notifier"]["name"], "loom-crash-rust");
		assert_eq!(json["events"][0]["exceptions"][0]["errorClass"], "Panic");
		assert_eq!(json["events"][0]["severityReason"], "unhandledPanic");
	}

	#[test]
	fn session_report_shape() {
		let report = SessionReport {
			notifier: notifier(),
			app: ContextMap::new(),
			device: ContextMap::new(),
			sessions: vec![Session::new(true)],
		};
		let json = serde_json::to_value(&report).unwrap();
		assert_eq!(json["sessions"].as_array().map(Vec::len), Some(1));
	}
}
