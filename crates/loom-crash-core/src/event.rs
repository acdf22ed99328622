// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::breadcrumb::Breadcrumb;
use crate::error::CrashError;
use crate::metadata::Metadata;
use crate::session::Session;
use crate::user::User;

/// Opaque app/device snapshot supplied by a context provider.
pub type ContextMap = Map<String, Value>;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for EventId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for EventId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Info,
	Warning,
	Error,
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Info => write!(f, "info"),
			Self::Warning => write!(f, "warning"),
			Self::Error => write!(f, "error"),
		}
	}
}

impl FromStr for Severity {
	type Err = CrashError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"info" => Ok(Self::Info),
			"warning" => Ok(Self::Warning),
			"error" => Ok(Self::Error),
			_ => Err(CrashError::InvalidSeverity(s.to_string())),
		}
	}
}

/// Why an event carries its severity and handled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeverityReason {
	/// Reported through `notify`.
	HandledError,
	/// Caught by the panic hook.
	UnhandledPanic,
	/// Recorded by the native fault handler.
	Signal,
	/// Severity changed by an on-error callback.
	UserCallbackSetSeverity,
}

impl SeverityReason {
	/// Default handled state and severity for this reason.
	pub fn defaults(self) -> (bool, Severity) {
		match self {
			Self::HandledError => (false, Severity::Warning),
			Self::UnhandledPanic | Self::Signal => (true, Severity::Error),
			Self::UserCallbackSetSeverity => (false, Severity::Warning),
		}
	}
}

impl fmt::Display for SeverityReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::HandledError => write!(f, "handledError"),
			Self::UnhandledPanic => write!(f, "unhandledPanic"),
			Self::Signal => write!(f, "signal"),
			Self::UserCallbackSetSeverity => write!(f, "userCallbackSetSeverity"),
		}
	}
}

impl FromStr for SeverityReason {
	type Err = CrashError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"handledError" => Ok(Self::HandledError),
			"unhandledPanic" => Ok(Self::UnhandledPanic),
			"signal" => Ok(Self::Signal),
			"userCallbackSetSeverity" => Ok(Self::UserCallbackSetSeverity),
			_ => Err(CrashError::InvalidSeverityReason(s.to_string())),
		}
	}
}

/// One error in an event: the top-level error or one of its causes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exception {
	pub error_class: String,
	pub message: String,
	#[serde(default)]
	pub stacktrace: Stacktrace,
}

impl Exception {
	pub fn new(error_class: impl Into<String>, message: impl Into<String>, stacktrace: Stacktrace) -> Self {
		Self {
			error_class: error_class.into(),
			message: message.into(),
			stacktrace,
		}
	}
}

/// Stack trace containing multiple frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stacktrace {
	pub frames: Vec<Frame>,
}

/// A single stack frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
	/// Function/method name
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function: Option<String>,
	/// Module/crate/package
	#[serde(skip_serializing_if = "Option::is_none")]
	pub module: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub line_number: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub column_number: Option<u32>,
	/// User code vs dependency
	#[serde(default)]
	pub in_project: bool,
	/// For native code
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frame_address: Option<String>,
}

/// A single reported occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
	pub id: EventId,
	pub timestamp: DateTime<Utc>,
	pub unhandled: bool,
	pub severity: Severity,
	pub severity_reason: SeverityReason,
	/// Top-level error first, followed by its chained causes.
	pub exceptions: Vec<Exception>,
	#[serde(default)]
	pub metadata: Metadata,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session: Option<Session>,
	#[serde(default)]
	pub app: ContextMap,
	#[serde(default)]
	pub device: ContextMap,
	#[serde(default)]
	pub user: User,
	/// Oldest first.
	#[serde(default)]
	pub breadcrumbs: Vec<Breadcrumb>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub context: Option<String>,
	pub release_stage: String,
}

impl Event {
	/// Creates an event whose handled state and severity follow `reason`.
	pub fn new(exceptions: Vec<Exception>, reason: SeverityReason) -> Self {
		let (unhandled, severity) = reason.defaults();
		Self {
			id: EventId::new(),
			timestamp: Utc::now(),
			unhandled,
			severity,
			severity_reason: reason,
			exceptions,
			metadata: Metadata::new(),
			session: None,
			app: ContextMap::new(),
			device: ContextMap::new(),
			user: User::default(),
			breadcrumbs: Vec::new(),
			context: None,
			release_stage: "production".to_string(),
		}
	}

	/// Changes the severity and records that a callback chose it.
	pub fn set_severity(&mut self, severity: Severity) {
		if self.severity != severity {
			self.severity = severity;
			self.severity_reason = SeverityReason::UserCallbackSetSeverity;
		}
	}

	/// Class of the top-level error, if any.
	pub fn error_class(&self) -> Option<&str> {
		self.exceptions.first().map(|e| e.error_class.as_str())
	}

	/// Message of the top-level error, if any.
	pub fn error_message(&self) -> Option<&str> {
		self.exceptions.first().map(|e| e.message.as_str())
	}

	pub fn add_metadata(&mut self, section: &str, key: &str, value: impl Into<Value>) {
		self.metadata.add(section, key, value);
	}

	pub fn clear_metadata(&mut self, section: &str, key: &str) {
		self.metadata.clear(section, key);
	}
}
