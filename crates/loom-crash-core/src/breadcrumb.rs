// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Breadcrumb types (diagnostic markers leading up to an event).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::CrashError;

/// Maximum length of a breadcrumb message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 140;

/// A timestamped marker recorded before an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
	pub timestamp: DateTime<Utc>,
	/// Bounded to [`MAX_MESSAGE_LEN`] bytes.
	#[serde(rename = "name")]
	pub message: String,
	#[serde(rename = "type")]
	pub kind: BreadcrumbType,
	#[serde(default)]
	pub metadata: Map<String, Value>,
}

impl Breadcrumb {
	/// Creates a breadcrumb stamped with the current time.
	pub fn new(message: impl Into<String>, kind: BreadcrumbType, metadata: Map<String, Value>) -> Self {
		Self {
			timestamp: Utc::now(),
			message: truncate(&message.into(), MAX_MESSAGE_LEN),
			kind,
			metadata,
		}
	}

	/// Creates a manual breadcrumb with no metadata.
	pub fn manual(message: impl Into<String>) -> Self {
		Self::new(message, BreadcrumbType::Manual, Map::new())
	}
}

impl Default for Breadcrumb {
	fn default() -> Self {
		Self::manual(String::new())
	}
}

/// Category of a breadcrumb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreadcrumbType {
	Manual,
	Error,
	Navigation,
	Request,
	Process,
	Log,
	State,
	User,
}

impl BreadcrumbType {
	pub const ALL: [BreadcrumbType; 8] = [
		Self::Manual,
		Self::Error,
		Self::Navigation,
		Self::Request,
		Self::Process,
		Self::Log,
		Self::State,
		Self::User,
	];

	/// Stable numeric code used by fixed-width encodings.
	pub fn code(self) -> u8 {
		match self {
			Self::Manual => 0,
			Self::Error => 1,
			Self::Navigation => 2,
			Self::Request => 3,
			Self::Process => 4,
			Self::Log => 5,
			Self::State => 6,
			Self::User => 7,
		}
	}

	/// Inverse of [`BreadcrumbType::code`]. Unknown codes map to `Manual`.
	pub fn from_code(code: u8) -> Self {
		Self::ALL
			.get(code as usize)
			.copied()
			.unwrap_or(Self::Manual)
	}
}

impl fmt::Display for BreadcrumbType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Manual => write!(f, "manual"),
			Self::Error => write!(f, "error"),
			Self::Navigation => write!(f, "navigation"),
			Self::Request => write!(f, "request"),
			Self::Process => write!(f, "process"),
			Self::Log => write!(f, "log"),
			Self::State => write!(f, "state"),
			Self::User => write!(f, "user"),
		}
	}
}

impl FromStr for BreadcrumbType {
	type Err = CrashError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"manual" => Ok(Self::Manual),
			"error" => Ok(Self::Error),
			"navigation" => Ok(Self::Navigation),
			"request" => Ok(Self::Request),
			"process" => Ok(Self::Process),
			"log" => Ok(Self::Log),
			"state" => Ok(Self::State),
			"user" => Ok(Self::User),
			_ => Err(CrashError::InvalidBreadcrumbType(s.to_string())),
		}
	}
}

/// Truncates a string to at most `max_len` bytes without splitting a character.
pub fn truncate(s: &str, max_len: usize) -> String {
	if s.len() <= max_len {
		return s.to_string();
	}
	let mut end = max_len;
	while !s.is_char_boundary(end) {
		end -= 1;
	}
	s[..end].to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn breadcrumb_type_roundtrip(kind in prop::sample::select(BreadcrumbType::ALL.to_vec())) {
			let parsed: BreadcrumbType = kind.to_string().parse().unwrap();
			prop_assert_eq!(kind, parsed);
			prop_assert_eq!(BreadcrumbType::from_code(kind.code()), kind);
		}

		#[test]
		fn truncate_respects_bound_and_char_boundaries(s in "\\PC{0,300}", max in 0usize..200) {
			let out = truncate(&s, max);
			prop_assert!(out.len() <= max);
			prop_assert!(s.starts_with(&out));
		}
	}

	#[test]
	fn message_is_bounded() {
		let crumb = Breadcrumb::manual("x".repeat(500));
		assert_eq!(crumb.message.len(), MAX_MESSAGE_LEN);
	}

	#[test]
	fn truncate_does_not_split_multibyte() {
		let s = "ééé";
		assert_eq!(truncate(s, 3), "é");
	}

	#[test]
	fn serializes_type_field() {
		let crumb = Breadcrumb::new("GET /users", BreadcrumbType::Request, Map::new());
		let json = serde_json::to_value(&crumb).unwrap();
		assert_eq!(json["type"], "request");
		assert_eq!(json["name"], "GET /users");
	}

	#[test]
	fn unknown_code_is_manual() {
		assert_eq!(BreadcrumbType::from_code(200), BreadcrumbType::Manual);
	}
}
