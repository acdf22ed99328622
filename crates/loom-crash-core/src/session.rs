// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session snapshots used for stability scoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	#[must_use]
	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for SessionId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Handled/unhandled counts for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvents {
	pub handled: u32,
	pub unhandled: u32,
}

/// A tracked window of app usage.
///
/// Values are never mutated in place once shared: the increment methods
/// return a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
	pub id: SessionId,
	pub started_at: DateTime<Utc>,
	pub events: SessionEvents,
	/// System-initiated rather than started by the host application.
	#[serde(skip)]
	pub auto_captured: bool,
}

impl Session {
	#[must_use]
	pub fn new(auto_captured: bool) -> Self {
		Self {
			id: SessionId::new(),
			started_at: Utc::now(),
			events: SessionEvents::default(),
			auto_captured,
		}
	}

	#[must_use]
	pub fn increment_handled(&self) -> Self {
		let mut next = self.clone();
		next.events.handled = next.events.handled.saturating_add(1);
		next
	}

	#[must_use]
	pub fn increment_unhandled(&self) -> Self {
		let mut next = self.clone();
		next.events.unhandled = next.events.unhandled.saturating_add(1);
		next
	}

	/// Increments the counter matching `unhandled`.
	#[must_use]
	pub fn increment(&self, unhandled: bool) -> Self {
		if unhandled {
			self.increment_unhandled()
		} else {
			self.increment_handled()
		}
	}
}
