// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the crash SDK.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for crash operations.
pub type Result<T> = std::result::Result<T, CrashSdkError>;

/// Errors that can occur in the crash SDK.
#[derive(Debug, Error)]
pub enum CrashSdkError {
	/// Missing or empty API key.
	#[error("invalid API key")]
	InvalidApiKey,

	/// Endpoint is not an http(s) URL.
	#[error("invalid endpoint: {0}")]
	InvalidEndpoint(String),

	/// The global client slot is already occupied.
	#[error("global crash client is already initialized")]
	AlreadyInitialized,

	/// A secret file referenced by an environment variable could not be read.
	#[error("failed to read {var} from {path}: {source}")]
	SecretFile {
		var: String,
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// The background runtime could not be started.
	#[error("failed to start background workers: {0}")]
	RuntimeStart(#[source] std::io::Error),

	#[error("storage error: {0}")]
	Store(#[from] StoreError),

	#[error("delivery error: {0}")]
	Delivery(#[from] DeliveryError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

/// Errors raised by the on-disk event store.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("I/O error at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("corrupt event record {path}: {source}")]
	Corrupt {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed to serialize event: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl StoreError {
	pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}
}

/// Errors raised while posting a payload to the collector.
#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("HTTP request failed: {0}")]
	Request(#[from] reqwest::Error),

	#[error("collector returned status {0}")]
	Status(u16),

	#[error("failed to serialize payload: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
	/// Returns true if a later attempt may succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			// Connect, timeout and other transport failures.
			Self::Request(_) => true,
			Self::Status(status) => is_retryable_status(*status),
			Self::Serialization(_) => false,
		}
	}
}

/// 408, 429 and 5xx are worth retrying later.
pub fn is_retryable_status(status: u16) -> bool {
	matches!(status, 408 | 429) || (500..600).contains(&status)
}
