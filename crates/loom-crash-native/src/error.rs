// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while preparing the native crash bridge.
#[derive(Debug, Error)]
pub enum NativeBridgeError {
	#[error("failed to map bridge file {path}: {source}")]
	Map {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("fatal signal handlers are already installed")]
	AlreadyInstalled,

	#[error("failed to install handler for signal {signal}: {source}")]
	Signal {
		signal: i32,
		#[source]
		source: std::io::Error,
	},

	#[error("native crash capture is not supported on this platform")]
	Unsupported,
}

pub type Result<T> = std::result::Result<T, NativeBridgeError>;
