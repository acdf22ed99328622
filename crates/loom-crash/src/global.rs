// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Optional process-wide client slot.
//!
//! Applications that prefer not to thread a [`CrashClient`] through their
//! code install one here at startup and fetch it with [`get`].

use std::sync::{PoisonError, RwLock};

use tracing::info;

use crate::client::CrashClient;
use crate::config::CrashClientBuilder;
use crate::error::{CrashSdkError, Result};

static GLOBAL: RwLock<Option<CrashClient>> = RwLock::new(None);

/// Builds a client from `builder` and installs it as the global client.
///
/// Fails with [`CrashSdkError::AlreadyInitialized`] if one is installed; the
/// builder is not consumed into a running client in that case.
pub fn init(builder: CrashClientBuilder) -> Result<CrashClient> {
	let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
	if slot.is_some() {
		return Err(CrashSdkError::AlreadyInitialized);
	}
	let client = builder.build()?;
	*slot = Some(client.clone());
	info!("global crash client installed");
	Ok(client)
}

/// Installs an already built client.
pub fn set(client: CrashClient) -> Result<()> {
	let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
	if slot.is_some() {
		return Err(CrashSdkError::AlreadyInitialized);
	}
	*slot = Some(client);
	Ok(())
}

pub fn get() -> Option<CrashClient> {
	GLOBAL.read().unwrap_or_else(PoisonError::into_inner).clone()
}

pub fn is_initialized() -> bool {
	GLOBAL.read().unwrap_or_else(PoisonError::into_inner).is_some()
}

/// Removes and closes the global client, returning whether one was set.
pub fn teardown() -> bool {
	let client = GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
	match client {
		Some(client) => {
			client.close();
			true
		}
		None => false,
	}
}
