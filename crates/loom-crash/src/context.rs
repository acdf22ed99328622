// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Instant;

use chrono::Utc;
use loom_crash_core::ContextMap;
use serde_json::{json, Value};

/// Supplies the app and device snapshots attached to every event and
/// session report.
pub trait ContextProvider: Send + Sync {
	fn app(&self) -> ContextMap;

	fn device(&self) -> ContextMap;

	/// Name of the screen or view the user is on, used as the default event
	/// context when none is set.
	fn active_screen(&self) -> Option<String> {
		None
	}
}

/// Process and host facts available from the standard library.
pub struct DefaultContextProvider {
	release_stage: String,
	app_version: Option<String>,
	started: Instant,
}

impl DefaultContextProvider {
	pub fn new(release_stage: impl Into<String>, app_version: Option<String>) -> Self {
		Self {
			release_stage: release_stage.into(),
			app_version,
			started: Instant::now(),
		}
	}
}

impl ContextProvider for DefaultContextProvider {
	fn app(&self) -> ContextMap {
		let mut app = ContextMap::new();
		let exe = std::env::current_exe()
			.ok()
			.and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()));
		if let Some(id) = exe {
			app.insert("id".to_string(), Value::from(id));
		}
		if let Some(version) = &self.app_version {
			app.insert("version".to_string(), Value::from(version.clone()));
		}
		app.insert("releaseStage".to_string(), Value::from(self.release_stage.clone()));
		app.insert("type".to_string(), Value::from("rust"));
		app.insert("binaryArch".to_string(), Value::from(std::env::consts::ARCH));
		app.insert(
			"duration".to_string(),
			Value::from(self.started.elapsed().as_millis() as u64),
		);
		app
	}

	fn device(&self) -> ContextMap {
		let mut device = ContextMap::new();
		device.insert("osName".to_string(), Value::from(std::env::consts::OS));
		device.insert("osFamily".to_string(), Value::from(std::env::consts::FAMILY));
		device.insert("cpuAbi".to_string(), json!([std::env::consts::ARCH]));
		device.insert("processId".to_string(), Value::from(std::process::id()));
		if let Ok(locale) = std::env::var("LANG") {
			device.insert("locale".to_string(), Value::from(locale));
		}
		device.insert("time".to_string(), Value::from(Utc::now().to_rfc3339()));
		device
	}
}
