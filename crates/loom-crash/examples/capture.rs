// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: report a handled error, track a session and queue offline.
//!
//! Run with:
//!   LOOM_CRASH_API_KEY=... LOOM_CRASH_ENDPOINT=https://... \
//!     RUST_LOG=loom_crash=debug cargo run --example capture -p loom-crash

use std::time::Duration;

use loom_crash::{BreadcrumbType, CrashClientBuilder};
use serde_json::{json, Map};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct ConfigError {
	source: std::io::Error,
}

impl std::fmt::Display for ConfigError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "failed to load settings")
	}
}

impl std::error::Error for ConfigError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		Some(&self.source)
	}
}

fn load_settings() -> Result<String, ConfigError> {
	std::fs::read_to_string("/nonexistent/settings.toml").map_err(|source| ConfigError { source })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let client = CrashClientBuilder::from_env()?
		.app_version(env!("CARGO_PKG_VERSION"))
		.release_stage("development")
		.native_crashes(true)
		.build()?;

	println!("Storage: {}", client.config().resolved_storage_dir().display());
	println!("Queued from earlier runs: {}", client.stored_event_count());

	client.set_user(
		Some("user_example_123".to_string()),
		Some("example@example.com".to_string()),
		Some("Example User".to_string()),
	);
	client.set_context(Some("Settings".to_string()));
	client.add_metadata("example", "rust_version", "1.75.0");

	let mut metadata = Map::new();
	metadata.insert("route".to_string(), json!("/settings"));
	client.leave_breadcrumb_with("Opened settings", BreadcrumbType::Navigation, metadata);

	client.add_on_error(|event| {
		event.add_metadata("example", "callback", true);
		true
	});

	if let Some(session) = client.start_session() {
		println!("Session: {}", session.id);
	}

	if let Err(err) = load_settings() {
		println!("Reporting: {err}");
		client.notify(&err);
	}

	if !client.flush(Duration::from_secs(10)) {
		println!("Delivery still in progress; pending events stay on disk");
	}
	println!("Queued after flush: {}", client.stored_event_count());

	client.close();
	Ok(())
}
