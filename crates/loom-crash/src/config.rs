// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration and builder.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use loom_crash_core::BreadcrumbType;
use sha2::{Digest, Sha256};

use crate::client::CrashClient;
use crate::context::ContextProvider;
use crate::delivery::Delivery;
use crate::error::{CrashSdkError, Result};
use crate::session::PausedSessionPolicy;

pub const DEFAULT_ENDPOINT: &str = "https://notify.loom.invalid";
pub const DEFAULT_SESSIONS_ENDPOINT: &str = "https://sessions.loom.invalid";
pub const DEFAULT_RELEASE_STAGE: &str = "production";
pub const DEFAULT_MAX_BREADCRUMBS: usize = 25;
pub const DEFAULT_MAX_PERSISTED_EVENTS: usize = 32;

pub const ENV_API_KEY: &str = "LOOM_CRASH_API_KEY";
pub const ENV_ENDPOINT: &str = "LOOM_CRASH_ENDPOINT";
pub const ENV_SESSIONS_ENDPOINT: &str = "LOOM_CRASH_SESSIONS_ENDPOINT";
pub const ENV_RELEASE_STAGE: &str = "LOOM_CRASH_RELEASE_STAGE";
pub const ENV_APP_VERSION: &str = "LOOM_CRASH_APP_VERSION";
pub const ENV_STORAGE_DIR: &str = "LOOM_CRASH_STORAGE_DIR";

/// Configuration for the crash client.
#[derive(Clone)]
pub struct ClientConfig {
	pub api_key: String,
	pub endpoint: String,
	pub sessions_endpoint: String,
	pub release_stage: String,
	/// `None` notifies from every stage.
	pub enabled_release_stages: Option<HashSet<String>>,
	pub app_version: Option<String>,
	pub max_breadcrumbs: usize,
	/// `None` records every type.
	pub enabled_breadcrumb_types: Option<HashSet<BreadcrumbType>>,
	pub max_persisted_events: usize,
	/// Error classes dropped before any processing.
	pub discard_classes: HashSet<String>,
	pub auto_track_sessions: bool,
	pub paused_session_policy: PausedSessionPolicy,
	pub persist_user: bool,
	/// Installs the panic hook.
	pub auto_detect_errors: bool,
	/// Maps the native bridge and installs fatal signal handlers.
	pub native_crashes: bool,
	/// Defaults to a per-api-key directory under the user cache dir.
	pub storage_dir: Option<PathBuf>,
	pub delivery_timeout: Duration,
	pub worker_threads: usize,
	pub queue_capacity: usize,
	pub launch_flush_timeout: Duration,
	/// Module prefixes treated as in-project when parsing backtraces.
	pub project_packages: Vec<String>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			api_key: String::new(),
			endpoint: DEFAULT_ENDPOINT.to_string(),
			sessions_endpoint: DEFAULT_SESSIONS_ENDPOINT.to_string(),
			release_stage: DEFAULT_RELEASE_STAGE.to_string(),
			enabled_release_stages: None,
			app_version: None,
			max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
			enabled_breadcrumb_types: None,
			max_persisted_events: DEFAULT_MAX_PERSISTED_EVENTS,
			discard_classes: HashSet::new(),
			auto_track_sessions: true,
			paused_session_policy: PausedSessionPolicy::default(),
			persist_user: true,
			auto_detect_errors: true,
			native_crashes: false,
			storage_dir: None,
			delivery_timeout: Duration::from_secs(30),
			worker_threads: 2,
			queue_capacity: 128,
			launch_flush_timeout: Duration::from_secs(2),
			project_packages: Vec::new(),
		}
	}
}

impl fmt::Debug for ClientConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientConfig")
			.field("api_key", &"[REDACTED]")
			.field("endpoint", &self.endpoint)
			.field("sessions_endpoint", &self.sessions_endpoint)
			.field("release_stage", &self.release_stage)
			.field("enabled_release_stages", &self.enabled_release_stages)
			.field("app_version", &self.app_version)
			.field("max_breadcrumbs", &self.max_breadcrumbs)
			.field("enabled_breadcrumb_types", &self.enabled_breadcrumb_types)
			.field("max_persisted_events", &self.max_persisted_events)
			.field("discard_classes", &self.discard_classes)
			.field("auto_track_sessions", &self.auto_track_sessions)
			.field("paused_session_policy", &self.paused_session_policy)
			.field("persist_user", &self.persist_user)
			.field("auto_detect_errors", &self.auto_detect_errors)
			.field("native_crashes", &self.native_crashes)
			.field("storage_dir", &self.storage_dir)
			.field("delivery_timeout", &self.delivery_timeout)
			.field("worker_threads", &self.worker_threads)
			.field("queue_capacity", &self.queue_capacity)
			.field("launch_flush_timeout", &self.launch_flush_timeout)
			.field("project_packages", &self.project_packages)
			.finish()
	}
}

impl ClientConfig {
	/// Defaults overlaid with `LOOM_CRASH_*` environment variables.
	///
	/// The api key may come from `LOOM_CRASH_API_KEY_FILE` (a single trailing
	/// newline is stripped), which takes precedence over `LOOM_CRASH_API_KEY`.
	pub fn from_env() -> Result<Self> {
		let mut config = Self::default();
		config.apply_env()?;
		Ok(config)
	}

	fn apply_env(&mut self) -> Result<()> {
		if let Some(key) = load_secret_env(ENV_API_KEY)? {
			self.api_key = key;
		}
		if let Some(endpoint) = non_empty_env(ENV_ENDPOINT) {
			self.endpoint = endpoint;
		}
		if let Some(endpoint) = non_empty_env(ENV_SESSIONS_ENDPOINT) {
			self.sessions_endpoint = endpoint;
		}
		if let Some(stage) = non_empty_env(ENV_RELEASE_STAGE) {
			self.release_stage = stage;
		}
		if let Some(version) = non_empty_env(ENV_APP_VERSION) {
			self.app_version = Some(version);
		}
		if let Some(dir) = non_empty_env(ENV_STORAGE_DIR) {
			self.storage_dir = Some(PathBuf::from(dir));
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		if self.api_key.trim().is_empty() {
			return Err(CrashSdkError::InvalidApiKey);
		}
		validate_endpoint(&self.endpoint)?;
		validate_endpoint(&self.sessions_endpoint)?;
		Ok(())
	}

	/// False when release-stage filtering excludes the current stage.
	pub fn should_notify_for_release_stage(&self) -> bool {
		match &self.enabled_release_stages {
			Some(stages) => stages.contains(&self.release_stage),
			None => true,
		}
	}

	pub fn should_discard_class(&self, error_class: &str) -> bool {
		self.discard_classes.contains(error_class)
	}

	pub fn should_record_breadcrumb_type(&self, kind: BreadcrumbType) -> bool {
		match &self.enabled_breadcrumb_types {
			Some(types) => types.contains(&kind),
			None => true,
		}
	}

	/// Directory holding queued events, the persisted user and the native
	/// bridge file.
	pub fn resolved_storage_dir(&self) -> PathBuf {
		if let Some(dir) = &self.storage_dir {
			return dir.clone();
		}
		let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
		base.join("loom-crash").join(api_key_digest(&self.api_key))
	}
}

fn api_key_digest(api_key: &str) -> String {
	let digest = Sha256::digest(api_key.as_bytes());
	hex::encode(&digest[..8])
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
	let url = reqwest::Url::parse(endpoint)
		.map_err(|_| CrashSdkError::InvalidEndpoint(endpoint.to_string()))?;
	match url.scheme() {
		"http" | "https" => Ok(()),
		_ => Err(CrashSdkError::InvalidEndpoint(endpoint.to_string())),
	}
}

fn non_empty_env(var: &str) -> Option<String> {
	std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Reads `VAR_FILE` if set, otherwise `VAR`.
fn load_secret_env(var: &str) -> Result<Option<String>> {
	let file_var = format!("{var}_FILE");
	if let Some(path) = non_empty_env(&file_var) {
		let path = PathBuf::from(path);
		let contents = std::fs::read_to_string(&path).map_err(|source| CrashSdkError::SecretFile {
			var: file_var.clone(),
			path: path.clone(),
			source,
		})?;
		let value = contents
			.strip_suffix('\n')
			.map(|s| s.strip_suffix('\r').unwrap_or(s))
			.unwrap_or(&contents);
		return Ok(Some(value.to_string()));
	}
	Ok(non_empty_env(var))
}

/// Builder for constructing a [`CrashClient`].
pub struct CrashClientBuilder {
	config: ClientConfig,
	delivery: Option<Arc<dyn Delivery>>,
	context_provider: Option<Arc<dyn ContextProvider>>,
}

impl CrashClientBuilder {
	/// Creates a new builder with default settings.
	pub fn new() -> Self {
		Self::with_config(ClientConfig::default())
	}

	pub fn with_config(config: ClientConfig) -> Self {
		Self {
			config,
			delivery: None,
			context_provider: None,
		}
	}

	/// Starts from [`ClientConfig::from_env`].
	pub fn from_env() -> Result<Self> {
		Ok(Self::with_config(ClientConfig::from_env()?))
	}

	pub fn api_key(mut self, key: impl Into<String>) -> Self {
		self.config.api_key = key.into();
		self
	}

	/// Sets the events endpoint.
	///
	/// Example: `https://notify.example.com`
	pub fn endpoint(mut self, url: impl Into<String>) -> Self {
		self.config.endpoint = url.into();
		self
	}

	pub fn sessions_endpoint(mut self, url: impl Into<String>) -> Self {
		self.config.sessions_endpoint = url.into();
		self
	}

	/// Sets the release stage.
	///
	/// Example: `production`, `staging`, `development`
	pub fn release_stage(mut self, stage: impl Into<String>) -> Self {
		self.config.release_stage = stage.into();
		self
	}

	pub fn enabled_release_stages<I, S>(mut self, stages: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.enabled_release_stages = Some(stages.into_iter().map(Into::into).collect());
		self
	}

	pub fn app_version(mut self, version: impl Into<String>) -> Self {
		self.config.app_version = Some(version.into());
		self
	}

	pub fn max_breadcrumbs(mut self, max: usize) -> Self {
		self.config.max_breadcrumbs = max;
		self
	}

	pub fn enabled_breadcrumb_types(mut self, types: impl IntoIterator<Item = BreadcrumbType>) -> Self {
		self.config.enabled_breadcrumb_types = Some(types.into_iter().collect());
		self
	}

	pub fn max_persisted_events(mut self, max: usize) -> Self {
		self.config.max_persisted_events = max;
		self
	}

	pub fn discard_classes<I, S>(mut self, classes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.discard_classes = classes.into_iter().map(Into::into).collect();
		self
	}

	/// Enables or disables automatic session tracking.
	///
	/// When enabled (default), a session starts when the client is built and
	/// again whenever the app returns to the foreground after at least 30
	/// seconds in the background.
	pub fn auto_track_sessions(mut self, enabled: bool) -> Self {
		self.config.auto_track_sessions = enabled;
		self
	}

	pub fn paused_session_policy(mut self, policy: PausedSessionPolicy) -> Self {
		self.config.paused_session_policy = policy;
		self
	}

	pub fn persist_user(mut self, enabled: bool) -> Self {
		self.config.persist_user = enabled;
		self
	}

	/// Enables or disables the panic hook (default: enabled).
	pub fn auto_detect_errors(mut self, enabled: bool) -> Self {
		self.config.auto_detect_errors = enabled;
		self
	}

	/// Enables native crash capture through fatal signal handlers.
	pub fn native_crashes(mut self, enabled: bool) -> Self {
		self.config.native_crashes = enabled;
		self
	}

	pub fn storage_dir(mut self, dir: impl AsRef<Path>) -> Self {
		self.config.storage_dir = Some(dir.as_ref().to_path_buf());
		self
	}

	/// Sets the HTTP request timeout.
	pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
		self.config.delivery_timeout = timeout;
		self
	}

	pub fn worker_threads(mut self, threads: usize) -> Self {
		self.config.worker_threads = threads.max(1);
		self
	}

	pub fn queue_capacity(mut self, capacity: usize) -> Self {
		self.config.queue_capacity = capacity.max(1);
		self
	}

	/// How long `build` waits for queued events from a previous run.
	pub fn launch_flush_timeout(mut self, timeout: Duration) -> Self {
		self.config.launch_flush_timeout = timeout;
		self
	}

	pub fn project_packages<I, S>(mut self, packages: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.project_packages = packages.into_iter().map(Into::into).collect();
		self
	}

	/// Replaces the HTTP transport.
	pub fn delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
		self.delivery = Some(delivery);
		self
	}

	/// Replaces the app/device metadata source.
	pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
		self.context_provider = Some(provider);
		self
	}

	pub fn config(&self) -> &ClientConfig {
		&self.config
	}

	/// Validates the configuration and starts the client.
	pub fn build(self) -> Result<CrashClient> {
		self.config.validate()?;
		CrashClient::start(self.config, self.delivery, self.context_provider)
	}
}

impl Default for CrashClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn defaults() {
		let config = ClientConfig::default();
		assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
		assert_eq!(config.release_stage, "production");
		assert_eq!(config.max_breadcrumbs, 25);
		assert_eq!(config.max_persisted_events, 32);
		assert!(config.auto_track_sessions);
		assert!(config.persist_user);
		assert!(!config.native_crashes);
		assert_eq!(config.delivery_timeout, Duration::from_secs(30));
		assert_eq!(config.paused_session_policy, PausedSessionPolicy::Ignore);
	}

	#[test]
	fn validate_requires_api_key() {
		let config = ClientConfig::default();
		assert!(matches!(config.validate(), Err(CrashSdkError::InvalidApiKey)));
	}

	#[test]
	fn validate_rejects_bad_endpoint() {
		let config = ClientConfig {
			api_key: "key".to_string(),
			endpoint: "ftp://example.com".to_string(),
			..Default::default()
		};
		assert!(matches!(config.validate(), Err(CrashSdkError::InvalidEndpoint(_))));

		let config = ClientConfig {
			api_key: "key".to_string(),
			sessions_endpoint: "not a url".to_string(),
			..Default::default()
		};
		assert!(matches!(config.validate(), Err(CrashSdkError::InvalidEndpoint(_))));
	}

	#[test]
	fn debug_redacts_api_key() {
		let config = ClientConfig {
			api_key: "super-secret-key".to_string(),
			..Default::default()
		};
		let debug = format!("{config:?}");
		assert!(!debug.contains("super-secret-key"));
		assert!(debug.contains("[REDACTED]"));
	}

	#[test]
	fn release_stage_filter() {
		let mut config = ClientConfig::default();
		assert!(config.should_notify_for_release_stage());

		config.enabled_release_stages = Some(["staging".to_string()].into_iter().collect());
		assert!(!config.should_notify_for_release_stage());

		config.release_stage = "staging".to_string();
		assert!(config.should_notify_for_release_stage());
	}

	#[test]
	fn breadcrumb_type_filter() {
		let mut config = ClientConfig::default();
		assert!(config.should_record_breadcrumb_type(BreadcrumbType::Log));
		config.enabled_breadcrumb_types = Some([BreadcrumbType::Error].into_iter().collect());
		assert!(!config.should_record_breadcrumb_type(BreadcrumbType::Log));
		assert!(config.should_record_breadcrumb_type(BreadcrumbType::Error));
	}

	#[test]
	fn storage_dir_is_scoped_by_api_key() {
		let a = ClientConfig {
			api_key: "a".to_string(),
			..Default::default()
		};
		let b = ClientConfig {
			api_key: "b".to_string(),
			..Default::default()
		};
		assert_ne!(a.resolved_storage_dir(), b.resolved_storage_dir());

		let explicit = ClientConfig {
			storage_dir: Some(PathBuf::from("/tmp/explicit")),
			..Default::default()
		};
		assert_eq!(explicit.resolved_storage_dir(), PathBuf::from("/tmp/explicit"));
	}

	#[test]
	fn secret_file_strips_trailing_newline() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("key");
		std::fs::write(&path, "from-file\n").unwrap();

		let var = "LOOM_CRASH_TEST_SECRET";
		std::env::set_var(format!("{var}_FILE"), &path);
		let loaded = load_secret_env(var).unwrap();
		std::env::remove_var(format!("{var}_FILE"));

		assert_eq!(loaded.as_deref(), Some("from-file"));
	}

	#[test]
	fn builder_setters_apply() {
		let builder = CrashClientBuilder::new()
			.api_key("key")
			.release_stage("staging")
			.app_version("2.0.0")
			.max_breadcrumbs(5)
			.worker_threads(0)
			.discard_classes(["Ignored"]);
		let config = builder.config();
		assert_eq!(config.release_stage, "staging");
		assert_eq!(config.app_version.as_deref(), Some("2.0.0"));
		assert_eq!(config.max_breadcrumbs, 5);
		assert_eq!(config.worker_threads, 1);
		assert!(config.should_discard_class("Ignored"));
	}
}
