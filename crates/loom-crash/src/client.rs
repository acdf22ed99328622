// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash reporting client: the facade over capture, callbacks, sessions,
//! storage and delivery.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use loom_crash_core::breadcrumb::truncate;
use loom_crash_core::{
	Breadcrumb, BreadcrumbType, ContextMap, Event, Exception, Notifier, Session, SessionReport, SeverityReason,
	Stacktrace, User, MAX_MESSAGE_LEN,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::backtrace::{capture_stacktrace, exception_chain, stacktrace_from_rendered, FrameClassifier};
use crate::breadcrumbs::BreadcrumbRing;
use crate::bus::{EventBus, StateEvent, StateEventKind, SubscriptionId};
use crate::callbacks::{invoke_guarded, CallbackId, CallbackState};
use crate::config::{ClientConfig, CrashClientBuilder};
use crate::context::{ContextProvider, DefaultContextProvider};
use crate::delivery::{Delivery, DeliveryEngine, HttpDelivery};
use crate::diagnostics::InternalReporter;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::native::{self, InitialState, NativeCrashHandler};
use crate::panic_hook::{install_panic_hook, PanicDetails, PanicReporter};
use crate::session::{ResumeOutcome, SessionTracker};
use crate::store::EventStore;
use crate::user_store::UserStore;

/// SDK name reported in every payload.
pub const NOTIFIER_NAME: &str = "loom-crash-rust";
/// SDK version reported in every payload.
pub const NOTIFIER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NOTIFIER_URL: &str = "https://loom.ghuntley.com";

/// Subdirectory of the storage dir holding queued events.
pub const EVENTS_DIR: &str = "events";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const PANIC_ERROR_CLASS: &str = "panic";

pub(crate) struct ClientInner {
	config: ClientConfig,
	notifier: Notifier,
	classifier: FrameClassifier,
	callbacks: CallbackState,
	breadcrumbs: Arc<BreadcrumbRing>,
	sessions: SessionTracker,
	bus: Arc<EventBus>,
	user: RwLock<User>,
	user_store: UserStore,
	context_provider: Arc<dyn ContextProvider>,
	store: Arc<EventStore>,
	dispatcher: Arc<Dispatcher>,
	native: Option<NativeCrashHandler>,
	panic_reporting: AtomicBool,
	closed: AtomicBool,
	started: Instant,
}

/// Client for capturing errors and reporting them to the collector.
///
/// Cheap to clone; all clones share one set of workers and state. Capture
/// methods never fail and never block on network or disk beyond queueing.
///
/// # Example
///
/// ```no_run
/// use loom_crash::CrashClient;
///
/// let client = CrashClient::builder()
///     .api_key("your-api-key")
///     .endpoint("https://notify.example.com")
///     .sessions_endpoint("https://sessions.example.com")
///     .app_version(env!("CARGO_PKG_VERSION"))
///     .build()?;
///
/// client.set_user(Some("42".into()), Some("ada@example.com".into()), None);
/// client.leave_breadcrumb("loaded settings");
///
/// if let Err(err) = std::fs::read_to_string("/etc/app.toml") {
///     client.notify(&err);
/// }
///
/// client.close();
/// # Ok::<(), loom_crash::CrashSdkError>(())
/// ```
#[derive(Clone)]
pub struct CrashClient {
	inner: Arc<ClientInner>,
}

impl CrashClient {
	pub fn builder() -> CrashClientBuilder {
		CrashClientBuilder::new()
	}

	pub(crate) fn start(
		config: ClientConfig,
		delivery: Option<Arc<dyn Delivery>>,
		context_provider: Option<Arc<dyn ContextProvider>>,
	) -> Result<Self> {
		let storage_dir = config.resolved_storage_dir();
		std::fs::create_dir_all(&storage_dir)?;

		let user_store = UserStore::new(&storage_dir, config.persist_user);
		let user = user_store.load();

		let callbacks = CallbackState::new();
		if let Some(enabled) = config.enabled_breadcrumb_types.clone() {
			callbacks.add_on_breadcrumb(Arc::new(move |crumb: &mut Breadcrumb| enabled.contains(&crumb.kind)));
		}
		let breadcrumbs = Arc::new(BreadcrumbRing::new(config.max_breadcrumbs));
		let bus = Arc::new(EventBus::new());

		let store = Arc::new(EventStore::open(storage_dir.join(EVENTS_DIR), config.max_persisted_events)?);
		let delivery: Arc<dyn Delivery> = match delivery {
			Some(delivery) => delivery,
			None => Arc::new(HttpDelivery::new(config.delivery_timeout)?),
		};
		let notifier = Notifier::new(NOTIFIER_NAME, NOTIFIER_VERSION, NOTIFIER_URL);
		let engine = Arc::new(DeliveryEngine::new(
			delivery,
			Arc::clone(&store),
			Arc::clone(&breadcrumbs),
			Arc::clone(&bus),
			notifier.clone(),
			config.api_key.clone(),
			&config.endpoint,
			&config.sessions_endpoint,
			config.should_record_breadcrumb_type(BreadcrumbType::Error),
		));
		let dispatcher = Arc::new(Dispatcher::start(engine, config.worker_threads, config.queue_capacity)?);

		let context_provider = context_provider.unwrap_or_else(|| {
			Arc::new(DefaultContextProvider::new(
				config.release_stage.clone(),
				config.app_version.clone(),
			))
		});
		store.set_diagnostics(Arc::new(InternalReporter::new(
			Arc::downgrade(&dispatcher),
			Arc::clone(&context_provider),
			notifier.clone(),
			config.api_key.clone(),
			config.release_stage.clone(),
		)));

		let native = if config.native_crashes {
			let handler = NativeCrashHandler::start(&storage_dir, &bus);
			handler.sync(InitialState {
				user: &user,
				context: None,
				session: None,
				release_stage: &config.release_stage,
				app_version: config.app_version.as_deref(),
				breadcrumbs: &[],
			});
			Some(handler)
		} else {
			None
		};

		let inner = Arc::new(ClientInner {
			classifier: FrameClassifier::new(config.project_packages.clone()),
			sessions: SessionTracker::new(config.auto_track_sessions, config.paused_session_policy),
			user: RwLock::new(user),
			panic_reporting: AtomicBool::new(config.auto_detect_errors),
			closed: AtomicBool::new(false),
			started: Instant::now(),
			config,
			notifier,
			callbacks,
			breadcrumbs,
			bus,
			user_store,
			context_provider,
			store,
			dispatcher,
			native,
		});
		let client = Self { inner };

		if let Some(native) = &client.inner.native {
			client.inner.drain_native_crash(native);
			native.install_handlers();
		}

		if let Some(summary) = client.inner.dispatcher.flush_on_launch(client.inner.config.launch_flush_timeout) {
			debug!(?summary, "launch flush complete");
		}

		if client.inner.config.auto_detect_errors {
			let weak = Arc::downgrade(&client.inner);
			let reporter: Weak<dyn PanicReporter> = weak;
			install_panic_hook(reporter);
		}

		if client.inner.config.auto_track_sessions {
			client.set_in_foreground(true);
		}

		client.leave_breadcrumb_with("Loom crash client loaded", BreadcrumbType::State, Map::new());
		info!(
			release_stage = %client.inner.config.release_stage,
			native_crashes = client.inner.native.is_some(),
			"crash client started"
		);
		Ok(client)
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	/// Reports a handled error and its `source()` chain.
	pub fn notify<E>(&self, error: &E)
	where
		E: Error + 'static,
	{
		self.notify_with(error, |_| true);
	}

	/// Like [`notify`](Self::notify), running `callback` after the registered
	/// on-error callbacks. Returning `false` drops the event.
	pub fn notify_with<E, F>(&self, error: &E, callback: F)
	where
		E: Error + 'static,
		F: FnOnce(&mut Event) -> bool,
	{
		let stacktrace = capture_stacktrace(&self.inner.classifier);
		let exceptions = exception_chain(error, std::any::type_name::<E>(), stacktrace);
		let event = Event::new(exceptions, SeverityReason::HandledError);
		self.inner.notify_event(event, Some(callback));
	}

	/// Reports a handled error described by class, message and stack trace.
	pub fn notify_error(&self, error_class: &str, message: &str, stacktrace: Stacktrace) {
		self.notify_error_with(error_class, message, stacktrace, |_| true);
	}

	pub fn notify_error_with<F>(&self, error_class: &str, message: &str, stacktrace: Stacktrace, callback: F)
	where
		F: FnOnce(&mut Event) -> bool,
	{
		let event = Event::new(
			vec![Exception::new(error_class, message, stacktrace)],
			SeverityReason::HandledError,
		);
		self.inner.notify_event(event, Some(callback));
	}

	pub fn leave_breadcrumb(&self, message: impl Into<String>) {
		self.leave_breadcrumb_with(message, BreadcrumbType::Manual, Map::new());
	}

	/// Adds a breadcrumb after the on-breadcrumb callbacks accept it.
	pub fn leave_breadcrumb_with(&self, message: impl Into<String>, kind: BreadcrumbType, metadata: Map<String, Value>) {
		self.inner.leave_breadcrumb(Breadcrumb::new(message, kind, metadata));
	}

	pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
		self.inner.breadcrumbs.snapshot()
	}

	pub fn clear_breadcrumbs(&self) {
		self.inner.breadcrumbs.clear();
		self.inner.bus.publish(&StateEvent::BreadcrumbsCleared);
	}

	/// Replaces the user. Persisted when `persist_user` is on.
	pub fn set_user(&self, id: Option<String>, email: Option<String>, name: Option<String>) {
		self.inner.update_user(|user| *user = User::new(id, email, name));
	}

	pub fn set_user_id(&self, id: Option<String>) {
		self.inner.update_user(|user| user.id = id);
	}

	pub fn set_user_email(&self, email: Option<String>) {
		self.inner.update_user(|user| user.email = email);
	}

	pub fn set_user_name(&self, name: Option<String>) {
		self.inner.update_user(|user| user.name = name);
	}

	pub fn user(&self) -> User {
		self.inner.user()
	}

	pub fn add_metadata(&self, section: &str, key: &str, value: impl Into<Value>) {
		self.inner.callbacks.add_metadata(section, key, value.into());
	}

	pub fn add_metadata_section(&self, section: &str, values: Map<String, Value>) {
		self.inner.callbacks.add_metadata_section(section, values);
	}

	pub fn get_metadata(&self, section: &str, key: &str) -> Option<Value> {
		self.inner.callbacks.get_metadata(section, key)
	}

	pub fn get_metadata_section(&self, section: &str) -> Option<Map<String, Value>> {
		self.inner.callbacks.get_metadata_section(section)
	}

	pub fn clear_metadata(&self, section: &str, key: &str) {
		self.inner.callbacks.clear_metadata(section, key);
	}

	pub fn clear_metadata_section(&self, section: &str) {
		self.inner.callbacks.clear_metadata_section(section);
	}

	pub fn context(&self) -> Option<String> {
		self.inner.callbacks.context()
	}

	pub fn set_context(&self, context: Option<String>) {
		self.inner.callbacks.set_context(context.clone());
		self.inner.bus.publish(&StateEvent::ContextChanged(context));
	}

	/// Starts a new session, replacing any current one. Returns the session
	/// unless an on-session callback vetoed it.
	pub fn start_session(&self) -> Option<Session> {
		self.inner.start_session(false)
	}

	/// Pauses the active session. Events are not counted toward it until it
	/// is resumed.
	pub fn pause_session(&self) {
		if let Some(session) = self.inner.sessions.pause_session() {
			self.inner.bus.publish(&StateEvent::SessionPaused(session));
		}
	}

	/// Returns true if a paused session was resumed. With no session at all a
	/// new one is started and false is returned.
	pub fn resume_session(&self) -> bool {
		let outcome = self.inner.sessions.resume_session(&self.inner.callbacks);
		match &outcome {
			ResumeOutcome::Resumed(session) => {
				self.inner.bus.publish(&StateEvent::SessionResumed(session.clone()));
			}
			ResumeOutcome::Started(Some(session)) => {
				self.inner.session_started(session);
			}
			_ => {}
		}
		outcome.resumed()
	}

	pub fn current_session(&self) -> Option<Session> {
		self.inner.sessions.current_session()
	}

	pub fn add_on_error<F>(&self, callback: F) -> CallbackId
	where
		F: Fn(&mut Event) -> bool + Send + Sync + 'static,
	{
		self.inner.callbacks.add_on_error(Arc::new(callback))
	}

	pub fn remove_on_error(&self, id: CallbackId) -> bool {
		self.inner.callbacks.remove_on_error(id)
	}

	pub fn add_on_breadcrumb<F>(&self, callback: F) -> CallbackId
	where
		F: Fn(&mut Breadcrumb) -> bool + Send + Sync + 'static,
	{
		self.inner.callbacks.add_on_breadcrumb(Arc::new(callback))
	}

	pub fn remove_on_breadcrumb(&self, id: CallbackId) -> bool {
		self.inner.callbacks.remove_on_breadcrumb(id)
	}

	pub fn add_on_session<F>(&self, callback: F) -> CallbackId
	where
		F: Fn(&mut Session) -> bool + Send + Sync + 'static,
	{
		self.inner.callbacks.add_on_session(Arc::new(callback))
	}

	pub fn remove_on_session(&self, id: CallbackId) -> bool {
		self.inner.callbacks.remove_on_session(id)
	}

	/// Registers `subscriber` for the given kinds of state change. Subscribers
	/// run synchronously on the thread that made the change.
	pub fn subscribe<F>(&self, kinds: &[StateEventKind], subscriber: F) -> SubscriptionId
	where
		F: Fn(&StateEvent) + Send + Sync + 'static,
	{
		self.inner.bus.subscribe_many(kinds, Arc::new(subscriber))
	}

	pub fn unsubscribe(&self, id: SubscriptionId) {
		self.inner.bus.unsubscribe(id);
	}

	/// Host notification of a network change. Regaining connectivity retries
	/// the persisted events.
	pub fn on_connectivity_changed(&self, connected: bool) {
		let mut metadata = Map::new();
		metadata.insert("hasConnection".to_string(), Value::from(connected));
		self.leave_breadcrumb_with("Connectivity changed", BreadcrumbType::State, metadata);
		if connected {
			self.inner.dispatcher.flush_async();
		}
	}

	/// Host notification of the app entering or leaving the foreground.
	pub fn set_in_foreground(&self, in_foreground: bool) {
		if let Some(session) = self.inner.sessions.set_in_foreground(in_foreground, &self.inner.callbacks) {
			self.inner.session_started(&session);
		}
	}

	/// Queues a retry of the persisted events.
	pub fn flush_stored(&self) -> bool {
		self.inner.dispatcher.flush_async()
	}

	/// Waits up to `timeout` for queued deliveries to finish. Returns false
	/// on timeout.
	pub fn flush(&self, timeout: Duration) -> bool {
		self.inner.dispatcher.wait_idle(timeout)
	}

	/// Number of events waiting on disk.
	pub fn stored_event_count(&self) -> usize {
		self.inner.store.len()
	}

	/// Stops accepting work, waits briefly for queued deliveries, and
	/// uninstalls the native handlers. Later capture calls are ignored.
	pub fn close(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.inner.panic_reporting.store(false, Ordering::SeqCst);
		if let Some(native) = &self.inner.native {
			native.shutdown(&self.inner.bus);
		}
		self.inner.dispatcher.close(CLOSE_TIMEOUT);
		self.inner.bus.publish(&StateEvent::Closed);
		self.inner.bus.clear();
		info!("crash client closed");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}
}

impl ClientInner {
	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// The capture pipeline shared by every entry point except native
	/// crashes: filter, enrich, callbacks, count, then store or deliver.
	fn notify_event<F>(&self, mut event: Event, callback: Option<F>)
	where
		F: FnOnce(&mut Event) -> bool,
	{
		if self.is_closed() {
			debug!("client closed, ignoring event");
			return;
		}
		if let Some(class) = event.error_class() {
			if self.config.should_discard_class(class) {
				debug!(error_class = class, "discarding event by class");
				return;
			}
		}
		if !self.config.should_notify_for_release_stage() {
			debug!(release_stage = %self.config.release_stage, "release stage not enabled, skipping event");
			return;
		}

		self.enrich(&mut event);

		if !self.callbacks.run_on_error(&mut event) {
			debug!(event_id = %event.id, "event vetoed by on_error callback");
			return;
		}
		if let Some(callback) = callback {
			if !invoke_guarded("notify", || callback(&mut event)) {
				debug!(event_id = %event.id, "event vetoed by notify callback");
				return;
			}
		}

		if let Some(session) = self.sessions.record_event(event.unhandled) {
			self.bus.publish(&StateEvent::SessionUpdated(session.clone()));
			event.session = Some(session);
		}
		self.bus.publish(&StateEvent::Notified {
			unhandled: event.unhandled,
		});

		if event.unhandled {
			self.store.write(&event);
			self.dispatcher.flush_async();
		} else {
			self.dispatcher.deliver_async(event);
		}
	}

	fn enrich(&self, event: &mut Event) {
		event.app = self.app_snapshot();
		event.device = self.context_provider.device();

		let mut metadata = self.callbacks.metadata_snapshot();
		metadata.merge(&event.metadata);
		event.metadata = metadata;

		event.breadcrumbs = self.breadcrumbs.snapshot();
		event.user = self.user();
		if event.context.is_none() {
			event.context = self
				.callbacks
				.context()
				.or_else(|| self.context_provider.active_screen());
		}
		event.release_stage = self.config.release_stage.clone();
	}

	fn app_snapshot(&self) -> ContextMap {
		let mut app = self.context_provider.app();
		app.insert(
			"releaseStage".to_string(),
			Value::from(self.config.release_stage.clone()),
		);
		if let Some(version) = &self.config.app_version {
			app.insert("version".to_string(), Value::from(version.clone()));
		}
		app.entry("duration".to_string())
			.or_insert_with(|| Value::from(self.started.elapsed().as_millis() as u64));
		app.insert("inForeground".to_string(), Value::from(self.sessions.in_foreground()));
		if let Some(duration) = self.sessions.foreground_duration() {
			app.insert(
				"durationInForeground".to_string(),
				Value::from(duration.as_millis() as u64),
			);
		}
		app
	}

	fn leave_breadcrumb(&self, mut breadcrumb: Breadcrumb) {
		if self.is_closed() {
			return;
		}
		if !self.callbacks.run_on_breadcrumb(&mut breadcrumb) {
			debug!(kind = %breadcrumb.kind, "breadcrumb vetoed");
			return;
		}
		breadcrumb.message = truncate(&breadcrumb.message, MAX_MESSAGE_LEN);
		self.breadcrumbs.push(breadcrumb.clone());
		self.bus.publish(&StateEvent::BreadcrumbAdded(breadcrumb));
	}

	fn user(&self) -> User {
		self.user.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	fn update_user(&self, change: impl FnOnce(&mut User)) {
		let user = {
			let mut user = self.user.write().unwrap_or_else(PoisonError::into_inner);
			change(&mut user);
			user.clone()
		};
		if let Err(err) = self.user_store.save(&user) {
			warn!(error = %err, "failed to persist user");
		}
		self.bus.publish(&StateEvent::UserChanged(user));
	}

	fn start_session(&self, auto_captured: bool) -> Option<Session> {
		if self.is_closed() {
			return None;
		}
		let session = self.sessions.start_session(auto_captured, &self.callbacks)?;
		self.session_started(&session);
		Some(session)
	}

	fn session_started(&self, session: &Session) {
		self.bus.publish(&StateEvent::SessionStarted(session.clone()));
		let report = SessionReport {
			notifier: self.notifier.clone(),
			app: self.app_snapshot(),
			device: self.context_provider.device(),
			sessions: vec![session.clone()],
		};
		self.dispatcher.deliver_session(report);
	}

	/// Native crashes skip callbacks: the process that could have vetoed them
	/// is gone. The record is cleared only once the event is on disk; the
	/// launch flush delivers it.
	fn drain_native_crash(&self, native: &NativeCrashHandler) -> bool {
		let Some(record) = native.pending_record() else {
			return false;
		};
		let event = native::record_to_event(
			record,
			&self.config.release_stage,
			self.config.max_breadcrumbs,
			self.app_snapshot(),
			self.context_provider.device(),
		);
		if self.store.write(&event).is_none() {
			warn!(event_id = %event.id, "native crash kept pending, event store unavailable");
			return false;
		}
		native.acknowledge_pending();
		info!(event_id = %event.id, error_class = ?event.error_class(), "queued native crash from previous run");
		true
	}
}

impl PanicReporter for ClientInner {
	fn report_panic(&self, details: PanicDetails) {
		if !self.panic_reporting.load(Ordering::SeqCst) || self.is_closed() {
			return;
		}

		let stacktrace = stacktrace_from_rendered(&details.backtrace, &self.classifier);
		let mut event = Event::new(
			vec![Exception::new(PANIC_ERROR_CLASS, details.message, stacktrace)],
			SeverityReason::UnhandledPanic,
		);
		if let Some(location) = details.location {
			event.add_metadata("panic", "location", location);
		}
		if let Some(thread) = details.thread {
			event.add_metadata("panic", "thread", thread);
		}
		self.notify_event(event, None::<fn(&mut Event) -> bool>);
	}
}
