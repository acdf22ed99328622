// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Glue between the client and the native crash bridge.
//!
//! State changes published on the [`EventBus`] are mirrored into the bridge
//! so a fault handler has them without touching client locks. On launch a
//! pending crash record is turned into an ordinary unhandled event.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use loom_crash_core::{
	Breadcrumb, BreadcrumbType, ContextMap, Event, Exception, Frame, Session, SessionEvents, SessionId,
	SeverityReason, Stacktrace, User,
};
use loom_crash_native::{
	install_signal_handlers, signal_description, signal_name, MirroredBreadcrumb, MirroredSession,
	MirroredUser, NativeBridge, NativeBridgeError, NativeCrashRecord, SignalHandlerGuard,
};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, StateEvent, StateEventKind, SubscriptionId};

pub const NATIVE_DIR: &str = "native";
pub const BRIDGE_FILE: &str = "crash.bin";

/// Client state copied into the bridge at startup.
pub(crate) struct InitialState<'a> {
	pub user: &'a User,
	pub context: Option<&'a str>,
	pub session: Option<&'a Session>,
	pub release_stage: &'a str,
	pub app_version: Option<&'a str>,
	pub breadcrumbs: &'a [Breadcrumb],
}

pub struct NativeCrashHandler {
	bridge: Arc<NativeBridge>,
	guard: Mutex<Option<SignalHandlerGuard>>,
	subscription: SubscriptionId,
}

impl NativeCrashHandler {
	/// Opens the bridge under `storage_dir` and starts mirroring state from
	/// `bus`. A record left by the previous process stays pending until
	/// [`acknowledge_pending`](Self::acknowledge_pending).
	pub fn start(storage_dir: &Path, bus: &EventBus) -> Self {
		let bridge = Arc::new(open_bridge(storage_dir));
		let subscription = subscribe_mirror(Arc::clone(&bridge), bus);
		Self {
			bridge,
			guard: Mutex::new(None),
			subscription,
		}
	}

	/// The record left by the previous process, if any. Must be read before
	/// [`install_handlers`](Self::install_handlers).
	pub fn pending_record(&self) -> Option<NativeCrashRecord> {
		let pending = self.bridge.peek_pending();
		if let Some(record) = &pending {
			info!(signal = record.signal, "found native crash from previous run");
		}
		pending
	}

	/// Clears the pending record once it has been persisted.
	pub fn acknowledge_pending(&self) {
		self.bridge.clear_pending();
	}

	pub fn bridge(&self) -> &Arc<NativeBridge> {
		&self.bridge
	}

	pub(crate) fn sync(&self, state: InitialState<'_>) {
		self.bridge.set_user(&mirror_user(state.user));
		self.bridge.set_context(state.context);
		self.bridge.set_session(state.session.map(mirror_session).as_ref());
		self.bridge.set_app(state.release_stage, state.app_version);
		self.bridge.clear_breadcrumbs();
		for breadcrumb in state.breadcrumbs {
			self.bridge.push_breadcrumb(&mirror_breadcrumb(breadcrumb));
		}
	}

	/// Installs the fatal signal handlers. Failure is logged, not fatal:
	/// another handler may already own them or the platform may lack them.
	pub fn install_handlers(&self) -> bool {
		match install_signal_handlers(Arc::clone(&self.bridge)) {
			Ok(guard) => {
				*self.guard.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);
				info!("native crash handlers installed");
				true
			}
			Err(NativeBridgeError::Unsupported) => {
				info!("native crash capture not supported on this platform");
				false
			}
			Err(err) => {
				warn!(error = %err, "failed to install native crash handlers");
				false
			}
		}
	}

	/// Stops mirroring and restores the previous signal dispositions.
	pub fn shutdown(&self, bus: &EventBus) {
		bus.unsubscribe(self.subscription);
		self.guard.lock().unwrap_or_else(PoisonError::into_inner).take();
	}
}

fn open_bridge(storage_dir: &Path) -> NativeBridge {
	let dir = storage_dir.join(NATIVE_DIR);
	let path = dir.join(BRIDGE_FILE);
	let opened = std::fs::create_dir_all(&dir)
		.map_err(|source| NativeBridgeError::Map {
			path: path.clone(),
			source,
		})
		.and_then(|()| NativeBridge::open(&path));

	match opened {
		Ok(bridge) => bridge,
		Err(err) => {
			warn!(error = %err, "native bridge file unavailable, crashes will not survive restart");
			NativeBridge::in_memory()
		}
	}
}

fn subscribe_mirror(bridge: Arc<NativeBridge>, bus: &EventBus) -> SubscriptionId {
	bus.subscribe_many(
		&[
			StateEventKind::UserChanged,
			StateEventKind::ContextChanged,
			StateEventKind::BreadcrumbAdded,
			StateEventKind::BreadcrumbsCleared,
			StateEventKind::SessionStarted,
			StateEventKind::SessionPaused,
			StateEventKind::SessionResumed,
			StateEventKind::SessionUpdated,
		],
		Arc::new(move |event| mirror_event(&bridge, event)),
	)
}

fn mirror_event(bridge: &NativeBridge, event: &StateEvent) {
	match event {
		StateEvent::UserChanged(user) => bridge.set_user(&mirror_user(user)),
		StateEvent::ContextChanged(context) => bridge.set_context(context.as_deref()),
		StateEvent::BreadcrumbAdded(breadcrumb) => bridge.push_breadcrumb(&mirror_breadcrumb(breadcrumb)),
		StateEvent::BreadcrumbsCleared => bridge.clear_breadcrumbs(),
		StateEvent::SessionStarted(session)
		| StateEvent::SessionResumed(session)
		| StateEvent::SessionUpdated(session) => bridge.set_session(Some(&mirror_session(session))),
		// A crash during a pause must not count toward the paused session.
		StateEvent::SessionPaused(_) => bridge.set_session(None),
		StateEvent::Notified { .. } | StateEvent::Closed => {}
	}
}

pub(crate) fn mirror_session(session: &Session) -> MirroredSession {
	MirroredSession {
		id: session.id.to_string(),
		started_at_millis: session.started_at.timestamp_millis(),
		handled: session.events.handled,
		unhandled: session.events.unhandled,
		auto_captured: session.auto_captured,
	}
}

fn mirror_user(user: &User) -> MirroredUser {
	MirroredUser {
		id: user.id.clone(),
		email: user.email.clone(),
		name: user.name.clone(),
	}
}

fn mirror_breadcrumb(breadcrumb: &Breadcrumb) -> MirroredBreadcrumb {
	MirroredBreadcrumb {
		timestamp_millis: breadcrumb.timestamp.timestamp_millis(),
		kind: breadcrumb.kind.code(),
		message: breadcrumb.message.clone(),
	}
}

/// Builds the unhandled event for a native crash. The session counts are
/// those at crash time plus this crash. Only the newest `max_breadcrumbs`
/// mirrored breadcrumbs are kept.
pub fn record_to_event(
	record: NativeCrashRecord,
	default_release_stage: &str,
	max_breadcrumbs: usize,
	app: ContextMap,
	device: ContextMap,
) -> Event {
	let frames = record
		.frames
		.iter()
		.map(|address| Frame {
			frame_address: Some(format!("0x{address:x}")),
			..Frame::default()
		})
		.collect();
	let message = format!(
		"{} at 0x{:x}",
		signal_description(record.signal),
		record.fault_address
	);

	let mut event = Event::new(
		vec![Exception::new(signal_name(record.signal), message, Stacktrace { frames })],
		SeverityReason::Signal,
	);
	event.timestamp = from_millis(record.time_millis);
	event.session = record.session.as_ref().and_then(restore_session);
	event.user = User::new(record.user.id, record.user.email, record.user.name);
	event.context = record.context;
	event.release_stage = record
		.release_stage
		.unwrap_or_else(|| default_release_stage.to_string());

	event.app = app;
	if let Some(version) = record.app_version {
		event.app.insert("version".to_string(), Value::from(version));
	}
	event.device = device;

	let skip = record.breadcrumbs.len().saturating_sub(max_breadcrumbs);
	event.breadcrumbs = record
		.breadcrumbs
		.into_iter()
		.skip(skip)
		.map(|crumb| Breadcrumb {
			timestamp: from_millis(crumb.timestamp_millis),
			message: crumb.message,
			kind: BreadcrumbType::from_code(crumb.kind),
			metadata: Map::new(),
		})
		.collect();

	let mut signal = Map::new();
	signal.insert("signal".to_string(), Value::from(record.signal));
	signal.insert("name".to_string(), Value::from(signal_name(record.signal)));
	signal.insert("code".to_string(), Value::from(record.code));
	signal.insert(
		"faultAddress".to_string(),
		Value::from(format!("0x{:x}", record.fault_address)),
	);
	event.metadata.add_section("signal", signal);
	event
}

fn restore_session(mirrored: &MirroredSession) -> Option<Session> {
	let id = Uuid::parse_str(&mirrored.id).ok()?;
	Some(Session {
		id: SessionId(id),
		started_at: from_millis(mirrored.started_at_millis),
		events: SessionEvents {
			handled: mirrored.handled,
			unhandled: mirrored.unhandled.saturating_add(1),
		},
		auto_captured: mirrored.auto_captured,
	})
}

fn from_millis(millis: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}
