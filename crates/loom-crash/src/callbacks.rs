// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Ordered, vetoable callback chains and the shared metadata/context state.
//!
//! Each chain threads one value through its callbacks in registration order.
//! A callback returning `false` vetoes: later callbacks are skipped and the
//! caller drops the value. A callback that panics is logged and treated as
//! if it returned `true`.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use loom_crash_core::{Breadcrumb, Event, Metadata, Session};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub type OnErrorCallback = Arc<dyn Fn(&mut Event) -> bool + Send + Sync>;
pub type OnBreadcrumbCallback = Arc<dyn Fn(&mut Breadcrumb) -> bool + Send + Sync>;
pub type OnSessionCallback = Arc<dyn Fn(&mut Session) -> bool + Send + Sync>;

/// Handle returned on registration, used to remove a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

thread_local! {
	static CALLBACK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while the current thread is executing a user callback.
///
/// The panic hook consults this so a panicking callback is not itself
/// reported as an unhandled panic.
pub(crate) fn in_user_callback() -> bool {
	CALLBACK_DEPTH.with(|depth| depth.get() > 0)
}

struct DepthGuard;

impl DepthGuard {
	fn enter() -> Self {
		CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
		Self
	}
}

impl Drop for DepthGuard {
	fn drop(&mut self) {
		CALLBACK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
	}
}

/// Runs one user callback, converting a panic into "continue".
pub(crate) fn invoke_guarded<F>(chain: &'static str, callback: F) -> bool
where
	F: FnOnce() -> bool,
{
	let _guard = DepthGuard::enter();
	match panic::catch_unwind(AssertUnwindSafe(callback)) {
		Ok(keep) => keep,
		Err(payload) => {
			warn!(
				chain,
				panic = %panic_message(payload.as_ref()),
				"callback panicked; continuing"
			);
			true
		}
	}
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"Box<dyn Any>".to_string()
	}
}

struct Chain<T: ?Sized> {
	name: &'static str,
	entries: RwLock<Vec<(CallbackId, Arc<T>)>>,
}

impl<T: ?Sized> Chain<T> {
	fn new(name: &'static str) -> Self {
		Self {
			name,
			entries: RwLock::new(Vec::new()),
		}
	}

	fn add(&self, id: CallbackId, callback: Arc<T>) {
		self
			.entries
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push((id, callback));
	}

	fn remove(&self, id: CallbackId) -> bool {
		let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
		let before = entries.len();
		entries.retain(|(existing, _)| *existing != id);
		entries.len() != before
	}

	fn len(&self) -> usize {
		self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	/// Snapshot so callbacks run without holding the lock and may register
	/// or remove callbacks themselves.
	fn snapshot(&self) -> Vec<(CallbackId, Arc<T>)> {
		self.entries.read().unwrap_or_else(PoisonError::into_inner).clone()
	}
}

impl<V> Chain<dyn Fn(&mut V) -> bool + Send + Sync> {
	fn run(&self, value: &mut V) -> bool {
		for (id, callback) in self.snapshot() {
			if !invoke_guarded(self.name, || callback(value)) {
				debug!(chain = self.name, callback_id = id.0, "callback vetoed");
				return false;
			}
		}
		true
	}
}

/// Callback chains plus the global metadata and context.
pub struct CallbackState {
	next_id: AtomicU64,
	on_error: Chain<dyn Fn(&mut Event) -> bool + Send + Sync>,
	on_breadcrumb: Chain<dyn Fn(&mut Breadcrumb) -> bool + Send + Sync>,
	on_session: Chain<dyn Fn(&mut Session) -> bool + Send + Sync>,
	metadata: RwLock<Metadata>,
	context: RwLock<Option<String>>,
}

impl CallbackState {
	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			on_error: Chain::new("on_error"),
			on_breadcrumb: Chain::new("on_breadcrumb"),
			on_session: Chain::new("on_session"),
			metadata: RwLock::new(Metadata::new()),
			context: RwLock::new(None),
		}
	}

	fn next_id(&self) -> CallbackId {
		CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed))
	}

	pub fn add_on_error(&self, callback: OnErrorCallback) -> CallbackId {
		let id = self.next_id();
		self.on_error.add(id, callback);
		id
	}

	pub fn remove_on_error(&self, id: CallbackId) -> bool {
		self.on_error.remove(id)
	}

	pub fn add_on_breadcrumb(&self, callback: OnBreadcrumbCallback) -> CallbackId {
		let id = self.next_id();
		self.on_breadcrumb.add(id, callback);
		id
	}

	pub fn remove_on_breadcrumb(&self, id: CallbackId) -> bool {
		self.on_breadcrumb.remove(id)
	}

	pub fn add_on_session(&self, callback: OnSessionCallback) -> CallbackId {
		let id = self.next_id();
		self.on_session.add(id, callback);
		id
	}

	pub fn remove_on_session(&self, id: CallbackId) -> bool {
		self.on_session.remove(id)
	}

	/// Returns false if any callback vetoed the event.
	pub fn run_on_error(&self, event: &mut Event) -> bool {
		self.on_error.run(event)
	}

	pub fn run_on_breadcrumb(&self, breadcrumb: &mut Breadcrumb) -> bool {
		self.on_breadcrumb.run(breadcrumb)
	}

	pub fn run_on_session(&self, session: &mut Session) -> bool {
		self.on_session.run(session)
	}

	pub fn callback_counts(&self) -> (usize, usize, usize) {
		(self.on_error.len(), self.on_breadcrumb.len(), self.on_session.len())
	}

	pub fn add_metadata(&self, section: &str, key: &str, value: Value) {
		self.metadata_mut().add(section, key, value);
	}

	pub fn add_metadata_section(&self, section: &str, values: Map<String, Value>) {
		self.metadata_mut().add_section(section, values);
	}

	pub fn get_metadata(&self, section: &str, key: &str) -> Option<Value> {
		self.metadata_ref().get(section, key).cloned()
	}

	pub fn get_metadata_section(&self, section: &str) -> Option<Map<String, Value>> {
		self.metadata_ref().get_section(section).cloned()
	}

	pub fn clear_metadata(&self, section: &str, key: &str) {
		self.metadata_mut().clear(section, key);
	}

	pub fn clear_metadata_section(&self, section: &str) {
		self.metadata_mut().clear_section(section);
	}

	/// Copy of the global metadata for attaching to an event.
	pub fn metadata_snapshot(&self) -> Metadata {
		self.metadata_ref().clone()
	}

	pub fn context(&self) -> Option<String> {
		self.context.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn set_context(&self, context: Option<String>) {
		*self.context.write().unwrap_or_else(PoisonError::into_inner) = context;
	}

	fn metadata_ref(&self) -> std::sync::RwLockReadGuard<'_, Metadata> {
		self.metadata.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn metadata_mut(&self) -> std::sync::RwLockWriteGuard<'_, Metadata> {
		self.metadata.write().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Default for CallbackState {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_crash_core::{Exception, Severity, SeverityReason, Stacktrace};
	use std::sync::atomic::AtomicUsize;

	fn event() -> Event {
		Event::new(
			vec![Exception::new("Error", "boom", Stacktrace::default())],
			SeverityReason::HandledError,
		)
	}

	#[test]
	fn runs_in_registration_order() {
		let state = CallbackState::new();
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));

		for i in 0..3 {
			let order = Arc::clone(&order);
			state.add_on_error(Arc::new(move |_: &mut Event| {
				order.lock().unwrap().push(i);
				true
			}));
		}

		assert!(state.run_on_error(&mut event()));
		assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
	}

	#[test]
	fn first_veto_stops_chain() {
		let state = CallbackState::new();
		let calls = Arc::new(AtomicUsize::new(0));

		state.add_on_error(Arc::new(|_: &mut Event| false));
		let counter = Arc::clone(&calls);
		state.add_on_error(Arc::new(move |_: &mut Event| {
			counter.fetch_add(1, Ordering::SeqCst);
			true
		}));

		assert!(!state.run_on_error(&mut event()));
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn panicking_callback_continues() {
		let state = CallbackState::new();
		state.add_on_error(Arc::new(|_: &mut Event| panic!("callback bug")));
		state.add_on_error(Arc::new(|e: &mut Event| {
			e.set_severity(Severity::Info);
			true
		}));

		let mut event = event();
		assert!(state.run_on_error(&mut event));
		assert_eq!(event.severity, Severity::Info);
		assert!(!in_user_callback());
	}

	#[test]
	fn remove_by_id() {
		let state = CallbackState::new();
		let id = state.add_on_breadcrumb(Arc::new(|_: &mut Breadcrumb| false));
		assert!(!state.run_on_breadcrumb(&mut Breadcrumb::manual("x")));

		assert!(state.remove_on_breadcrumb(id));
		assert!(!state.remove_on_breadcrumb(id));
		assert!(state.run_on_breadcrumb(&mut Breadcrumb::manual("x")));
	}

	#[test]
	fn callback_may_register_another() {
		let state = Arc::new(CallbackState::new());
		let inner = Arc::clone(&state);
		state.add_on_session(Arc::new(move |_: &mut Session| {
			inner.add_on_session(Arc::new(|_: &mut Session| true));
			true
		}));

		assert!(state.run_on_session(&mut Session::new(false)));
		assert_eq!(state.callback_counts().2, 2);
	}

	#[test]
	fn metadata_and_context() {
		let state = CallbackState::new();
		state.add_metadata("account", "plan", Value::from("pro"));
		assert_eq!(state.get_metadata("account", "plan"), Some(Value::from("pro")));

		state.clear_metadata_section("account");
		assert!(state.get_metadata_section("account").is_none());

		state.set_context(Some("Settings".to_string()));
		assert_eq!(state.context().as_deref(), Some("Settings"));
	}
}
