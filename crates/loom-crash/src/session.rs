// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session tracking for stability scoring.
//!
//! The tracker is the single writer of session counts. Every count change
//! replaces the stored [`Session`] with an incremented copy, so a snapshot
//! attached to an event never changes underneath it. Sessions live in memory
//! only; a new process always starts without one.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use loom_crash_core::Session;
use tracing::debug;

use crate::callbacks::CallbackState;

/// Time in background after which returning to the foreground starts a new
/// automatic session.
pub const BACKGROUND_SESSION_THRESHOLD: Duration = Duration::from_secs(30);

/// Whether events reported while a session is paused count toward it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PausedSessionPolicy {
	/// Paused sessions are never counted or attached.
	#[default]
	Ignore,
	/// Paused sessions started by the host application are still counted.
	CountManual,
}

#[derive(Debug, Clone)]
enum SessionState {
	NoSession,
	Active(Session),
	Paused(Session),
}

/// Outcome of [`SessionTracker::resume_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
	/// A paused session became active again.
	Resumed(Session),
	/// There was no session, so a new one was started (`None` if vetoed).
	Started(Option<Session>),
	/// The current session was already active.
	AlreadyActive,
}

impl ResumeOutcome {
	/// True only when a paused session was resumed.
	pub fn resumed(&self) -> bool {
		matches!(self, Self::Resumed(_))
	}
}

#[derive(Debug)]
struct Foreground {
	in_foreground: bool,
	since: Instant,
	last_background: Option<Instant>,
}

pub struct SessionTracker {
	state: Mutex<SessionState>,
	foreground: Mutex<Foreground>,
	auto_track: bool,
	policy: PausedSessionPolicy,
	background_threshold: Duration,
}

impl SessionTracker {
	pub fn new(auto_track: bool, policy: PausedSessionPolicy) -> Self {
		Self::with_background_threshold(auto_track, policy, BACKGROUND_SESSION_THRESHOLD)
	}

	pub(crate) fn with_background_threshold(
		auto_track: bool,
		policy: PausedSessionPolicy,
		background_threshold: Duration,
	) -> Self {
		Self {
			state: Mutex::new(SessionState::NoSession),
			foreground: Mutex::new(Foreground {
				in_foreground: false,
				since: Instant::now(),
				last_background: None,
			}),
			auto_track,
			policy,
			background_threshold,
		}
	}

	fn state(&self) -> MutexGuard<'_, SessionState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn foreground(&self) -> MutexGuard<'_, Foreground> {
		self.foreground.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Starts a brand-new session, replacing any current one.
	///
	/// On-session callbacks run before the session is installed and without
	/// the state lock held. A veto leaves the current state untouched and
	/// returns `None`.
	pub fn start_session(&self, auto_captured: bool, callbacks: &CallbackState) -> Option<Session> {
		let mut session = Session::new(auto_captured);
		if !callbacks.run_on_session(&mut session) {
			debug!(session_id = %session.id, "session vetoed by callback");
			return None;
		}

		*self.state() = SessionState::Active(session.clone());
		debug!(session_id = %session.id, auto_captured, "session started");
		Some(session)
	}

	/// Active to Paused. Returns the paused session, or `None` if there was
	/// nothing active.
	pub fn pause_session(&self) -> Option<Session> {
		let mut state = self.state();
		match std::mem::replace(&mut *state, SessionState::NoSession) {
			SessionState::Active(session) => {
				*state = SessionState::Paused(session.clone());
				debug!(session_id = %session.id, "session paused");
				Some(session)
			}
			other => {
				*state = other;
				None
			}
		}
	}

	/// Paused to Active, keeping identity and counts. With no session at all
	/// a new one is started. An already active session is left alone.
	pub fn resume_session(&self, callbacks: &CallbackState) -> ResumeOutcome {
		{
			let mut state = self.state();
			match std::mem::replace(&mut *state, SessionState::NoSession) {
				SessionState::Paused(session) => {
					*state = SessionState::Active(session.clone());
					debug!(session_id = %session.id, "session resumed");
					return ResumeOutcome::Resumed(session);
				}
				SessionState::Active(session) => {
					*state = SessionState::Active(session);
					return ResumeOutcome::AlreadyActive;
				}
				SessionState::NoSession => {}
			}
		}
		ResumeOutcome::Started(self.start_session(false, callbacks))
	}

	/// Counts one event toward the current session and returns the
	/// incremented snapshot to attach to it.
	///
	/// Returns `None` when there is no countable session: none exists, it is
	/// paused (unless the policy counts paused manual sessions), or it was
	/// auto-captured while automatic tracking is off.
	pub fn record_event(&self, unhandled: bool) -> Option<Session> {
		let mut state = self.state();
		let (session, paused) = match &*state {
			SessionState::NoSession => return None,
			SessionState::Active(session) => (session, false),
			SessionState::Paused(session) => (session, true),
		};

		if !self.auto_track && session.auto_captured {
			return None;
		}
		if paused && !(self.policy == PausedSessionPolicy::CountManual && !session.auto_captured) {
			return None;
		}

		let next = session.increment(unhandled);
		*state = if paused {
			SessionState::Paused(next.clone())
		} else {
			SessionState::Active(next.clone())
		};
		Some(next)
	}

	/// The active session, if any.
	pub fn current_session(&self) -> Option<Session> {
		match &*self.state() {
			SessionState::Active(session) => Some(session.clone()),
			_ => None,
		}
	}

	pub fn is_paused(&self) -> bool {
		matches!(&*self.state(), SessionState::Paused(_))
	}

	/// Records a foreground/background transition. Entering the foreground
	/// with automatic tracking on starts a new automatic session when there
	/// is none or the app spent at least the threshold in the background.
	pub fn set_in_foreground(&self, in_foreground: bool, callbacks: &CallbackState) -> Option<Session> {
		let now = Instant::now();
		let should_start = {
			let mut fg = self.foreground();
			if fg.in_foreground == in_foreground {
				return None;
			}
			fg.in_foreground = in_foreground;
			fg.since = now;
			if !in_foreground {
				fg.last_background = Some(now);
				return None;
			}
			let long_absence = fg
				.last_background
				.map(|at| now.duration_since(at) >= self.background_threshold)
				.unwrap_or(false);
			self.auto_track && (long_absence || matches!(&*self.state(), SessionState::NoSession))
		};

		if should_start {
			self.start_session(true, callbacks)
		} else {
			None
		}
	}

	pub fn in_foreground(&self) -> bool {
		self.foreground().in_foreground
	}

	/// Time since the last foreground transition, when in the foreground.
	pub fn foreground_duration(&self) -> Option<Duration> {
		let fg = self.foreground();
		fg.in_foreground.then(|| fg.since.elapsed())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	fn tracker() -> SessionTracker {
		SessionTracker::new(true, PausedSessionPolicy::Ignore)
	}

	#[test]
	fn back_to_back_starts_are_distinct() {
		let callbacks = CallbackState::new();
		let tracker = tracker();

		let first = tracker.start_session(false, &callbacks).unwrap();
		tracker.record_event(false);
		let second = tracker.start_session(false, &callbacks).unwrap();

		assert_ne!(first.id, second.id);
		assert_eq!(second.events.handled, 0);
		assert_eq!(second.events.unhandled, 0);
		assert_eq!(tracker.current_session().map(|s| s.id), Some(second.id));
	}

	#[test]
	fn resume_semantics() {
		let callbacks = CallbackState::new();
		let tracker = tracker();

		// No session: starts one, reports false.
		let outcome = tracker.resume_session(&callbacks);
		assert!(!outcome.resumed());
		let started = match outcome {
			ResumeOutcome::Started(Some(session)) => session,
			other => panic!("unexpected {other:?}"),
		};

		// Active: no-op, false.
		assert_eq!(tracker.resume_session(&callbacks), ResumeOutcome::AlreadyActive);

		// Paused: resumes with same identity and counts, true.
		tracker.record_event(true);
		tracker.pause_session();
		let outcome = tracker.resume_session(&callbacks);
		assert!(outcome.resumed());
		let resumed = tracker.current_session().unwrap();
		assert_eq!(resumed.id, started.id);
		assert_eq!(resumed.events.unhandled, 1);
	}

	#[test]
	fn pause_without_session_is_noop() {
		let tracker = tracker();
		assert!(tracker.pause_session().is_none());
		assert!(!tracker.is_paused());
	}

	#[test]
	fn counts_only_active_by_default() {
		let callbacks = CallbackState::new();
		let tracker = tracker();
		assert!(tracker.record_event(false).is_none());

		tracker.start_session(false, &callbacks);
		assert_eq!(tracker.record_event(false).map(|s| s.events.handled), Some(1));
		assert_eq!(tracker.record_event(true).map(|s| s.events.unhandled), Some(1));

		tracker.pause_session();
		assert!(tracker.record_event(false).is_none());
	}

	#[test]
	fn count_manual_policy_counts_paused_manual_sessions() {
		let callbacks = CallbackState::new();
		let tracker = SessionTracker::new(true, PausedSessionPolicy::CountManual);

		tracker.start_session(false, &callbacks);
		tracker.pause_session();
		assert_eq!(tracker.record_event(false).map(|s| s.events.handled), Some(1));
		assert!(tracker.is_paused());

		tracker.start_session(true, &callbacks);
		tracker.pause_session();
		assert!(tracker.record_event(false).is_none());
	}

	#[test]
	fn auto_captured_sessions_ignored_without_auto_tracking() {
		let callbacks = CallbackState::new();
		let tracker = SessionTracker::new(false, PausedSessionPolicy::Ignore);

		tracker.start_session(true, &callbacks);
		assert!(tracker.record_event(false).is_none());

		tracker.start_session(false, &callbacks);
		assert!(tracker.record_event(false).is_some());
	}

	#[test]
	fn vetoed_session_is_not_installed() {
		let callbacks = CallbackState::new();
		let tracker = tracker();
		let kept = tracker.start_session(false, &callbacks).unwrap();

		callbacks.add_on_session(Arc::new(|_: &mut Session| false));
		assert!(tracker.start_session(false, &callbacks).is_none());
		assert_eq!(tracker.current_session().map(|s| s.id), Some(kept.id));
	}

	#[test]
	fn foreground_starts_sessions() {
		let callbacks = CallbackState::new();
		let tracker = SessionTracker::with_background_threshold(
			true,
			PausedSessionPolicy::Ignore,
			Duration::ZERO,
		);

		let first = tracker.set_in_foreground(true, &callbacks).unwrap();
		assert!(first.auto_captured);
		assert!(tracker.in_foreground());
		assert!(tracker.set_in_foreground(true, &callbacks).is_none());

		assert!(tracker.set_in_foreground(false, &callbacks).is_none());
		let second = tracker.set_in_foreground(true, &callbacks).unwrap();
		assert_ne!(first.id, second.id);
	}

	#[test]
	fn short_background_keeps_session() {
		let callbacks = CallbackState::new();
		let tracker = tracker();

		let first = tracker.set_in_foreground(true, &callbacks).unwrap();
		tracker.set_in_foreground(false, &callbacks);
		assert!(tracker.set_in_foreground(true, &callbacks).is_none());
		assert_eq!(tracker.current_session().map(|s| s.id), Some(first.id));
	}
}
