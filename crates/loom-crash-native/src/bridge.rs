// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The two-phase crash handoff.
//!
//! Phase one runs inside a fault handler: [`NativeBridge::record_fault`]
//! writes the crash slot with plain stores and publishes it by flipping the
//! completion marker. Phase two runs at the next launch:
//! [`NativeBridge::take_pending`] copies the record and the mirrored state
//! out of the region and clears the marker, so a record is yielded once.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::Result;
use crate::layout::{
	BridgeLayout, MARKER_COMPLETE, MARKER_EMPTY, MARKER_WRITING, MAX_FRAMES,
};
use crate::region::Region;

/// Session state mirrored for the fault writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirroredSession {
	pub id: String,
	pub started_at_millis: i64,
	pub handled: u32,
	pub unhandled: u32,
	pub auto_captured: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirroredUser {
	pub id: Option<String>,
	pub email: Option<String>,
	pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredBreadcrumb {
	pub timestamp_millis: i64,
	pub kind: u8,
	pub message: String,
}

/// A completed crash record together with the state mirrored at crash time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCrashRecord {
	pub signal: i32,
	pub code: i32,
	pub fault_address: u64,
	pub time_millis: i64,
	pub frames: Vec<u64>,
	/// Present only when a session was active at crash time.
	pub session: Option<MirroredSession>,
	pub user: MirroredUser,
	pub context: Option<String>,
	pub release_stage: Option<String>,
	pub app_version: Option<String>,
	/// Oldest first.
	pub breadcrumbs: Vec<MirroredBreadcrumb>,
}

/// What the completion marker currently says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
	Empty,
	Partial,
	Complete,
}

/// A fixed-size region shared between the fault writer and the managed
/// client.
pub struct NativeBridge {
	region: Region,
	mirror: Mutex<()>,
}

// SAFETY: mirror writes are serialized by `mirror`; the fault writer only
// touches the crash slot after winning the marker compare-exchange.
unsafe impl Send for NativeBridge {}
unsafe impl Sync for NativeBridge {}

impl NativeBridge {
	/// Bridge backed by process memory. Useful for tests and platforms
	/// without shared mappings; records do not survive the process.
	pub fn in_memory() -> Self {
		let bridge = Self {
			region: Region::heap(),
			mirror: Mutex::new(()),
		};
		bridge.reset();
		bridge
	}

	/// Maps (creating if needed) the bridge file at `path`.
	///
	/// An existing file written by this format version is kept as-is so a
	/// record left by a previous process can be drained. Anything else is
	/// reset.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let bridge = Self {
			region: Region::map_file(path)?,
			mirror: Mutex::new(()),
		};
		// SAFETY: the region is mapped and no fault handler is installed yet.
		let valid = unsafe { (*bridge.layout()).is_valid() };
		if !valid {
			debug!(path = %path.display(), "initializing native crash bridge");
			bridge.reset();
		}
		Ok(bridge)
	}

	pub fn is_file_backed(&self) -> bool {
		self.region.is_file_backed()
	}

	fn layout(&self) -> *mut BridgeLayout {
		self.region.as_ptr()
	}

	fn marker(&self) -> &AtomicU32 {
		// SAFETY: the header lives as long as the region.
		unsafe { &(*self.layout()).header.marker }
	}

	fn lock(&self) -> MutexGuard<'_, ()> {
		self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn reset(&self) {
		let _guard = self.lock();
		// SAFETY: exclusive access under the mirror lock, before any handler
		// is installed.
		unsafe { (*self.layout()).initialize() };
	}

	pub fn pending_state(&self) -> PendingState {
		match self.marker().load(Ordering::Acquire) {
			MARKER_COMPLETE => PendingState::Complete,
			MARKER_WRITING => PendingState::Partial,
			_ => PendingState::Empty,
		}
	}

	/// Mirrors the active session, or clears it when `None`.
	pub fn set_session(&self, session: Option<&MirroredSession>) {
		let _guard = self.lock();
		// SAFETY: mirror slots are only written under the mirror lock.
		let slot = unsafe { &mut (*self.layout()).session };
		match session {
			Some(session) => {
				slot.id.set(&session.id);
				slot.started_at_millis = session.started_at_millis;
				slot.handled = session.handled;
				slot.unhandled = session.unhandled;
				slot.auto_captured = u8::from(session.auto_captured);
				slot.active = 1;
			}
			None => {
				slot.active = 0;
			}
		}
	}

	pub fn set_user(&self, user: &MirroredUser) {
		let _guard = self.lock();
		// SAFETY: mirror slots are only written under the mirror lock.
		let slot = unsafe { &mut (*self.layout()).user };
		slot.id.set_option(user.id.as_deref());
		slot.email.set_option(user.email.as_deref());
		slot.name.set_option(user.name.as_deref());
	}

	pub fn set_context(&self, context: Option<&str>) {
		let _guard = self.lock();
		// SAFETY: mirror slots are only written under the mirror lock.
		let slot = unsafe { &mut (*self.layout()).context };
		slot.value.set_option(context);
	}

	pub fn set_app(&self, release_stage: &str, version: Option<&str>) {
		let _guard = self.lock();
		// SAFETY: mirror slots are only written under the mirror lock.
		let slot = unsafe { &mut (*self.layout()).app };
		slot.release_stage.set(release_stage);
		slot.version.set_option(version);
	}

	pub fn push_breadcrumb(&self, breadcrumb: &MirroredBreadcrumb) {
		let _guard = self.lock();
		// SAFETY: mirror slots are only written under the mirror lock.
		let ring = unsafe { &mut (*self.layout()).breadcrumbs };
		ring.push(breadcrumb.timestamp_millis, breadcrumb.kind, &breadcrumb.message);
	}

	pub fn clear_breadcrumbs(&self) {
		let _guard = self.lock();
		// SAFETY: mirror slots are only written under the mirror lock.
		unsafe { (*self.layout()).breadcrumbs.clear() };
	}

	/// Records a fault. Async-signal-safe: no allocation, locking, logging or
	/// runtime calls.
	///
	/// Returns false when a record is already pending or being written; the
	/// first record wins until it is drained.
	pub fn record_fault(&self, signal: i32, code: i32, fault_address: u64, frames: &[u64]) -> bool {
		if self
			.marker()
			.compare_exchange(MARKER_EMPTY, MARKER_WRITING, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return false;
		}

		// SAFETY: winning the compare-exchange grants exclusive access to the
		// crash slot until the marker is published.
		unsafe {
			let crash = &mut (*self.layout()).crash;
			crash.signal = signal;
			crash.code = code;
			crash.fault_address = fault_address;
			crash.time_millis = now_millis();
			let count = frames.len().min(MAX_FRAMES);
			crash.frames[..count].copy_from_slice(&frames[..count]);
			crash.frame_count = count as u32;
		}

		self.marker().store(MARKER_COMPLETE, Ordering::Release);
		true
	}

	/// Reads a completed record without clearing it. A partially written
	/// record is discarded.
	///
	/// The record stays pending until [`clear_pending`](Self::clear_pending)
	/// so a crash survives a failed hand-off. Must run before fault handlers
	/// are installed for this region.
	pub fn peek_pending(&self) -> Option<NativeCrashRecord> {
		let _guard = self.lock();
		match self.marker().load(Ordering::Acquire) {
			MARKER_EMPTY => None,
			MARKER_COMPLETE => {
				// SAFETY: the marker is Complete, so the writer has finished.
				let record = unsafe { read_record(&*self.layout()) };
				debug!(signal = record.signal, "read pending native crash record");
				Some(record)
			}
			MARKER_WRITING => {
				warn!("discarding partially written native crash record");
				self.marker().store(MARKER_EMPTY, Ordering::Release);
				None
			}
			other => {
				warn!(marker = other, "unknown native crash marker, resetting");
				self.marker().store(MARKER_EMPTY, Ordering::Release);
				None
			}
		}
	}

	/// Marks the pending record as handed off so it is never yielded twice.
	pub fn clear_pending(&self) {
		let _guard = self.lock();
		if self
			.marker()
			.compare_exchange(MARKER_COMPLETE, MARKER_EMPTY, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			debug!("cleared native crash record");
		}
	}

	/// Reads and clears a completed record in one step.
	pub fn take_pending(&self) -> Option<NativeCrashRecord> {
		let record = self.peek_pending()?;
		self.clear_pending();
		Some(record)
	}

	#[cfg(test)]
	pub(crate) fn force_marker(&self, value: u32) {
		self.marker().store(value, Ordering::Release);
	}
}

fn read_record(layout: &BridgeLayout) -> NativeCrashRecord {
	let crash = &layout.crash;
	let frame_count = (crash.frame_count as usize).min(MAX_FRAMES);

	let session = if layout.session.active != 0 {
		Some(MirroredSession {
			id: layout.session.id.to_string_lossy(),
			started_at_millis: layout.session.started_at_millis,
			handled: layout.session.handled,
			unhandled: layout.session.unhandled,
			auto_captured: layout.session.auto_captured != 0,
		})
	} else {
		None
	};

	NativeCrashRecord {
		signal: crash.signal,
		code: crash.code,
		fault_address: crash.fault_address,
		time_millis: crash.time_millis,
		frames: crash.frames[..frame_count].to_vec(),
		session,
		user: MirroredUser {
			id: layout.user.id.to_option(),
			email: layout.user.email.to_option(),
			name: layout.user.name.to_option(),
		},
		context: layout.context.value.to_option(),
		release_stage: layout.app.release_stage.to_option(),
		app_version: layout.app.version.to_option(),
		breadcrumbs: layout
			.breadcrumbs
			.iter()
			.map(|slot| MirroredBreadcrumb {
				timestamp_millis: slot.timestamp_millis,
				kind: slot.kind,
				message: slot.message.to_string_lossy(),
			})
			.collect(),
	}
}

#[cfg(unix)]
fn now_millis() -> i64 {
	let mut ts = libc::timespec {
		tv_sec: 0,
		tv_nsec: 0,
	};
	// SAFETY: clock_gettime is async-signal-safe and `ts` is a valid out pointer.
	let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
	if rc != 0 {
		return 0;
	}
	(ts.tv_sec as i64) * 1000 + (ts.tv_nsec as i64) / 1_000_000
}

#[cfg(not(unix))]
fn now_millis() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}
