// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fixed binary layout of the bridge region.
//!
//! Every type here is `#[repr(C)]` and valid when all-zero, so a freshly
//! allocated or freshly created file-backed region is a valid (empty) layout
//! before [`BridgeLayout::initialize`] stamps the header.

use std::mem::offset_of;
use std::sync::atomic::{AtomicU32, Ordering};

pub const MAGIC: [u8; 8] = *b"LOOMCRSH";
pub const FORMAT_VERSION: u32 = 2;

pub const MARKER_EMPTY: u32 = 0;
pub const MARKER_WRITING: u32 = 1;
pub const MARKER_COMPLETE: u32 = 2;

pub const MAX_FRAMES: usize = 64;
pub const BREADCRUMB_SLOTS: usize = 25;

pub const SESSION_ID_LEN: usize = 36;
pub const USER_ID_LEN: usize = 64;
pub const USER_EMAIL_LEN: usize = 128;
pub const USER_NAME_LEN: usize = 64;
pub const CONTEXT_LEN: usize = 128;
pub const RELEASE_STAGE_LEN: usize = 64;
pub const APP_VERSION_LEN: usize = 64;
pub const BREADCRUMB_MESSAGE_LEN: usize = 140;

/// A length-prefixed string stored inline in `N` bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FixedStr<const N: usize> {
	len: u16,
	bytes: [u8; N],
}

impl<const N: usize> FixedStr<N> {
	pub const fn empty() -> Self {
		Self { len: 0, bytes: [0; N] }
	}

	/// Stores `value`, truncated to `N` bytes on a char boundary.
	pub fn set(&mut self, value: &str) {
		let end = floor_char_boundary(value, N);
		self.bytes[..end].copy_from_slice(&value.as_bytes()[..end]);
		self.len = end as u16;
	}

	pub fn set_option(&mut self, value: Option<&str>) {
		match value {
			Some(value) => self.set(value),
			None => self.clear(),
		}
	}

	pub fn clear(&mut self) {
		self.len = 0;
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Decodes the stored bytes. A corrupt length is clamped and invalid
	/// UTF-8 is replaced.
	pub fn to_string_lossy(&self) -> String {
		let len = (self.len as usize).min(N);
		String::from_utf8_lossy(&self.bytes[..len]).into_owned()
	}

	pub fn to_option(&self) -> Option<String> {
		if self.is_empty() {
			None
		} else {
			Some(self.to_string_lossy())
		}
	}
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
	if s.len() <= max {
		return s.len();
	}
	let mut end = max;
	while !s.is_char_boundary(end) {
		end -= 1;
	}
	end
}

#[repr(C)]
pub struct Header {
	pub magic: [u8; 8],
	pub version: u32,
	/// Written last by the fault writer.
	pub marker: AtomicU32,
	pub total_size: u32,
	pub crash_offset: u32,
	pub session_offset: u32,
	pub user_offset: u32,
	pub context_offset: u32,
	pub app_offset: u32,
	pub breadcrumbs_offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CrashSlot {
	pub signal: i32,
	pub code: i32,
	pub fault_address: u64,
	pub time_millis: i64,
	pub frame_count: u32,
	pub frames: [u64; MAX_FRAMES],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SessionSlot {
	pub started_at_millis: i64,
	pub handled: u32,
	pub unhandled: u32,
	pub id: FixedStr<SESSION_ID_LEN>,
	pub active: u8,
	pub auto_captured: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UserSlot {
	pub id: FixedStr<USER_ID_LEN>,
	pub email: FixedStr<USER_EMAIL_LEN>,
	pub name: FixedStr<USER_NAME_LEN>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ContextSlot {
	pub value: FixedStr<CONTEXT_LEN>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AppSlot {
	pub release_stage: FixedStr<RELEASE_STAGE_LEN>,
	pub version: FixedStr<APP_VERSION_LEN>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct BreadcrumbSlot {
	pub timestamp_millis: i64,
	pub kind: u8,
	pub message: FixedStr<BREADCRUMB_MESSAGE_LEN>,
}

/// Ring of mirrored breadcrumbs. `next` is the slot the next push writes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BreadcrumbRingSlot {
	pub next: u32,
	pub count: u32,
	pub entries: [BreadcrumbSlot; BREADCRUMB_SLOTS],
}

impl BreadcrumbRingSlot {
	pub fn push(&mut self, timestamp_millis: i64, kind: u8, message: &str) {
		let index = (self.next as usize) % BREADCRUMB_SLOTS;
		let slot = &mut self.entries[index];
		slot.timestamp_millis = timestamp_millis;
		slot.kind = kind;
		slot.message.set(message);
		self.next = ((index + 1) % BREADCRUMB_SLOTS) as u32;
		self.count = (self.count.saturating_add(1)).min(BREADCRUMB_SLOTS as u32);
	}

	/// Iterates stored entries oldest first.
	pub fn iter(&self) -> impl Iterator<Item = &BreadcrumbSlot> {
		let count = (self.count as usize).min(BREADCRUMB_SLOTS);
		let next = (self.next as usize) % BREADCRUMB_SLOTS;
		let start = (next + BREADCRUMB_SLOTS - count) % BREADCRUMB_SLOTS;
		(0..count).map(move |i| &self.entries[(start + i) % BREADCRUMB_SLOTS])
	}

	pub fn clear(&mut self) {
		self.next = 0;
		self.count = 0;
	}
}

#[repr(C)]
pub struct BridgeLayout {
	pub header: Header,
	pub crash: CrashSlot,
	pub session: SessionSlot,
	pub user: UserSlot,
	pub context: ContextSlot,
	pub app: AppSlot,
	pub breadcrumbs: BreadcrumbRingSlot,
}

impl BridgeLayout {
	pub const SIZE: usize = std::mem::size_of::<BridgeLayout>();

	/// Stamps the header and clears every slot.
	pub fn initialize(&mut self) {
		self.header.marker.store(MARKER_EMPTY, Ordering::Release);
		self.header.version = FORMAT_VERSION;
		self.header.total_size = Self::SIZE as u32;
		self.header.crash_offset = offset_of!(BridgeLayout, crash) as u32;
		self.header.session_offset = offset_of!(BridgeLayout, session) as u32;
		self.header.user_offset = offset_of!(BridgeLayout, user) as u32;
		self.header.context_offset = offset_of!(BridgeLayout, context) as u32;
		self.header.app_offset = offset_of!(BridgeLayout, app) as u32;
		self.header.breadcrumbs_offset = offset_of!(BridgeLayout, breadcrumbs) as u32;

		self.crash.frame_count = 0;
		self.session.active = 0;
		self.session.auto_captured = 0;
		self.session.id.clear();
		self.user.id.clear();
		self.user.email.clear();
		self.user.name.clear();
		self.context.value.clear();
		self.app.release_stage.clear();
		self.app.version.clear();
		self.breadcrumbs.clear();

		self.header.magic = MAGIC;
	}

	/// True when the header was written by this format version.
	pub fn is_valid(&self) -> bool {
		self.header.magic == MAGIC
			&& self.header.version == FORMAT_VERSION
			&& self.header.total_size == Self::SIZE as u32
			&& self.header.crash_offset == offset_of!(BridgeLayout, crash) as u32
			&& self.header.breadcrumbs_offset == offset_of!(BridgeLayout, breadcrumbs) as u32
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn fixed_str_truncates_on_char_boundary(s in "\\PC{0,200}") {
			let mut fixed = FixedStr::<CONTEXT_LEN>::empty();
			fixed.set(&s);
			let decoded = fixed.to_string_lossy();
			prop_assert!(decoded.len() <= CONTEXT_LEN);
			prop_assert!(s.starts_with(&decoded));
		}
	}

	#[test]
	fn fixed_str_option() {
		let mut fixed = FixedStr::<8>::empty();
		assert_eq!(fixed.to_option(), None);
		fixed.set_option(Some("main"));
		assert_eq!(fixed.to_option().as_deref(), Some("main"));
		fixed.set_option(None);
		assert!(fixed.is_empty());
	}

	#[test]
	fn corrupt_length_is_clamped() {
		let mut fixed = FixedStr::<4>::empty();
		fixed.set("abcd");
		fixed.len = 900;
		assert_eq!(fixed.to_string_lossy(), "abcd");
	}

	#[test]
	fn breadcrumb_ring_keeps_most_recent() {
		let mut ring: BreadcrumbRingSlot = unsafe { std::mem::zeroed() };
		for i in 0..(BREADCRUMB_SLOTS + 5) {
			ring.push(i as i64, 0, &format!("crumb {i}"));
		}
		let messages: Vec<String> = ring.iter().map(|c| c.message.to_string_lossy()).collect();
		assert_eq!(messages.len(), BREADCRUMB_SLOTS);
		assert_eq!(messages[0], "crumb 5");
		assert_eq!(messages[BREADCRUMB_SLOTS - 1], format!("crumb {}", BREADCRUMB_SLOTS + 4));
	}

	#[test]
	fn initialize_stamps_header() {
		let mut layout: Box<BridgeLayout> = Box::new(unsafe { std::mem::zeroed() });
		assert!(!layout.is_valid());
		layout.initialize();
		assert!(layout.is_valid());
		assert_eq!(layout.header.marker.load(Ordering::Acquire), MARKER_EMPTY);
	}
}
