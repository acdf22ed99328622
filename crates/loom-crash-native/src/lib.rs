// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Native crash capture bridge for the Loom crash client.
//!
//! A fault handler running without the usual runtime guarantees cannot
//! allocate, lock or serialize. This crate gives it a fixed, pre-allocated
//! region to write into instead:
//!
//! - the managed client mirrors session, user, context, app and breadcrumb
//!   state into the region on every change
//! - a fatal signal handler records the signal, fault address and frames and
//!   then flips a completion marker
//! - on the next launch the client reads the record with
//!   [`NativeBridge::peek_pending`], persists it through its normal store
//!   and delivery path, and only then calls [`NativeBridge::clear_pending`]
//!
//! # Example
//!
//! ```no_run
//! use loom_crash_native::NativeBridge;
//!
//! let bridge = NativeBridge::open("/var/cache/app/native/crash.bin")?;
//! if let Some(record) = bridge.peek_pending() {
//!     println!("previous run died with signal {}", record.signal);
//!     bridge.clear_pending();
//! }
//! # Ok::<(), loom_crash_native::NativeBridgeError>(())
//! ```

pub mod bridge;
pub mod error;
pub mod layout;
mod region;
pub mod signal;

pub use bridge::{
	MirroredBreadcrumb, MirroredSession, MirroredUser, NativeBridge, NativeCrashRecord, PendingState,
};
pub use error::{NativeBridgeError, Result};
pub use signal::{install_signal_handlers, signal_description, signal_name, SignalHandlerGuard};
