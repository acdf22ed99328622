// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fatal signal handlers that feed the bridge.

/// Human-readable name for a fatal signal number.
#[cfg(unix)]
pub fn signal_name(signal: i32) -> &'static str {
	match signal {
		libc::SIGSEGV => "SIGSEGV",
		libc::SIGBUS => "SIGBUS",
		libc::SIGILL => "SIGILL",
		libc::SIGFPE => "SIGFPE",
		libc::SIGABRT => "SIGABRT",
		libc::SIGTRAP => "SIGTRAP",
		_ => "SIGNAL",
	}
}

#[cfg(not(unix))]
pub fn signal_name(_signal: i32) -> &'static str {
	"SIGNAL"
}

/// Short description of a fatal signal.
pub fn signal_description(signal: i32) -> &'static str {
	match signal_name(signal) {
		"SIGSEGV" => "Segmentation violation (invalid memory reference)",
		"SIGBUS" => "Bus error (bad memory access)",
		"SIGILL" => "Illegal instruction",
		"SIGFPE" => "Floating-point exception",
		"SIGABRT" => "Abort program",
		"SIGTRAP" => "Trace/breakpoint trap",
		_ => "Fatal signal",
	}
}

#[cfg(target_os = "linux")]
pub use imp::{install_signal_handlers, SignalHandlerGuard, FATAL_SIGNALS};

#[cfg(target_os = "linux")]
mod imp {
	use std::ptr;
	use std::sync::atomic::{AtomicPtr, Ordering};
	use std::sync::Arc;

	use libc::{c_int, c_void, siginfo_t};
	use tracing::debug;

	use crate::bridge::NativeBridge;
	use crate::error::{NativeBridgeError, Result};

	pub const FATAL_SIGNALS: [c_int; 6] = [
		libc::SIGSEGV,
		libc::SIGBUS,
		libc::SIGILL,
		libc::SIGFPE,
		libc::SIGABRT,
		libc::SIGTRAP,
	];

	/// Owned `Arc<NativeBridge>` leaked into a raw pointer while installed.
	static ACTIVE_BRIDGE: AtomicPtr<NativeBridge> = AtomicPtr::new(ptr::null_mut());

	/// Restores the previous dispositions and releases the bridge on drop.
	pub struct SignalHandlerGuard {
		previous: Vec<(c_int, libc::sigaction)>,
	}

	// SAFETY: the saved sigaction values are plain data.
	unsafe impl Send for SignalHandlerGuard {}
	unsafe impl Sync for SignalHandlerGuard {}

	impl std::fmt::Debug for SignalHandlerGuard {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("SignalHandlerGuard")
				.field("signals", &self.previous.len())
				.finish()
		}
	}

	/// Installs handlers for [`FATAL_SIGNALS`] that record into `bridge`.
	///
	/// Only one set of handlers may be installed per process.
	pub fn install_signal_handlers(bridge: Arc<NativeBridge>) -> Result<SignalHandlerGuard> {
		let raw = Arc::into_raw(bridge) as *mut NativeBridge;
		if ACTIVE_BRIDGE
			.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			// SAFETY: `raw` came from Arc::into_raw above and was not published.
			unsafe { drop(Arc::from_raw(raw)) };
			return Err(NativeBridgeError::AlreadyInstalled);
		}

		let mut previous = Vec::with_capacity(FATAL_SIGNALS.len());
		for &signal in &FATAL_SIGNALS {
			// SAFETY: installs a handler that only performs async-signal-safe work.
			match unsafe { install_one(signal) } {
				Ok(old) => previous.push((signal, old)),
				Err(source) => {
					restore(&previous);
					release_bridge();
					return Err(NativeBridgeError::Signal { signal, source });
				}
			}
		}

		debug!(signals = previous.len(), "installed native fault handlers");
		Ok(SignalHandlerGuard { previous })
	}

	impl Drop for SignalHandlerGuard {
		fn drop(&mut self) {
			restore(&self.previous);
			release_bridge();
			debug!("removed native fault handlers");
		}
	}

	unsafe fn install_one(signal: c_int) -> std::io::Result<libc::sigaction> {
		let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = handle_fatal_signal;

		let mut action: libc::sigaction = std::mem::zeroed();
		action.sa_sigaction = handler as libc::sighandler_t;
		action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND | libc::SA_ONSTACK;
		libc::sigemptyset(&mut action.sa_mask);

		let mut old: libc::sigaction = std::mem::zeroed();
		if libc::sigaction(signal, &action, &mut old) != 0 {
			return Err(std::io::Error::last_os_error());
		}
		Ok(old)
	}

	fn restore(previous: &[(c_int, libc::sigaction)]) {
		for (signal, old) in previous {
			// SAFETY: `old` was returned by sigaction for this signal.
			unsafe {
				libc::sigaction(*signal, old, ptr::null_mut());
			}
		}
	}

	fn release_bridge() {
		let raw = ACTIVE_BRIDGE.swap(ptr::null_mut(), Ordering::AcqRel);
		if !raw.is_null() {
			// SAFETY: the pointer was produced by Arc::into_raw in install.
			unsafe { drop(Arc::from_raw(raw)) };
		}
	}

	extern "C" fn handle_fatal_signal(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
		let bridge = ACTIVE_BRIDGE.load(Ordering::Acquire);
		if !bridge.is_null() {
			let (code, address) = if info.is_null() {
				(0, 0)
			} else {
				// SAFETY: the kernel passes a valid siginfo with SA_SIGINFO.
				unsafe { ((*info).si_code, (*info).si_addr() as u64) }
			};

			let mut frames = [0u64; 1];
			let count = match program_counter(context) {
				Some(pc) => {
					frames[0] = pc;
					1
				}
				None => 0,
			};

			// SAFETY: the bridge stays alive while it is published.
			unsafe {
				(*bridge).record_fault(signal, code, address, &frames[..count]);
			}
		}

		// SA_RESETHAND restored the default action.
		// SAFETY: raise is async-signal-safe.
		unsafe {
			libc::raise(signal);
		}
	}

	#[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
	fn program_counter(context: *mut c_void) -> Option<u64> {
		if context.is_null() {
			return None;
		}
		let uc = context as *const libc::ucontext_t;
		// SAFETY: with SA_SIGINFO the third argument is a ucontext_t.
		Some(unsafe { (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as u64 })
	}

	#[cfg(not(all(target_arch = "x86_64", target_env = "gnu")))]
	fn program_counter(_context: *mut c_void) -> Option<u64> {
		None
	}
}

#[cfg(not(target_os = "linux"))]
pub use fallback::{install_signal_handlers, SignalHandlerGuard, FATAL_SIGNALS};

#[cfg(not(target_os = "linux"))]
mod fallback {
	use std::sync::Arc;

	use crate::bridge::NativeBridge;
	use crate::error::{NativeBridgeError, Result};

	pub const FATAL_SIGNALS: [i32; 0] = [];

	#[derive(Debug)]
	pub struct SignalHandlerGuard;

	pub fn install_signal_handlers(_bridge: Arc<NativeBridge>) -> Result<SignalHandlerGuard> {
		Err(NativeBridgeError::Unsupported)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	#[cfg(target_os = "linux")]
	use crate::bridge::NativeBridge;
	#[cfg(target_os = "linux")]
	use crate::error::NativeBridgeError;
	#[cfg(target_os = "linux")]
	use std::sync::Arc;

	#[cfg(unix)]
	#[test]
	fn names_fatal_signals() {
		assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
		assert_eq!(signal_name(libc::SIGABRT), "SIGABRT");
		assert_eq!(signal_name(0), "SIGNAL");
		assert_eq!(signal_description(libc::SIGILL), "Illegal instruction");
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn install_is_exclusive_and_reversible() {
		let bridge = Arc::new(NativeBridge::in_memory());

		let guard = install_signal_handlers(Arc::clone(&bridge)).unwrap();
		assert!(matches!(
			install_signal_handlers(Arc::clone(&bridge)),
			Err(NativeBridgeError::AlreadyInstalled)
		));
		drop(guard);

		let guard = install_signal_handlers(Arc::clone(&bridge)).unwrap();
		drop(guard);
		assert_eq!(Arc::strong_count(&bridge), 1);
	}
}
