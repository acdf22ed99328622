// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Panic hook integration for automatic crash reporting.

use std::cell::Cell;
use std::panic::{self, PanicHookInfo};
use std::sync::Weak;
use std::thread;

use tracing::warn;

use crate::backtrace::render_backtrace;
use crate::callbacks::{in_user_callback, panic_message};

/// A captured panic, as handed to the reporter.
#[derive(Debug, Clone)]
pub struct PanicDetails {
	pub message: String,
	pub location: Option<String>,
	pub thread: Option<String>,
	/// `{:#}` rendering of the panicking thread's stack.
	pub backtrace: String,
}

/// Receives panics from the installed hook.
pub trait PanicReporter: Send + Sync {
	fn report_panic(&self, details: PanicDetails);
}

thread_local! {
	static REPORTING: Cell<bool> = const { Cell::new(false) };
}

struct ReportingGuard;

impl ReportingGuard {
	fn enter() -> Option<Self> {
		REPORTING.with(|flag| (!flag.replace(true)).then_some(Self))
	}
}

impl Drop for ReportingGuard {
	fn drop(&mut self) {
		REPORTING.with(|flag| flag.set(false));
	}
}

/// Installs a hook that reports panics to `reporter`, then runs the
/// previously installed hook.
///
/// The hook holds the reporter weakly, so dropping the client turns it into a
/// pass-through. Panics raised by user callbacks, and panics raised while a
/// panic is already being reported on the same thread, are not reported.
pub fn install_panic_hook(reporter: Weak<dyn PanicReporter>) {
	let previous = panic::take_hook();

	panic::set_hook(Box::new(move |info| {
		if !in_user_callback() {
			if let Some(reporter) = reporter.upgrade() {
				if let Some(_guard) = ReportingGuard::enter() {
					report_off_thread(reporter.as_ref(), details(info));
				}
			}
		}
		previous(info);
	}));
}

/// Any panic raised on a thread while its panic hook runs aborts the process,
/// even one caught by `catch_unwind`. The report, which runs user callbacks
/// and subscribers, therefore runs on a helper thread that is joined before
/// the hook returns.
fn report_off_thread(reporter: &dyn PanicReporter, details: PanicDetails) {
	thread::scope(|scope| {
		let spawned = thread::Builder::new()
			.name("loom-crash-panic".to_string())
			.spawn_scoped(scope, move || {
				let _guard = ReportingGuard::enter();
				reporter.report_panic(details);
			});
		match spawned {
			Ok(handle) => {
				if handle.join().is_err() {
					warn!("panic report failed");
				}
			}
			Err(err) => warn!(error = %err, "failed to spawn panic reporter thread"),
		}
	});
}

fn details(info: &PanicHookInfo<'_>) -> PanicDetails {
	PanicDetails {
		message: panic_message(info.payload()),
		location: info
			.location()
			.map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
		thread: thread::current().name().map(str::to_string),
		backtrace: render_backtrace(),
	}
}
