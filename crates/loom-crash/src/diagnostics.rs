// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reports failures of the SDK itself to the collector.
//!
//! These reports bypass callbacks, breadcrumbs, sessions and the disk queue,
//! and are dropped if the delivery queue rejects them.

use std::sync::{Arc, Weak};

use loom_crash_core::{Event, Exception, Notifier, SeverityReason, Stacktrace};
use serde_json::Value;
use tracing::debug;

use crate::context::ContextProvider;
use crate::dispatch::Dispatcher;
use crate::store::{StoreDiagnostics, StoreFailure};

pub const DIAGNOSTICS_TAB: &str = "LoomCrashDiagnostics";

pub struct InternalReporter {
	dispatcher: Weak<Dispatcher>,
	context: Arc<dyn ContextProvider>,
	notifier: Notifier,
	api_key: String,
	release_stage: String,
}

impl InternalReporter {
	pub fn new(
		dispatcher: Weak<Dispatcher>,
		context: Arc<dyn ContextProvider>,
		notifier: Notifier,
		api_key: impl Into<String>,
		release_stage: impl Into<String>,
	) -> Self {
		Self {
			dispatcher,
			context,
			notifier,
			api_key: api_key.into(),
			release_stage: release_stage.into(),
		}
	}

	pub(crate) fn store_failure_event(&self, failure: &StoreFailure) -> Event {
		let mut event = Event::new(
			vec![Exception::new("StoreWriteError", failure.error.clone(), Stacktrace::default())],
			SeverityReason::HandledError,
		);
		event.context = Some("Event store write".to_string());
		event.release_stage = self.release_stage.clone();
		event.app = self.context.app();
		event.device = self.context.device();

		let tab = [
			("canRead", Value::from(failure.can_read)),
			("canWrite", Value::from(failure.can_write)),
			("exists", Value::from(failure.exists)),
			("filename", Value::from(failure.filename.clone())),
			("fileLength", Value::from(failure.file_length)),
			("notifierName", Value::from(self.notifier.name.clone())),
			("notifierVersion", Value::from(self.notifier.version.clone())),
			("apiKey", Value::from(self.api_key.clone())),
		];
		for (key, value) in tab {
			event.add_metadata(DIAGNOSTICS_TAB, key, value);
		}
		event
	}
}

impl StoreDiagnostics for InternalReporter {
	fn on_write_failure(&self, failure: StoreFailure) {
		let Some(dispatcher) = self.dispatcher.upgrade() else {
			debug!("dispatcher gone, dropping store diagnostics");
			return;
		};
		dispatcher.deliver_internal(self.store_failure_event(&failure));
	}
}
