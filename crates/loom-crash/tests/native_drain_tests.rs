// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#![cfg(unix)]

mod support;

use loom_crash::native::{BRIDGE_FILE, NATIVE_DIR};
use loom_crash::{Severity, SeverityReason};
use loom_crash_native::{MirroredSession, NativeBridge};
use support::{builder, queued_files, MockDelivery, FLUSH_TIMEOUT};
use tempfile::TempDir;

const SIGSEGV: i32 = 11;

fn crash_previous_run(dir: &TempDir) {
	let native_dir = dir.path().join(NATIVE_DIR);
	std::fs::create_dir_all(&native_dir).unwrap();
	let bridge = NativeBridge::open(native_dir.join(BRIDGE_FILE)).unwrap();
	bridge.set_context(Some("Checkout"));
	bridge.set_app("beta", Some("2.0.0"));
	bridge.set_session(Some(&MirroredSession {
		id: "c0ffee00-0000-4000-8000-000000000000".to_string(),
		started_at_millis: 1_700_000_000_000,
		handled: 3,
		unhandled: 0,
		auto_captured: true,
	}));
	assert!(bridge.record_fault(SIGSEGV, 1, 0xdead, &[0x1000, 0x2000]));
}

#[test]
fn native_crash_is_delivered_exactly_once() {
	let dir = TempDir::new().unwrap();
	crash_previous_run(&dir);

	let delivery = MockDelivery::online();
	let client = builder(&dir, &delivery).native_crashes(true).build().unwrap();
	assert!(client.flush(FLUSH_TIMEOUT));

	let events = delivery.events();
	assert_eq!(events.len(), 1);
	let event = &events[0];
	assert!(event.unhandled);
	assert_eq!(event.severity, Severity::Error);
	assert_eq!(event.severity_reason, SeverityReason::Signal);
	assert_eq!(event.error_class(), Some("SIGSEGV"));
	assert_eq!(event.context.as_deref(), Some("Checkout"));
	assert_eq!(event.release_stage, "beta");
	let session = event.session.as_ref().unwrap();
	assert_eq!(session.events.handled, 3);
	assert_eq!(session.events.unhandled, 1);
	assert_eq!(queued_files(&dir), 0);
	client.close();

	let client = builder(&dir, &delivery).native_crashes(true).build().unwrap();
	assert!(client.flush(FLUSH_TIMEOUT));
	assert_eq!(delivery.events().len(), 1);
	client.close();
}

#[test]
fn offline_native_crash_waits_on_disk() {
	let dir = TempDir::new().unwrap();
	crash_previous_run(&dir);

	let delivery = MockDelivery::offline();
	let client = builder(&dir, &delivery).native_crashes(true).build().unwrap();
	assert!(client.flush(FLUSH_TIMEOUT));
	assert_eq!(queued_files(&dir), 1);

	delivery.set_online(true);
	client.on_connectivity_changed(true);
	assert!(client.flush(FLUSH_TIMEOUT));
	assert_eq!(delivery.events().len(), 1);
	assert_eq!(queued_files(&dir), 0);
	client.close();
}
