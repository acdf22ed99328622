// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loom_crash::delivery::{DeliveryParams, DeliveryStatus, HEADER_INTERNAL_ERROR};
use loom_crash::{CrashClientBuilder, Delivery, Event, Report, SessionReport};
use tempfile::TempDir;

pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process collector. While offline every attempt is `Undelivered`.
pub struct MockDelivery {
	online: AtomicBool,
	attempts: AtomicUsize,
	reports: Mutex<Vec<Report>>,
	internal: Mutex<Vec<Report>>,
	sessions: Mutex<Vec<SessionReport>>,
}

impl MockDelivery {
	pub fn online() -> Arc<Self> {
		Arc::new(Self::with_state(true))
	}

	pub fn offline() -> Arc<Self> {
		Arc::new(Self::with_state(false))
	}

	fn with_state(online: bool) -> Self {
		Self {
			online: AtomicBool::new(online),
			attempts: AtomicUsize::new(0),
			reports: Mutex::new(Vec::new()),
			internal: Mutex::new(Vec::new()),
			sessions: Mutex::new(Vec::new()),
		}
	}

	pub fn set_online(&self, online: bool) {
		self.online.store(online, Ordering::SeqCst);
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}

	pub fn events(&self) -> Vec<Event> {
		self.reports
			.lock()
			.unwrap()
			.iter()
			.flat_map(|report| report.events.clone())
			.collect()
	}

	pub fn reports(&self) -> Vec<Report> {
		self.reports.lock().unwrap().clone()
	}

	pub fn internal_reports(&self) -> Vec<Report> {
		self.internal.lock().unwrap().clone()
	}

	pub fn session_reports(&self) -> Vec<SessionReport> {
		self.sessions.lock().unwrap().clone()
	}
}

#[async_trait]
impl Delivery for MockDelivery {
	async fn deliver(&self, report: &Report, params: &DeliveryParams) -> DeliveryStatus {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		if !self.online.load(Ordering::SeqCst) {
			return DeliveryStatus::Undelivered;
		}
		if params.header(HEADER_INTERNAL_ERROR).is_some() {
			self.internal.lock().unwrap().push(report.clone());
		} else {
			self.reports.lock().unwrap().push(report.clone());
		}
		DeliveryStatus::Delivered
	}

	async fn deliver_session(&self, report: &SessionReport, _params: &DeliveryParams) -> DeliveryStatus {
		if !self.online.load(Ordering::SeqCst) {
			return DeliveryStatus::Undelivered;
		}
		self.sessions.lock().unwrap().push(report.clone());
		DeliveryStatus::Delivered
	}
}

/// Builder with automatic panic capture and session tracking off, so tests
/// control both explicitly.
pub fn builder(dir: &TempDir, delivery: &Arc<MockDelivery>) -> CrashClientBuilder {
	let delivery: Arc<dyn Delivery> = delivery.clone();
	CrashClientBuilder::new()
		.api_key("integration-test-key")
		.endpoint("https://notify.example.com")
		.sessions_endpoint("https://sessions.example.com")
		.storage_dir(dir.path())
		.auto_detect_errors(false)
		.auto_track_sessions(false)
		.delivery(delivery)
}

/// Number of queued event files in the client's storage dir.
pub fn queued_files(dir: &TempDir) -> usize {
	std::fs::read_dir(dir.path().join(loom_crash::client::EVENTS_DIR))
		.map(|entries| {
			entries
				.filter_map(|entry| entry.ok())
				.filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
				.count()
		})
		.unwrap_or(0)
}
