// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery of reports to the collector.
//!
//! [`Delivery`] is the transport seam: it takes one payload and returns a
//! [`DeliveryStatus`]. [`HttpDelivery`] is the default reqwest implementation.
//! [`DeliveryEngine`] sits on top and decides what happens to an event after
//! each outcome (breadcrumb, persist, or drop) and drains the on-disk queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use loom_crash_core::{Breadcrumb, BreadcrumbType, Event, Notifier, Report, SessionReport, PAYLOAD_VERSION};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::breadcrumbs::BreadcrumbRing;
use crate::bus::{EventBus, StateEvent};
use crate::error::{is_retryable_status, DeliveryError};
use crate::store::EventStore;

pub const HEADER_API_KEY: &str = "Loom-Crash-Api-Key";
pub const HEADER_PAYLOAD_VERSION: &str = "Loom-Crash-Payload-Version";
pub const HEADER_SENT_AT: &str = "Loom-Crash-Sent-At";
pub const HEADER_INTEGRITY: &str = "Loom-Crash-Integrity";
pub const HEADER_INTERNAL_ERROR: &str = "Loom-Crash-Internal-Error";

/// Payload version announced for session reports.
pub const SESSION_PAYLOAD_VERSION: &str = "1.0";

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
	/// Accepted by the collector.
	Delivered,
	/// Transient failure; the payload should be kept and retried.
	Undelivered,
	/// Permanent rejection; the payload should be dropped.
	Failure,
}

/// Maps an HTTP status to a delivery outcome.
pub fn classify_status(status: u16) -> DeliveryStatus {
	if (200..300).contains(&status) {
		DeliveryStatus::Delivered
	} else if is_retryable_status(status) {
		DeliveryStatus::Undelivered
	} else {
		DeliveryStatus::Failure
	}
}

/// Where and with which headers a payload is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryParams {
	pub endpoint: String,
	pub headers: Vec<(String, String)>,
}

impl DeliveryParams {
	pub fn events(endpoint: impl Into<String>, api_key: &str) -> Self {
		Self {
			endpoint: endpoint.into(),
			headers: vec![
				(HEADER_API_KEY.to_string(), api_key.to_string()),
				(HEADER_PAYLOAD_VERSION.to_string(), PAYLOAD_VERSION.to_string()),
			],
		}
	}

	pub fn sessions(endpoint: impl Into<String>, api_key: &str) -> Self {
		Self {
			endpoint: endpoint.into(),
			headers: vec![
				(HEADER_API_KEY.to_string(), api_key.to_string()),
				(HEADER_PAYLOAD_VERSION.to_string(), SESSION_PAYLOAD_VERSION.to_string()),
			],
		}
	}

	/// Reports about the SDK itself carry no API key.
	pub fn internal(endpoint: impl Into<String>) -> Self {
		Self {
			endpoint: endpoint.into(),
			headers: vec![
				(HEADER_PAYLOAD_VERSION.to_string(), PAYLOAD_VERSION.to_string()),
				(HEADER_INTERNAL_ERROR.to_string(), "true".to_string()),
			],
		}
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self
			.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}
}

/// Transport for event and session payloads.
#[async_trait]
pub trait Delivery: Send + Sync {
	async fn deliver(&self, report: &Report, params: &DeliveryParams) -> DeliveryStatus;

	async fn deliver_session(&self, report: &SessionReport, params: &DeliveryParams) -> DeliveryStatus;
}

/// JSON over HTTP POST.
pub struct HttpDelivery {
	client: reqwest::Client,
}

impl HttpDelivery {
	pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.user_agent(concat!("loom-crash-rust/", env!("CARGO_PKG_VERSION")))
			.build()?;
		Ok(Self { client })
	}

	async fn post<T: Serialize + Sync>(&self, payload: &T, params: &DeliveryParams) -> DeliveryStatus {
		match self.try_post(payload, params).await {
			Ok(status) => {
				let outcome = classify_status(status);
				debug!(endpoint = %params.endpoint, status, ?outcome, "payload posted");
				outcome
			}
			Err(err) => {
				let outcome = if err.is_retryable() {
					DeliveryStatus::Undelivered
				} else {
					DeliveryStatus::Failure
				};
				warn!(endpoint = %params.endpoint, error = %err, ?outcome, "payload delivery failed");
				outcome
			}
		}
	}

	async fn try_post<T: Serialize + Sync>(&self, payload: &T, params: &DeliveryParams) -> Result<u16, DeliveryError> {
		let body = serde_json::to_vec(payload)?;
		let integrity = format!("sha256 {}", hex::encode(Sha256::digest(&body)));

		let mut request = self
			.client
			.post(&params.endpoint)
			.header(CONTENT_TYPE, "application/json")
			.header(HEADER_SENT_AT, Utc::now().to_rfc3339())
			.header(HEADER_INTEGRITY, integrity);
		for (name, value) in &params.headers {
			request = request.header(name.as_str(), value.as_str());
		}

		let response = request.body(body).send().await?;
		Ok(response.status().as_u16())
	}
}

#[async_trait]
impl Delivery for HttpDelivery {
	async fn deliver(&self, report: &Report, params: &DeliveryParams) -> DeliveryStatus {
		self.post(report, params).await
	}

	async fn deliver_session(&self, report: &SessionReport, params: &DeliveryParams) -> DeliveryStatus {
		self.post(report, params).await
	}
}

/// Counts from one pass over the on-disk queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
	pub delivered: usize,
	pub discarded: usize,
	pub retained: usize,
}

pub struct DeliveryEngine {
	delivery: Arc<dyn Delivery>,
	store: Arc<EventStore>,
	breadcrumbs: Arc<BreadcrumbRing>,
	bus: Arc<EventBus>,
	notifier: Notifier,
	api_key: String,
	event_params: DeliveryParams,
	session_params: DeliveryParams,
	internal_params: DeliveryParams,
	record_error_breadcrumbs: bool,
	flush_lock: tokio::sync::Mutex<()>,
}

impl DeliveryEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		delivery: Arc<dyn Delivery>,
		store: Arc<EventStore>,
		breadcrumbs: Arc<BreadcrumbRing>,
		bus: Arc<EventBus>,
		notifier: Notifier,
		api_key: String,
		endpoint: &str,
		sessions_endpoint: &str,
		record_error_breadcrumbs: bool,
	) -> Self {
		Self {
			event_params: DeliveryParams::events(endpoint, &api_key),
			session_params: DeliveryParams::sessions(sessions_endpoint, &api_key),
			internal_params: DeliveryParams::internal(endpoint),
			delivery,
			store,
			breadcrumbs,
			bus,
			notifier,
			api_key,
			record_error_breadcrumbs,
			flush_lock: tokio::sync::Mutex::new(()),
		}
	}

	pub fn store(&self) -> &Arc<EventStore> {
		&self.store
	}

	pub fn notifier(&self) -> &Notifier {
		&self.notifier
	}

	/// Sends one event. Delivered leaves an error breadcrumb, Undelivered
	/// persists the event for a later flush, Failure drops it.
	pub async fn deliver_event(&self, event: Event) -> DeliveryStatus {
		let report = Report::single(&self.api_key, self.notifier.clone(), event);
		let status = self.delivery.deliver(&report, &self.event_params).await;
		let Some(event) = report.events.first() else {
			return status;
		};

		match status {
			DeliveryStatus::Delivered => {
				info!(event_id = %event.id, "event delivered");
				self.leave_error_breadcrumb(event);
			}
			DeliveryStatus::Undelivered => {
				info!(event_id = %event.id, "event undelivered, persisting for retry");
				self.store.write(event);
				self.leave_error_breadcrumb(event);
			}
			DeliveryStatus::Failure => {
				warn!(event_id = %event.id, "event rejected by collector, dropping");
			}
		}
		status
	}

	/// Attempts every persisted event oldest first. Stops at the first
	/// Undelivered so order is kept for the next attempt.
	pub async fn flush_stored(&self) -> FlushSummary {
		let _guard = self.flush_lock.lock().await;
		let mut summary = FlushSummary::default();
		let records = self.store.find_all();
		let total = records.len();

		for (index, path) in records.into_iter().enumerate() {
			let event = match self.store.read(&path) {
				Ok(event) => event,
				Err(err) => {
					warn!(path = %path.display(), error = %err, "discarding unreadable event record");
					self.store.delete(&path);
					summary.discarded += 1;
					continue;
				}
			};

			let report = Report::single(&self.api_key, self.notifier.clone(), event);
			match self.delivery.deliver(&report, &self.event_params).await {
				DeliveryStatus::Delivered => {
					self.store.delete(&path);
					summary.delivered += 1;
				}
				DeliveryStatus::Failure => {
					warn!(path = %path.display(), "persisted event rejected by collector, dropping");
					self.store.delete(&path);
					summary.discarded += 1;
				}
				DeliveryStatus::Undelivered => {
					summary.retained = total - index;
					break;
				}
			}
		}

		if total > 0 {
			info!(
				delivered = summary.delivered,
				discarded = summary.discarded,
				retained = summary.retained,
				"flushed persisted events"
			);
		}
		summary
	}

	pub async fn deliver_session(&self, report: SessionReport) -> DeliveryStatus {
		let status = self.delivery.deliver_session(&report, &self.session_params).await;
		debug!(sessions = report.sessions.len(), ?status, "session report sent");
		status
	}

	/// Best effort. Never persisted and never breadcrumbed.
	pub async fn deliver_internal(&self, event: Event) -> DeliveryStatus {
		let report = Report::single("", self.notifier.clone(), event);
		let status = self.delivery.deliver(&report, &self.internal_params).await;
		debug!(?status, "internal diagnostics sent");
		status
	}

	fn leave_error_breadcrumb(&self, event: &Event) {
		if !self.record_error_breadcrumbs {
			return;
		}
		let class = event.error_class().unwrap_or("Error").to_string();
		let mut metadata = Map::new();
		metadata.insert("errorClass".to_string(), Value::from(class.clone()));
		metadata.insert(
			"message".to_string(),
			Value::from(event.error_message().unwrap_or_default()),
		);
		metadata.insert("unhandled".to_string(), Value::from(event.unhandled));
		metadata.insert("severity".to_string(), serde_json::to_value(event.severity).unwrap_or(Value::Null));

		let breadcrumb = Breadcrumb::new(class, BreadcrumbType::Error, metadata);
		self.breadcrumbs.push(breadcrumb.clone());
		self.bus.publish(&StateEvent::BreadcrumbAdded(breadcrumb));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_crash_core::{Exception, SeverityReason, Stacktrace};
	use std::collections::VecDeque;
	use std::sync::Mutex;
	use tempfile::TempDir;
	use wiremock::matchers::{header, header_exists, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn event(message: &str) -> Event {
		Event::new(
			vec![Exception::new("IoError", message, Stacktrace::default())],
			SeverityReason::HandledError,
		)
	}

	fn notifier() -> Notifier {
		Notifier::new("loom-crash-rust", "0.0.0-test", "https://loom.ghuntley.com")
	}

	#[test]
	fn classify_statuses() {
		assert_eq!(classify_status(200), DeliveryStatus::Delivered);
		assert_eq!(classify_status(202), DeliveryStatus::Delivered);
		assert_eq!(classify_status(429), DeliveryStatus::Undelivered);
		assert_eq!(classify_status(503), DeliveryStatus::Undelivered);
		assert_eq!(classify_status(400), DeliveryStatus::Failure);
		assert_eq!(classify_status(401), DeliveryStatus::Failure);
	}

	#[test]
	fn internal_params_have_no_api_key() {
		let params = DeliveryParams::internal("https://example.com");
		assert!(params.header(HEADER_API_KEY).is_none());
		assert_eq!(params.header(HEADER_INTERNAL_ERROR), Some("true"));

		let params = DeliveryParams::events("https://example.com", "key");
		assert_eq!(params.header("loom-crash-api-key"), Some("key"));
	}

	#[tokio::test]
	async fn http_delivery_sends_headers_and_integrity() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/"))
			.and(header(HEADER_API_KEY, "test-key"))
			.and(header(HEADER_PAYLOAD_VERSION, PAYLOAD_VERSION))
			.and(header_exists(HEADER_SENT_AT))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let delivery = HttpDelivery::new(Duration::from_secs(5)).unwrap();
		let report = Report::single("test-key", notifier(), event("boom"));
		let params = DeliveryParams::events(format!("{}/", server.uri()), "test-key");

		assert_eq!(delivery.deliver(&report, &params).await, DeliveryStatus::Delivered);

		let requests = server.received_requests().await.unwrap();
		let integrity = requests[0]
			.headers
			.get(HEADER_INTEGRITY)
			.unwrap()
			.to_str()
			.unwrap()
			.to_string();
		let expected = format!("sha256 {}", hex::encode(Sha256::digest(&requests[0].body)));
		assert_eq!(integrity, expected);

		let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
		assert_eq!(body["apiKey"], "test-key");
		assert_eq!(body["events"][0]["exceptions"][0]["errorClass"], "IoError");
	}

	#[tokio::test]
	async fn http_delivery_classifies_responses() {
		let server = MockServer::start().await;
		Mock::given(path("/retry"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server)
			.await;
		Mock::given(path("/reject"))
			.respond_with(ResponseTemplate::new(400))
			.mount(&server)
			.await;

		let delivery = HttpDelivery::new(Duration::from_secs(5)).unwrap();
		let report = Report::single("k", notifier(), event("boom"));

		let retry = DeliveryParams::events(format!("{}/retry", server.uri()), "k");
		assert_eq!(delivery.deliver(&report, &retry).await, DeliveryStatus::Undelivered);

		let reject = DeliveryParams::events(format!("{}/reject", server.uri()), "k");
		assert_eq!(delivery.deliver(&report, &reject).await, DeliveryStatus::Failure);
	}

	#[tokio::test]
	async fn connection_failure_is_undelivered() {
		let delivery = HttpDelivery::new(Duration::from_secs(2)).unwrap();
		let report = Report::single("k", notifier(), event("boom"));
		let params = DeliveryParams::events("http://127.0.0.1:1/", "k");
		assert_eq!(delivery.deliver(&report, &params).await, DeliveryStatus::Undelivered);
	}

	/// Replies with queued statuses, then Delivered.
	#[derive(Default)]
	struct ScriptedDelivery {
		script: Mutex<VecDeque<DeliveryStatus>>,
		seen: Mutex<Vec<Report>>,
	}

	impl ScriptedDelivery {
		fn with(statuses: &[DeliveryStatus]) -> Arc<Self> {
			Arc::new(Self {
				script: Mutex::new(statuses.iter().copied().collect()),
				seen: Mutex::new(Vec::new()),
			})
		}
	}

	#[async_trait]
	impl Delivery for ScriptedDelivery {
		async fn deliver(&self, report: &Report, _params: &DeliveryParams) -> DeliveryStatus {
			self.seen.lock().unwrap().push(report.clone());
			self
				.script
				.lock()
				.unwrap()
				.pop_front()
				.unwrap_or(DeliveryStatus::Delivered)
		}

		async fn deliver_session(&self, _report: &SessionReport, _params: &DeliveryParams) -> DeliveryStatus {
			DeliveryStatus::Delivered
		}
	}

	fn engine(delivery: Arc<ScriptedDelivery>, dir: &TempDir) -> (DeliveryEngine, Arc<BreadcrumbRing>) {
		let store = Arc::new(EventStore::open(dir.path(), 10).unwrap());
		let ring = Arc::new(BreadcrumbRing::new(25));
		let engine = DeliveryEngine::new(
			delivery,
			store,
			Arc::clone(&ring),
			Arc::new(EventBus::new()),
			notifier(),
			"key".to_string(),
			"https://notify.example.com",
			"https://sessions.example.com",
			true,
		);
		(engine, ring)
	}

	#[tokio::test]
	async fn delivered_event_leaves_error_breadcrumb() {
		let dir = TempDir::new().unwrap();
		let (engine, ring) = engine(ScriptedDelivery::with(&[]), &dir);

		assert_eq!(engine.deliver_event(event("boom")).await, DeliveryStatus::Delivered);
		let crumbs = ring.snapshot();
		assert_eq!(crumbs.len(), 1);
		assert_eq!(crumbs[0].kind, BreadcrumbType::Error);
		assert_eq!(crumbs[0].message, "IoError");
		assert_eq!(crumbs[0].metadata["message"], "boom");
		assert!(engine.store().is_empty());
	}

	#[tokio::test]
	async fn undelivered_event_is_persisted_failure_is_dropped() {
		let dir = TempDir::new().unwrap();
		let (engine, _) = engine(
			ScriptedDelivery::with(&[DeliveryStatus::Undelivered, DeliveryStatus::Failure]),
			&dir,
		);

		engine.deliver_event(event("kept")).await;
		engine.deliver_event(event("dropped")).await;

		let stored = engine.store().find_all();
		assert_eq!(stored.len(), 1);
		assert_eq!(engine.store().read(&stored[0]).unwrap().error_message(), Some("kept"));
	}

	#[tokio::test]
	async fn flush_stops_at_first_undelivered() {
		let dir = TempDir::new().unwrap();
		let delivery = ScriptedDelivery::with(&[
			DeliveryStatus::Delivered,
			DeliveryStatus::Failure,
			DeliveryStatus::Undelivered,
		]);
		let (engine, _) = engine(Arc::clone(&delivery), &dir);

		for i in 0..4 {
			let mut e = event(&format!("e{i}"));
			e.timestamp = Utc::now() + chrono::Duration::milliseconds(i * 10);
			engine.store().write(&e);
		}

		let summary = engine.flush_stored().await;
		assert_eq!(
			summary,
			FlushSummary {
				delivered: 1,
				discarded: 1,
				retained: 2
			}
		);
		assert_eq!(engine.store().len(), 2);

		let summary = engine.flush_stored().await;
		assert_eq!(summary.delivered, 2);
		assert!(engine.store().is_empty());

		let order: Vec<String> = delivery
			.seen
			.lock()
			.unwrap()
			.iter()
			.map(|r| r.events[0].error_message().unwrap().to_string())
			.collect();
		assert_eq!(order, vec!["e0", "e1", "e2", "e2", "e3"]);
	}

	#[tokio::test]
	async fn flush_discards_corrupt_records() {
		let dir = TempDir::new().unwrap();
		let (engine, _) = engine(ScriptedDelivery::with(&[]), &dir);
		std::fs::write(dir.path().join("00000000000000000001_bad.json"), b"{").unwrap();

		let summary = engine.flush_stored().await;
		assert_eq!(summary.discarded, 1);
		assert!(engine.store().is_empty());
	}

	#[tokio::test]
	async fn persisted_event_replays_identically() {
		let dir = TempDir::new().unwrap();
		let delivery = ScriptedDelivery::with(&[DeliveryStatus::Undelivered]);
		let (engine, _) = engine(Arc::clone(&delivery), &dir);

		engine.deliver_event(event("replay")).await;
		engine.flush_stored().await;

		let seen = delivery.seen.lock().unwrap();
		assert_eq!(seen.len(), 2);
		assert_eq!(
			serde_json::to_value(&seen[0]).unwrap(),
			serde_json::to_value(&seen[1]).unwrap()
		);
	}
}
