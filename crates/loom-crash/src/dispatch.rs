// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background delivery workers.
//!
//! The dispatcher owns a private multi-thread tokio runtime so the client
//! works from synchronous code and from inside another runtime alike. Jobs
//! go through a bounded queue; when it is full or closed, events fall back to
//! the on-disk store and everything else is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use loom_crash_core::{Event, SessionReport};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryEngine, FlushSummary};
use crate::error::{CrashSdkError, Result};

enum Job {
	Deliver(Event),
	Flush,
	DeliverSession(SessionReport),
	Internal(Event),
}

impl Job {
	fn name(&self) -> &'static str {
		match self {
			Self::Deliver(_) => "deliver",
			Self::Flush => "flush",
			Self::DeliverSession(_) => "session",
			Self::Internal(_) => "internal",
		}
	}
}

/// Count of queued plus running jobs, with a condvar signalled at zero.
#[derive(Default)]
struct PendingWork {
	count: Mutex<usize>,
	idle: Condvar,
}

impl PendingWork {
	fn begin(&self) {
		*self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
	}

	fn finish(&self) {
		let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
		*count = count.saturating_sub(1);
		if *count == 0 {
			self.idle.notify_all();
		}
	}

	fn wait_idle(&self, timeout: Duration) -> bool {
		let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
		let (count, _) = self
			.idle
			.wait_timeout_while(count, timeout, |count| *count > 0)
			.unwrap_or_else(PoisonError::into_inner);
		*count == 0
	}
}

/// Marks a job finished even if the worker future is cancelled.
struct FinishGuard(Arc<PendingWork>);

impl Drop for FinishGuard {
	fn drop(&mut self) {
		self.0.finish();
	}
}

pub struct Dispatcher {
	runtime: Option<Runtime>,
	handle: Handle,
	sender: Mutex<Option<mpsc::Sender<Job>>>,
	engine: Arc<DeliveryEngine>,
	pending: Arc<PendingWork>,
	closed: AtomicBool,
}

impl Dispatcher {
	pub fn start(engine: Arc<DeliveryEngine>, worker_threads: usize, queue_capacity: usize) -> Result<Self> {
		let worker_threads = worker_threads.max(1);
		let runtime = Builder::new_multi_thread()
			.worker_threads(worker_threads)
			.thread_name("loom-crash-worker")
			.enable_all()
			.build()
			.map_err(CrashSdkError::RuntimeStart)?;
		let handle = runtime.handle().clone();

		let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
		let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
		let pending = Arc::new(PendingWork::default());

		for worker in 0..worker_threads {
			let receiver = Arc::clone(&receiver);
			let engine = Arc::clone(&engine);
			let pending = Arc::clone(&pending);
			handle.spawn(async move {
				loop {
					let job = receiver.lock().await.recv().await;
					let Some(job) = job else {
						debug!(worker, "delivery queue closed, worker exiting");
						break;
					};
					let _finish = FinishGuard(Arc::clone(&pending));
					debug!(worker, job = job.name(), "running job");
					run_job(&engine, job).await;
				}
			});
		}

		info!(worker_threads, queue_capacity, "delivery workers started");
		Ok(Self {
			runtime: Some(runtime),
			handle,
			sender: Mutex::new(Some(sender)),
			engine,
			pending,
			closed: AtomicBool::new(false),
		})
	}

	pub fn engine(&self) -> &Arc<DeliveryEngine> {
		&self.engine
	}

	fn try_enqueue(&self, job: Job) -> std::result::Result<(), Job> {
		let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
		let Some(sender) = sender.as_ref() else {
			return Err(job);
		};

		self.pending.begin();
		match sender.try_send(job) {
			Ok(()) => Ok(()),
			Err(err) => {
				self.pending.finish();
				if matches!(err, TrySendError::Full(_)) {
					warn!("delivery queue full");
				}
				Err(err.into_inner())
			}
		}
	}

	/// Queues `event` for delivery. If the queue rejects it the event is
	/// written to disk instead. Returns whether it was queued.
	pub fn deliver_async(&self, event: Event) -> bool {
		match self.try_enqueue(Job::Deliver(event)) {
			Ok(()) => true,
			Err(Job::Deliver(event)) => {
				debug!(event_id = %event.id, "delivery rejected, persisting event");
				self.engine.store().write(&event);
				false
			}
			Err(_) => false,
		}
	}

	/// Queues a pass over the persisted events.
	pub fn flush_async(&self) -> bool {
		self.try_enqueue(Job::Flush).is_ok()
	}

	/// Runs a flush of persisted events and waits up to `timeout` for it.
	/// The flush keeps running in the background past the timeout.
	pub fn flush_on_launch(&self, timeout: Duration) -> Option<FlushSummary> {
		if self.closed.load(Ordering::SeqCst) {
			return None;
		}

		let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
		let engine = Arc::clone(&self.engine);
		let finish = FinishGuard(Arc::clone(&self.pending));
		self.pending.begin();
		self.handle.spawn(async move {
			let _finish = finish;
			let summary = engine.flush_stored().await;
			let _ = done_tx.send(summary);
		});

		match done_rx.recv_timeout(timeout) {
			Ok(summary) => Some(summary),
			Err(_) => {
				info!(?timeout, "launch flush still running after timeout");
				None
			}
		}
	}

	/// Session payloads are dropped if the queue rejects them.
	pub fn deliver_session(&self, report: SessionReport) -> bool {
		let queued = self.try_enqueue(Job::DeliverSession(report)).is_ok();
		if !queued {
			debug!("session report dropped");
		}
		queued
	}

	/// Internal diagnostics are dropped if the queue rejects them.
	pub fn deliver_internal(&self, event: Event) -> bool {
		let queued = self.try_enqueue(Job::Internal(event)).is_ok();
		if !queued {
			debug!("internal diagnostics dropped");
		}
		queued
	}

	/// Blocks until no job is queued or running, or `timeout` passes.
	pub fn wait_idle(&self, timeout: Duration) -> bool {
		self.pending.wait_idle(timeout)
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Stops accepting jobs and waits up to `timeout` for queued work.
	pub fn close(&self, timeout: Duration) -> bool {
		if self.closed.swap(true, Ordering::SeqCst) {
			return self.wait_idle(Duration::ZERO);
		}
		self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
		let drained = self.wait_idle(timeout);
		if !drained {
			warn!(?timeout, "delivery queue not drained before close");
		}
		drained
	}
}

impl Drop for Dispatcher {
	fn drop(&mut self) {
		self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
		if let Some(runtime) = self.runtime.take() {
			runtime.shutdown_background();
		}
	}
}

async fn run_job(engine: &DeliveryEngine, job: Job) {
	match job {
		Job::Deliver(event) => {
			engine.deliver_event(event).await;
		}
		Job::Flush => {
			engine.flush_stored().await;
		}
		Job::DeliverSession(report) => {
			engine.deliver_session(report).await;
		}
		Job::Internal(event) => {
			engine.deliver_internal(event).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::breadcrumbs::BreadcrumbRing;
	use crate::bus::EventBus;
	use crate::delivery::{Delivery, DeliveryParams, DeliveryStatus};
	use crate::store::EventStore;
	use async_trait::async_trait;
	use loom_crash_core::{Exception, Notifier, Report, SeverityReason, Stacktrace};
	use std::sync::atomic::AtomicUsize;
	use tempfile::TempDir;

	struct SlowDelivery {
		delay: Duration,
		events: AtomicUsize,
		sessions: AtomicUsize,
	}

	#[async_trait]
	impl Delivery for SlowDelivery {
		async fn deliver(&self, _report: &Report, _params: &DeliveryParams) -> DeliveryStatus {
			tokio::time::sleep(self.delay).await;
			self.events.fetch_add(1, Ordering::SeqCst);
			DeliveryStatus::Delivered
		}

		async fn deliver_session(&self, _report: &SessionReport, _params: &DeliveryParams) -> DeliveryStatus {
			self.sessions.fetch_add(1, Ordering::SeqCst);
			DeliveryStatus::Delivered
		}
	}

	fn event() -> Event {
		Event::new(
			vec![Exception::new("Error", "boom", Stacktrace::default())],
			SeverityReason::HandledError,
		)
	}

	fn dispatcher(dir: &TempDir, delay: Duration, capacity: usize) -> (Dispatcher, Arc<SlowDelivery>) {
		let delivery = Arc::new(SlowDelivery {
			delay,
			events: AtomicUsize::new(0),
			sessions: AtomicUsize::new(0),
		});
		let engine = Arc::new(DeliveryEngine::new(
			delivery.clone(),
			Arc::new(EventStore::open(dir.path(), 100).unwrap()),
			Arc::new(BreadcrumbRing::new(25)),
			Arc::new(EventBus::new()),
			Notifier::new("test", "0", "https://example.com"),
			"key".to_string(),
			"https://notify.example.com",
			"https://sessions.example.com",
			true,
		));
		(Dispatcher::start(engine, 1, capacity).unwrap(), delivery)
	}

	#[test]
	fn delivers_queued_events() {
		let dir = TempDir::new().unwrap();
		let (dispatcher, delivery) = dispatcher(&dir, Duration::ZERO, 16);

		for _ in 0..5 {
			assert!(dispatcher.deliver_async(event()));
		}
		assert!(dispatcher.wait_idle(Duration::from_secs(5)));
		assert_eq!(delivery.events.load(Ordering::SeqCst), 5);
	}

	#[test]
	fn full_queue_persists_events() {
		let dir = TempDir::new().unwrap();
		let (dispatcher, _) = dispatcher(&dir, Duration::from_millis(300), 1);

		let accepted = (0..10).filter(|_| dispatcher.deliver_async(event())).count();
		assert!(accepted < 10);
		assert_eq!(dispatcher.engine().store().len(), 10 - accepted);
	}

	#[test]
	fn closed_dispatcher_rejects_and_persists() {
		let dir = TempDir::new().unwrap();
		let (dispatcher, delivery) = dispatcher(&dir, Duration::ZERO, 16);

		assert!(dispatcher.close(Duration::from_secs(5)));
		assert!(dispatcher.is_closed());
		assert!(!dispatcher.deliver_async(event()));
		assert!(!dispatcher.deliver_session(SessionReport {
			notifier: Notifier::new("test", "0", "https://example.com"),
			app: Default::default(),
			device: Default::default(),
			sessions: vec![],
		}));
		assert_eq!(dispatcher.engine().store().len(), 1);
		assert_eq!(delivery.sessions.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn launch_flush_waits_for_completion() {
		let dir = TempDir::new().unwrap();
		let (dispatcher, delivery) = dispatcher(&dir, Duration::ZERO, 16);
		dispatcher.engine().store().write(&event());

		let summary = dispatcher.flush_on_launch(Duration::from_secs(5)).unwrap();
		assert_eq!(summary.delivered, 1);
		assert_eq!(delivery.events.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn launch_flush_times_out() {
		let dir = TempDir::new().unwrap();
		let (dispatcher, _) = dispatcher(&dir, Duration::from_millis(500), 16);
		dispatcher.engine().store().write(&event());

		assert!(dispatcher.flush_on_launch(Duration::from_millis(10)).is_none());
		assert!(dispatcher.wait_idle(Duration::from_secs(5)));
		assert!(dispatcher.engine().store().is_empty());
	}
}
