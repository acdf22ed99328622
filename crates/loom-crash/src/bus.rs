// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Typed fan-out of client state changes to internal subscribers such as
//! the native bridge mirror.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use loom_crash_core::{Breadcrumb, Session, User};

use crate::callbacks::invoke_guarded;

/// A state change broadcast by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
	UserChanged(User),
	ContextChanged(Option<String>),
	BreadcrumbAdded(Breadcrumb),
	BreadcrumbsCleared,
	SessionStarted(Session),
	SessionPaused(Session),
	SessionResumed(Session),
	/// An event was counted toward `session`.
	SessionUpdated(Session),
	/// An event passed the callback pipeline.
	Notified { unhandled: bool },
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEventKind {
	UserChanged,
	ContextChanged,
	BreadcrumbAdded,
	BreadcrumbsCleared,
	SessionStarted,
	SessionPaused,
	SessionResumed,
	SessionUpdated,
	Notified,
	Closed,
}

impl StateEvent {
	pub fn kind(&self) -> StateEventKind {
		match self {
			Self::UserChanged(_) => StateEventKind::UserChanged,
			Self::ContextChanged(_) => StateEventKind::ContextChanged,
			Self::BreadcrumbAdded(_) => StateEventKind::BreadcrumbAdded,
			Self::BreadcrumbsCleared => StateEventKind::BreadcrumbsCleared,
			Self::SessionStarted(_) => StateEventKind::SessionStarted,
			Self::SessionPaused(_) => StateEventKind::SessionPaused,
			Self::SessionResumed(_) => StateEventKind::SessionResumed,
			Self::SessionUpdated(_) => StateEventKind::SessionUpdated,
			Self::Notified { .. } => StateEventKind::Notified,
			Self::Closed => StateEventKind::Closed,
		}
	}
}

pub type Subscriber = Arc<dyn Fn(&StateEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Kind to ordered subscribers. Publishing is synchronous and runs
/// subscribers in registration order on the publishing thread. A panicking
/// subscriber is logged and the remaining subscribers still run.
pub struct EventBus {
	next_id: AtomicU64,
	subscribers: RwLock<HashMap<StateEventKind, Vec<(SubscriptionId, Subscriber)>>>,
}

impl EventBus {
	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			subscribers: RwLock::new(HashMap::new()),
		}
	}

	pub fn subscribe(&self, kind: StateEventKind, subscriber: Subscriber) -> SubscriptionId {
		let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self
			.subscribers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.entry(kind)
			.or_default()
			.push((id, subscriber));
		id
	}

	/// Subscribes one closure to several kinds under a single id.
	pub fn subscribe_many(&self, kinds: &[StateEventKind], subscriber: Subscriber) -> SubscriptionId {
		let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
		for kind in kinds {
			subscribers
				.entry(*kind)
				.or_default()
				.push((id, Arc::clone(&subscriber)));
		}
		id
	}

	pub fn unsubscribe(&self, id: SubscriptionId) {
		let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
		for list in subscribers.values_mut() {
			list.retain(|(existing, _)| *existing != id);
		}
	}

	pub fn publish(&self, event: &StateEvent) {
		let targets: Vec<Subscriber> = self
			.subscribers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&event.kind())
			.map(|list| list.iter().map(|(_, s)| Arc::clone(s)).collect())
			.unwrap_or_default();

		for subscriber in targets {
			invoke_guarded("subscriber", || {
				subscriber(event);
				true
			});
		}
	}

	pub fn clear(&self) {
		self.subscribers.write().unwrap_or_else(PoisonError::into_inner).clear();
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}
