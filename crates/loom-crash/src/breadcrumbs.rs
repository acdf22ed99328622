// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use loom_crash_core::Breadcrumb;

/// Bounded FIFO of the most recent breadcrumbs.
///
/// Insertion is serialized, so entries are strictly ordered across all
/// callers. Readers get a copy, never a live reference.
pub struct BreadcrumbRing {
	capacity: usize,
	entries: Mutex<VecDeque<Breadcrumb>>,
}

impl BreadcrumbRing {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: Mutex::new(VecDeque::with_capacity(capacity)),
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Appends `breadcrumb`, evicting the oldest entry when full.
	pub fn push(&self, breadcrumb: Breadcrumb) {
		if self.capacity == 0 {
			return;
		}
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		while entries.len() >= self.capacity {
			entries.pop_front();
		}
		entries.push_back(breadcrumb);
	}

	/// Oldest first.
	pub fn snapshot(&self) -> Vec<Breadcrumb> {
		self
			.entries
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.cloned()
			.collect()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn clear(&self) {
		self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
	}
}
