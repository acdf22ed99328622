// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable on-disk queue of events awaiting delivery.
//!
//! One JSON file per event, named `<millis:020>_<event-id>.json` so a
//! lexicographic sort is capture order. Files are written as
//! `.<name>.tmp`, fsynced and renamed into place, so a scan never sees a
//! partially written record. The store is synchronous on purpose: it is used
//! from the panic hook where no runtime can be assumed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use loom_crash_core::Event;
use tracing::{debug, info, warn};

use crate::error::StoreError;

const RECORD_EXTENSION: &str = "json";
const TMP_SUFFIX: &str = ".tmp";

/// Details of a failed write, handed to [`StoreDiagnostics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFailure {
	pub filename: String,
	pub error: String,
	pub exists: bool,
	pub can_read: bool,
	pub can_write: bool,
	pub file_length: u64,
}

/// Receives write failures instead of them being raised to the caller.
pub trait StoreDiagnostics: Send + Sync {
	fn on_write_failure(&self, failure: StoreFailure);
}

pub struct EventStore {
	dir: PathBuf,
	max_events: usize,
	write_lock: Mutex<()>,
	diagnostics: RwLock<Option<Arc<dyn StoreDiagnostics>>>,
}

impl EventStore {
	/// Opens (creating if needed) the queue directory and removes temp files
	/// left by an interrupted write.
	pub fn open(dir: impl Into<PathBuf>, max_events: usize) -> Result<Self, StoreError> {
		let dir = dir.into();
		fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

		let store = Self {
			dir,
			max_events,
			write_lock: Mutex::new(()),
			diagnostics: RwLock::new(None),
		};
		store.remove_stale_temp_files();

		info!(dir = %store.dir.display(), "opened event store");
		Ok(store)
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn set_diagnostics(&self, diagnostics: Arc<dyn StoreDiagnostics>) {
		*self.diagnostics.write().unwrap_or_else(PoisonError::into_inner) = Some(diagnostics);
	}

	/// Persists `event`. Never fails: errors are logged and reported to the
	/// diagnostics sink. Returns the record path on success.
	pub fn write(&self, event: &Event) -> Option<PathBuf> {
		match self.try_write(event) {
			Ok(path) => Some(path),
			Err(err) => {
				warn!(event_id = %event.id, error = %err, "failed to persist event");
				self.report_failure(event, &err);
				None
			}
		}
	}

	fn try_write(&self, event: &Event) -> Result<PathBuf, StoreError> {
		let json = serde_json::to_vec(event)?;
		let name = record_name(event);
		let path = self.dir.join(&name);
		let tmp_path = self.dir.join(format!(".{name}{TMP_SUFFIX}"));

		let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
		self.make_room();

		let write = || -> std::io::Result<()> {
			let mut file = fs::File::create(&tmp_path)?;
			file.write_all(&json)?;
			file.sync_all()?;
			fs::rename(&tmp_path, &path)
		};
		if let Err(err) = write() {
			let _ = fs::remove_file(&tmp_path);
			return Err(StoreError::io(&path, err));
		}

		debug!(event_id = %event.id, path = %path.display(), "persisted event");
		Ok(path)
	}

	/// Deletes the oldest records so one more fits under the bound.
	fn make_room(&self) {
		let records = self.find_all();
		let limit = self.max_events.saturating_sub(1);
		if records.len() <= limit {
			return;
		}
		let excess = records.len() - limit;
		for path in records.into_iter().take(excess) {
			warn!(path = %path.display(), "event store full, discarding oldest record");
			self.delete(&path);
		}
	}

	/// Queued records in capture order, oldest first.
	pub fn find_all(&self) -> Vec<PathBuf> {
		let entries = match fs::read_dir(&self.dir) {
			Ok(entries) => entries,
			Err(err) => {
				warn!(dir = %self.dir.display(), error = %err, "failed to list event store");
				return Vec::new();
			}
		};

		let mut records: Vec<PathBuf> = entries
			.filter_map(|entry| entry.ok().map(|e| e.path()))
			.filter(|path| is_record(path))
			.collect();
		records.sort();
		records
	}

	pub fn len(&self) -> usize {
		self.find_all().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn read(&self, path: &Path) -> Result<Event, StoreError> {
		let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
		serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn delete(&self, path: &Path) {
		match fs::remove_file(path) {
			Ok(()) => debug!(path = %path.display(), "deleted event record"),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
			Err(err) => warn!(path = %path.display(), error = %err, "failed to delete event record"),
		}
	}

	fn remove_stale_temp_files(&self) {
		let Ok(entries) = fs::read_dir(&self.dir) else {
			return;
		};
		for entry in entries.flatten() {
			let name = entry.file_name();
			let name = name.to_string_lossy();
			if name.starts_with('.') && name.ends_with(TMP_SUFFIX) {
				debug!(file = %name, "removing interrupted event write");
				let _ = fs::remove_file(entry.path());
			}
		}
	}

	fn report_failure(&self, event: &Event, err: &StoreError) {
		let diagnostics = self
			.diagnostics
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();
		let Some(diagnostics) = diagnostics else {
			return;
		};

		let path = self.dir.join(record_name(event));
		let dir_meta = fs::metadata(&self.dir).ok();
		let failure = StoreFailure {
			filename: path.display().to_string(),
			error: err.to_string(),
			exists: path.exists(),
			can_read: fs::read_dir(&self.dir).is_ok(),
			can_write: dir_meta.as_ref().map(|m| !m.permissions().readonly()).unwrap_or(false),
			file_length: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
		};
		diagnostics.on_write_failure(failure);
	}
}

fn record_name(event: &Event) -> String {
	let millis = event.timestamp.timestamp_millis().max(0);
	format!("{millis:020}_{}.{RECORD_EXTENSION}", event.id)
}

fn is_record(path: &Path) -> bool {
	let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
		return false;
	};
	!name.starts_with('.') && path.extension().map(|ext| ext == RECORD_EXTENSION).unwrap_or(false)
}
