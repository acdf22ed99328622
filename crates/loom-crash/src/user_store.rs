// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistence of the user and of a stable per-installation id.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use loom_crash_core::User;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;

const USER_FILE: &str = "user.json";
const INSTALLATION_ID_FILE: &str = "installation-id";

pub struct UserStore {
	dir: PathBuf,
	persist: bool,
}

impl UserStore {
	pub fn new(dir: impl Into<PathBuf>, persist: bool) -> Self {
		Self {
			dir: dir.into(),
			persist,
		}
	}

	/// Random id created on first use and kept for the life of the storage
	/// directory. Falls back to an ephemeral id if it cannot be stored.
	pub fn installation_id(&self) -> String {
		let path = self.dir.join(INSTALLATION_ID_FILE);
		if let Ok(existing) = fs::read_to_string(&path) {
			let existing = existing.trim();
			if Uuid::parse_str(existing).is_ok() {
				return existing.to_string();
			}
		}

		let id = Uuid::new_v4().to_string();
		if let Err(err) = write_atomic(&path, id.as_bytes()) {
			warn!(error = %err, "failed to store installation id, using ephemeral id");
		}
		id
	}

	/// The persisted user, or a user identified only by the installation id.
	pub fn load(&self) -> User {
		if self.persist {
			match self.read_user() {
				Ok(Some(user)) => return user,
				Ok(None) => {}
				Err(err) => warn!(error = %err, "ignoring unreadable stored user"),
			}
		}
		User::new(Some(self.installation_id()), None, None)
	}

	fn read_user(&self) -> Result<Option<User>, StoreError> {
		let path = self.dir.join(USER_FILE);
		let bytes = match fs::read(&path) {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(StoreError::io(&path, err)),
		};
		serde_json::from_slice(&bytes)
			.map(Some)
			.map_err(|source| StoreError::Corrupt { path, source })
	}

	/// Stores `user` when persistence is on. A no-op otherwise.
	pub fn save(&self, user: &User) -> Result<(), StoreError> {
		if !self.persist {
			return Ok(());
		}
		let json = serde_json::to_vec(user)?;
		let path = self.dir.join(USER_FILE);
		write_atomic(&path, &json).map_err(|e| StoreError::io(&path, e))?;
		debug!(path = %path.display(), "stored user");
		Ok(())
	}
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	let tmp = path.with_extension("tmp");
	let mut file = fs::File::create(&tmp)?;
	file.write_all(bytes)?;
	file.sync_all()?;
	fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn installation_id_is_stable() {
		let dir = TempDir::new().unwrap();
		let first = UserStore::new(dir.path(), true).installation_id();
		let second = UserStore::new(dir.path(), false).installation_id();
		assert_eq!(first, second);
	}

	#[test]
	fn default_user_is_installation_id() {
		let dir = TempDir::new().unwrap();
		let store = UserStore::new(dir.path(), true);
		let user = store.load();
		assert_eq!(user.id, Some(store.installation_id()));
		assert!(user.email.is_none());
	}

	#[test]
	fn saved_user_survives_restart() {
		let dir = TempDir::new().unwrap();
		let user = User::new(Some("42".into()), Some("a@example.com".into()), Some("Ada".into()));
		UserStore::new(dir.path(), true).save(&user).unwrap();

		assert_eq!(UserStore::new(dir.path(), true).load(), user);
	}

	#[test]
	fn persistence_off_ignores_saved_user() {
		let dir = TempDir::new().unwrap();
		let user = User::new(Some("42".into()), None, None);
		UserStore::new(dir.path(), false).save(&user).unwrap();
		assert!(!dir.path().join(USER_FILE).exists());

		UserStore::new(dir.path(), true).save(&user).unwrap();
		assert_ne!(UserStore::new(dir.path(), false).load(), user);
	}

	#[test]
	fn corrupt_user_falls_back() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join(USER_FILE), b"{oops").unwrap();
		let user = UserStore::new(dir.path(), true).load();
		assert!(user.id.is_some());
	}
}
