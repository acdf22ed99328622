// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Backing memory for the bridge layout.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::path::Path;
use std::ptr::NonNull;

use crate::error::{NativeBridgeError, Result};
use crate::layout::BridgeLayout;

enum Backing {
	Heap,
	#[cfg(unix)]
	Mapped { len: usize, _file: std::fs::File },
}

/// A pre-allocated, fixed-size [`BridgeLayout`] that is never resized or
/// moved while alive.
pub(crate) struct Region {
	ptr: NonNull<BridgeLayout>,
	backing: Backing,
}

impl Region {
	/// Zeroed heap allocation. Lost when the process dies.
	pub(crate) fn heap() -> Self {
		let layout = Layout::new::<BridgeLayout>();
		// SAFETY: BridgeLayout has non-zero size and is valid when zeroed.
		let raw = unsafe { alloc_zeroed(layout) } as *mut BridgeLayout;
		let ptr = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
		Self {
			ptr,
			backing: Backing::Heap,
		}
	}

	/// Shared file mapping. Writes land in the page cache and survive the
	/// death of the writing process.
	#[cfg(unix)]
	pub(crate) fn map_file(path: &Path) -> Result<Self> {
		use std::os::unix::io::AsRawFd;

		let map_err = |source: std::io::Error| NativeBridgeError::Map {
			path: path.to_path_buf(),
			source,
		};

		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(map_err)?;
		}

		let file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(path)
			.map_err(map_err)?;

		let len = BridgeLayout::SIZE;
		if file.metadata().map_err(map_err)?.len() != len as u64 {
			file.set_len(len as u64).map_err(map_err)?;
		}

		// SAFETY: the file is at least `len` bytes and stays open for the
		// lifetime of the mapping.
		let raw = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED,
				file.as_raw_fd(),
				0,
			)
		};
		if raw == libc::MAP_FAILED {
			return Err(map_err(std::io::Error::last_os_error()));
		}
		let ptr = NonNull::new(raw as *mut BridgeLayout)
			.ok_or_else(|| map_err(std::io::Error::other("mmap returned null")))?;

		Ok(Self {
			ptr,
			backing: Backing::Mapped { len, _file: file },
		})
	}

	#[cfg(not(unix))]
	pub(crate) fn map_file(_path: &Path) -> Result<Self> {
		Err(NativeBridgeError::Unsupported)
	}

	pub(crate) fn as_ptr(&self) -> *mut BridgeLayout {
		self.ptr.as_ptr()
	}

	pub(crate) fn is_file_backed(&self) -> bool {
		!matches!(self.backing, Backing::Heap)
	}
}

impl Drop for Region {
	fn drop(&mut self) {
		match &self.backing {
			Backing::Heap => {
				// SAFETY: allocated in `heap` with the same layout.
				unsafe { dealloc(self.ptr.as_ptr() as *mut u8, Layout::new::<BridgeLayout>()) };
			}
			#[cfg(unix)]
			Backing::Mapped { len, .. } => {
				// SAFETY: mapped in `map_file` with this length.
				unsafe {
					libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, *len);
				}
			}
		}
	}
}
