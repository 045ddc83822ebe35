use std::{
	alloc::{alloc_zeroed, dealloc, Layout},
	collections::HashMap,
	mem,
	ptr::NonNull,
	sync::{Arc, Weak},
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmemError {
	#[error("shared region \"{0}\" already exists with size {1}, requested {2}")]
	SizeMismatch(String, usize, usize),

	#[error("failed to allocate a shared region of {0} bytes")]
	AllocFailed(usize),
}

/// Provider of named, zero-initialized memory regions shared between all
/// participants of one cache.
///
/// The default [`ProcessShmem`] hands out process-local allocations; an
/// embedder with real cross-process shared memory supplies its own provider.
pub trait ShmemProvider: Send + Sync {
	/// Finds the region named `name`, or creates it zero-filled with the given
	/// size. The returned handle reports which of the two happened.
	fn acquire(&self, name: &str, size: usize) -> Result<ShmemHandle, ShmemError>;
}

struct Region {
	base: NonNull<u8>,
	layout: Layout,
}

// Safety: `Region` only owns raw memory. All access goes through
// `ShmemHandle::base`, and callers are responsible for synchronizing it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
	fn drop(&mut self) {
		// Safety: `base` was allocated with exactly `layout` and is never
		// reallocated.
		unsafe { dealloc(self.base.as_ptr(), self.layout) };
	}
}

/// An attached shared region. Dropping the handle detaches; the last detach
/// frees the region.
pub struct ShmemHandle {
	region: Arc<Region>,
	created: bool,
}

assert_impl_all!(ShmemHandle: Send, Sync);

impl ShmemHandle {
	/// Whether this attach created the region (and therefore must initialize
	/// whatever lives in it).
	pub fn created(&self) -> bool {
		self.created
	}

	pub fn len(&self) -> usize {
		self.region.layout.size()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub(crate) fn base(&self) -> NonNull<u8> {
		self.region.base
	}
}

/// Process-local [`ShmemProvider`] backed by the global allocator.
#[derive(Default)]
pub struct ProcessShmem {
	regions: Mutex<HashMap<String, Weak<Region>>>,
}

impl ProcessShmem {
	pub fn new() -> Self {
		Self::default()
	}
}

impl ShmemProvider for ProcessShmem {
	fn acquire(&self, name: &str, size: usize) -> Result<ShmemHandle, ShmemError> {
		if size == 0 {
			return Err(ShmemError::AllocFailed(0));
		}

		let mut regions = self.regions.lock();
		if let Some(region) = regions.get(name).and_then(Weak::upgrade) {
			if region.layout.size() != size {
				return Err(ShmemError::SizeMismatch(
					name.to_string(),
					region.layout.size(),
					size,
				));
			}
			return Ok(ShmemHandle {
				region,
				created: false,
			});
		}

		let layout = Layout::from_size_align(size, mem::align_of::<u64>())
			.map_err(|_| ShmemError::AllocFailed(size))?;
		// Safety: `layout` has non-zero size, checked above.
		let base = NonNull::new(unsafe { alloc_zeroed(layout) })
			.ok_or(ShmemError::AllocFailed(size))?;
		let region = Arc::new(Region { base, layout });
		regions.insert(name.to_string(), Arc::downgrade(&region));
		Ok(ShmemHandle {
			region,
			created: true,
		})
	}
}
