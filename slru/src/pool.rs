use std::{iter, mem, slice};

use parking_lot::{lock_api::RawRwLock as _, RawRwLock, RwLock};
use static_assertions::assert_impl_all;

use crate::{
	consts::PAGE_SIZE,
	host::{Lsn, PageNo},
	shmem::{ShmemError, ShmemHandle, ShmemProvider},
	tick::RelaxedTick,
};

/// Lifecycle state of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
	Empty,
	ReadInProgress,
	Valid,
	WriteInProgress,
}

/// Bytes of shared memory one cache needs for `num_slots` slots.
pub fn shmem_size(num_slots: usize, lsn_groups_per_page: usize) -> usize {
	num_slots * PAGE_SIZE + num_slots * lsn_groups_per_page * mem::size_of::<Lsn>()
}

/// The pool's metadata arrays, guarded as a unit by the control lock.
pub(crate) struct PoolMeta {
	pub state: Box<[SlotState]>,
	pub dirty: Box<[bool]>,
	pub page_number: Box<[PageNo]>,
	pub latest_page_number: PageNo,
}

impl PoolMeta {
	pub fn slot_holding(&self, page: PageNo) -> Option<usize> {
		(0..self.state.len())
			.find(|&slot| self.state[slot] != SlotState::Empty && self.page_number[slot] == page)
	}
}

/// Witness that a slot's I/O lock is held exclusively by the current
/// process. Handed out and taken back only under the exclusive control lock.
#[must_use]
pub(crate) struct IoToken {
	slot: usize,
}

/// The fixed pool of page buffers and their shared bookkeeping.
///
/// The page buffers and the per-page redo positions live in the shared
/// region; the metadata arrays are anchored next to the control lock that
/// guards them. The LRU ticks live outside the lock so they can be touched
/// under a shared guard.
pub(crate) struct SlotPool {
	num_slots: usize,
	lsn_groups_per_page: usize,
	region: ShmemHandle,
	control: RwLock<PoolMeta>,
	io_locks: Box<[RawRwLock]>,
	lru: Box<[RelaxedTick]>,
	cur_lru: RelaxedTick,
}

assert_impl_all!(SlotPool: Send, Sync);

impl SlotPool {
	pub fn new<P: ShmemProvider + ?Sized>(
		provider: &P,
		name: &str,
		num_slots: usize,
		lsn_groups_per_page: usize,
	) -> Result<Self, ShmemError> {
		assert!(num_slots > 0, "a cache needs at least one slot");
		let region = provider.acquire(name, shmem_size(num_slots, lsn_groups_per_page))?;
		// A found region keeps its bytes. The metadata below starts out all
		// Empty either way, so no page is considered resident until it has
		// been read back.
		let meta = PoolMeta {
			state: vec![SlotState::Empty; num_slots].into(),
			dirty: vec![false; num_slots].into(),
			page_number: vec![0; num_slots].into(),
			latest_page_number: 0,
		};
		Ok(Self {
			num_slots,
			lsn_groups_per_page,
			region,
			control: RwLock::new(meta),
			io_locks: iter::repeat_with(|| RawRwLock::INIT).take(num_slots).collect(),
			lru: iter::repeat_with(|| RelaxedTick::new(0))
				.take(num_slots)
				.collect(),
			cur_lru: RelaxedTick::new(0),
		})
	}

	pub fn num_slots(&self) -> usize {
		self.num_slots
	}

	pub fn lsn_groups_per_page(&self) -> usize {
		self.lsn_groups_per_page
	}

	pub fn control(&self) -> &RwLock<PoolMeta> {
		&self.control
	}

	fn page_ptr(&self, slot: usize) -> *mut u8 {
		debug_assert!(slot < self.num_slots);
		// Safety: `slot` is in bounds, so the offset stays inside the region.
		unsafe { self.region.base().as_ptr().add(slot * PAGE_SIZE) }
	}

	fn lsn_ptr(&self, slot: usize) -> *mut Lsn {
		debug_assert!(slot < self.num_slots);
		let lsn_area = self.num_slots * PAGE_SIZE;
		// Safety: the LSN array follows the page buffers in the region, and
		// the region base is u64-aligned.
		unsafe {
			self.region
				.base()
				.as_ptr()
				.add(lsn_area)
				.cast::<Lsn>()
				.add(slot * self.lsn_groups_per_page)
		}
	}

	/// Shared view of a resident slot's bytes. The borrow of `meta` ties the
	/// access to a held control lock; the physical reader is the only writer
	/// without one, and it only touches `ReadInProgress` slots.
	pub fn page<'a>(&'a self, meta: &'a PoolMeta, slot: usize) -> &'a [u8] {
		debug_assert!(matches!(
			meta.state[slot],
			SlotState::Valid | SlotState::WriteInProgress
		));
		// Safety: witnessed by the shared borrow of the control guard; no
		// exclusive borrow of this page can coexist with it.
		unsafe { slice::from_raw_parts(self.page_ptr(slot), PAGE_SIZE) }
	}

	/// Exclusive view of a resident slot's bytes, witnessed by the
	/// exclusively held control lock.
	pub fn page_mut<'a>(&'a self, meta: &'a mut PoolMeta, slot: usize) -> &'a mut [u8] {
		debug_assert!(matches!(
			meta.state[slot],
			SlotState::Valid | SlotState::WriteInProgress
		));
		// Safety: `meta` is borrowed exclusively, so no other witnessed
		// borrow of any page coexists, and the slot is not `ReadInProgress`.
		unsafe { slice::from_raw_parts_mut(self.page_ptr(slot), PAGE_SIZE) }
	}

	/// Buffer of a slot undergoing a physical read.
	///
	/// # Safety
	/// The caller must hold the slot's I/O lock exclusively and the slot must
	/// be `ReadInProgress`, so that no witnessed access to these bytes
	/// exists.
	pub unsafe fn page_io<'a>(&'a self, slot: usize) -> &'a mut [u8] {
		slice::from_raw_parts_mut(self.page_ptr(slot), PAGE_SIZE)
	}

	pub fn group_lsns<'a>(&'a self, _meta: &'a PoolMeta, slot: usize) -> &'a [Lsn] {
		// Safety: witnessed by the held control lock; the physical reader
		// never touches the LSN area.
		unsafe { slice::from_raw_parts(self.lsn_ptr(slot), self.lsn_groups_per_page) }
	}

	pub fn group_lsns_mut<'a>(&'a self, _meta: &'a mut PoolMeta, slot: usize) -> &'a mut [Lsn] {
		// Safety: `_meta` is borrowed exclusively; see `group_lsns`.
		unsafe { slice::from_raw_parts_mut(self.lsn_ptr(slot), self.lsn_groups_per_page) }
	}

	/// Marks `slot` recently used. Runs under a control lock held in either
	/// mode; the racy tick update is tolerated by contract.
	pub fn touch(&self, slot: usize) {
		let cur = self.cur_lru.get();
		if self.lru[slot].get() != cur {
			let next = cur.wrapping_add(1);
			self.cur_lru.set(next);
			self.lru[slot].set(next);
		}
	}

	/// Advances the pool tick for one victim scan and returns it.
	pub fn advance_lru(&self) -> u64 {
		self.cur_lru.bump()
	}

	pub fn lru_tick(&self, slot: usize) -> u64 {
		self.lru[slot].get()
	}

	/// Clamps a slot tick observed ahead of `cur` (an artifact of racing
	/// touches) back to `cur`.
	pub fn clamp_lru(&self, slot: usize, cur: u64) {
		self.lru[slot].set(cur);
	}

	pub fn begin_io(&self, _meta: &mut PoolMeta, slot: usize) -> IoToken {
		self.io_locks[slot].lock_exclusive();
		IoToken { slot }
	}

	pub fn finish_io(&self, _meta: &mut PoolMeta, token: IoToken) {
		// Safety: `token` witnesses that this process holds the lock
		// exclusively.
		unsafe { self.io_locks[token.slot].unlock_exclusive() };
	}

	/// Blocks until the I/O in flight on `slot` (if any) has released the
	/// slot's lock.
	pub fn wait_io_done(&self, slot: usize) {
		let lock = &self.io_locks[slot];
		lock.lock_shared();
		// Safety: acquired on the line above.
		unsafe { lock.unlock_shared() };
	}

	/// Whether the slot's I/O lock is currently free. Used to detect an owner
	/// that vanished without updating the slot state.
	pub fn probe_io_idle(&self, _meta: &mut PoolMeta, slot: usize) -> bool {
		let lock = &self.io_locks[slot];
		if lock.try_lock_shared() {
			// Safety: acquired on the line above.
			unsafe { lock.unlock_shared() };
			true
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::shmem::ProcessShmem;

	use super::*;

	fn pool(num_slots: usize, lsn_groups: usize) -> SlotPool {
		SlotPool::new(&ProcessShmem::new(), "test-pool", num_slots, lsn_groups).unwrap()
	}

	#[test]
	fn shmem_size_covers_pages_and_lsns() {
		assert_eq!(shmem_size(4, 0), 4 * PAGE_SIZE);
		assert_eq!(shmem_size(4, 2), 4 * PAGE_SIZE + 4 * 2 * 8);
	}

	#[test]
	fn slots_start_empty_and_clean() {
		let pool = pool(3, 0);
		let meta = pool.control().read();

		for slot in 0..3 {
			assert_eq!(meta.state[slot], SlotState::Empty);
			assert!(!meta.dirty[slot]);
		}
		assert_eq!(meta.slot_holding(0), None);
	}

	#[test]
	fn pages_are_distinct_buffers() {
		let pool = pool(2, 0);
		let mut meta = pool.control().write();
		meta.state[0] = SlotState::Valid;
		meta.state[1] = SlotState::Valid;

		pool.page_mut(&mut meta, 0).fill(1);
		pool.page_mut(&mut meta, 1).fill(2);

		assert!(pool.page(&meta, 0).iter().all(|b| *b == 1));
		assert!(pool.page(&meta, 1).iter().all(|b| *b == 2));
	}

	#[test]
	fn group_lsns_are_per_slot() {
		let pool = pool(2, 3);
		let mut meta = pool.control().write();

		pool.group_lsns_mut(&mut meta, 0).copy_from_slice(&[1, 2, 3]);
		pool.group_lsns_mut(&mut meta, 1).copy_from_slice(&[4, 5, 6]);

		assert_eq!(pool.group_lsns(&meta, 0), &[1, 2, 3]);
		assert_eq!(pool.group_lsns(&meta, 1), &[4, 5, 6]);
	}

	#[test]
	fn touch_assigns_fresh_ticks() {
		let pool = pool(2, 0);

		// All ticks start equal to the pool tick, so move it first.
		pool.advance_lru();
		pool.touch(0);
		let first = pool.lru_tick(0);
		pool.touch(1);
		let second = pool.lru_tick(1);

		assert!(second > first);
		// Touching the most recently used slot again is a no-op.
		pool.touch(1);
		assert_eq!(pool.lru_tick(1), second);
	}

	#[test]
	fn io_token_roundtrip() {
		let pool = pool(1, 0);
		let mut meta = pool.control().write();

		let token = pool.begin_io(&mut meta, 0);
		assert!(!pool.probe_io_idle(&mut meta, 0));
		pool.finish_io(&mut meta, token);
		assert!(pool.probe_io_idle(&mut meta, 0));
	}
}
