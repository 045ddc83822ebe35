use std::{mem, path::PathBuf, sync::Arc};

use log::{debug, error, warn};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::{
	consts::{DEFAULT_FLUSH_BATCH_CAP, DEFAULT_NUM_SLOTS, DEFAULT_PAGES_PER_SEGMENT},
	files::{CacheDir, CacheDirApi, FileIoError},
	host::{CacheHost, Lsn, PageNo},
	physical::{FlushContext, PhysicalStorage},
	pool::{PoolMeta, SlotPool, SlotState},
	shmem::{ShmemError, ShmemProvider},
};

/// Construction parameters for one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
	/// Number of page slots in the pool.
	pub num_slots: usize,
	/// Redo-position groups tracked per page; zero disables redo ordering.
	pub lsn_groups_per_page: usize,
	/// Whether page writes are fsync'd.
	pub do_fsync: bool,
	/// Pages per segment file.
	pub pages_per_segment: u32,
	/// Most segment files a single flush keeps open at once; a flush that
	/// touches more segments falls back to write-and-fsync per page for the
	/// overflow.
	pub flush_batch_cap: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			num_slots: DEFAULT_NUM_SLOTS,
			lsn_groups_per_page: 0,
			do_fsync: true,
			pages_per_segment: DEFAULT_PAGES_PER_SEGMENT,
			flush_batch_cap: DEFAULT_FLUSH_BATCH_CAP,
		}
	}
}

#[derive(Debug, Error)]
pub enum SlruError {
	/// A page I/O performed on behalf of a caller failed.
	#[error("could not access entry {tag} on page {page}: {source}")]
	Io {
		page: PageNo,
		tag: u64,
		#[source]
		source: FileIoError,
	},

	/// Writing back a dirty page failed; the page was re-marked dirty.
	#[error("could not write back page {page}: {source}")]
	WriteBack {
		page: PageNo,
		#[source]
		source: FileIoError,
	},

	#[error(transparent)]
	Shmem(#[from] ShmemError),

	/// The cache directory could not be opened or created.
	#[error(transparent)]
	Directory(FileIoError),
}

type Ctl<'a> = RwLockWriteGuard<'a, PoolMeta>;

/// One simple-least-recently-used page cache over a directory of segment
/// files.
///
/// Several caches coexist in one process, each with its own directory, pool
/// and host callbacks. All operations synchronize through the pool's control
/// lock and the per-slot I/O locks; none of them may be called while the
/// calling thread still holds a slot guard from the same cache.
pub struct SlruCache<H, DF = CacheDir>
where
	H: CacheHost,
	DF: CacheDirApi,
{
	pool: SlotPool,
	physical: PhysicalStorage<DF>,
	host: Arc<H>,
	flush_batch_cap: usize,
}

impl<H: CacheHost> SlruCache<H> {
	/// Creates a cache over the segment directory at `path`, attaching to an
	/// existing shared region of the same name if one is live.
	pub fn new<P: ShmemProvider + ?Sized>(
		name: &str,
		config: &CacheConfig,
		path: PathBuf,
		host: Arc<H>,
		shmem: &P,
	) -> Result<Self, SlruError> {
		let dir = CacheDir::open(path).map_err(SlruError::Directory)?;
		Self::with_dir(name, config, Arc::new(dir), host, shmem)
	}
}

impl<H, DF> SlruCache<H, DF>
where
	H: CacheHost,
	DF: CacheDirApi,
{
	pub fn with_dir<P: ShmemProvider + ?Sized>(
		name: &str,
		config: &CacheConfig,
		dir: Arc<DF>,
		host: Arc<H>,
		shmem: &P,
	) -> Result<Self, SlruError> {
		let pool = SlotPool::new(shmem, name, config.num_slots, config.lsn_groups_per_page)?;
		Ok(Self {
			pool,
			physical: PhysicalStorage::new(dir, config.pages_per_segment, config.do_fsync),
			host,
			flush_batch_cap: config.flush_batch_cap,
		})
	}

	pub fn num_slots(&self) -> usize {
		self.pool.num_slots()
	}

	/// Declares `page` the logically-active page. The slot holding it is
	/// never chosen for eviction. Set by the embedder before first use.
	pub fn set_latest_page_number(&self, page: PageNo) {
		self.pool.control().write().latest_page_number = page;
	}

	/// Installs `page` as a zero-filled, dirty, valid slot without touching
	/// disk and declares it the latest page. The caller is expected to flush
	/// it eventually.
	pub fn zero_page(&self, page: PageNo) -> Result<ExclusiveSlot<'_>, SlruError> {
		let mut meta = self.pool.control().write();

		let (mut meta, slot) = loop {
			let (m, slot) = self.select_victim(meta, page)?;
			let state = m.state[slot];
			if m.page_number[slot] == page
				&& (state == SlotState::ReadInProgress || state == SlotState::WriteInProgress)
			{
				meta = self.wait_for_io(m, slot);
				continue;
			}
			break (m, slot);
		};

		debug_assert!(
			meta.state[slot] == SlotState::Empty
				|| (meta.state[slot] == SlotState::Valid
					&& (!meta.dirty[slot] || meta.page_number[slot] == page)),
			"zeroing over a slot that still needs writing"
		);

		meta.page_number[slot] = page;
		meta.state[slot] = SlotState::Valid;
		meta.dirty[slot] = true;
		self.pool.page_mut(&mut meta, slot).fill(0);
		self.pool.group_lsns_mut(&mut meta, slot).fill(0);
		meta.latest_page_number = page;
		self.pool.touch(slot);

		Ok(ExclusiveSlot {
			pool: &self.pool,
			meta,
			slot,
		})
	}

	/// Reads `page` into the pool (or finds it resident) and returns its
	/// slot, held under the exclusive control lock until the guard is
	/// dropped.
	///
	/// With `write_ok`, a page currently being written back is returned
	/// immediately instead of waiting for the write to finish; callers that
	/// are about to modify the page want that. `tag` names the log entry on
	/// whose behalf the read happens and is echoed in errors.
	pub fn read_page(
		&self,
		page: PageNo,
		write_ok: bool,
		tag: u64,
	) -> Result<ExclusiveSlot<'_>, SlruError> {
		let meta = self.pool.control().write();
		let (meta, slot) = self.read_slot(meta, page, write_ok, tag)?;
		Ok(ExclusiveSlot {
			pool: &self.pool,
			meta,
			slot,
		})
	}

	/// Read-only variant that serves resident pages under the shared control
	/// lock, falling back to the full read path on a miss.
	pub fn read_page_readonly(
		&self,
		page: PageNo,
		tag: u64,
	) -> Result<SharedSlot<'_>, SlruError> {
		let meta = self.pool.control().read();
		if let Some(slot) = meta.slot_holding(page) {
			if matches!(
				meta.state[slot],
				SlotState::Valid | SlotState::WriteInProgress
			) {
				self.pool.touch(slot);
				return Ok(SharedSlot {
					pool: &self.pool,
					meta,
					slot,
				});
			}
		}
		drop(meta);

		let meta = self.pool.control().write();
		let (meta, slot) = self.read_slot(meta, page, false, tag)?;
		Ok(SharedSlot {
			pool: &self.pool,
			meta: RwLockWriteGuard::downgrade(meta),
			slot,
		})
	}

	/// Returns `page`'s slot only if it is already resident; never performs
	/// I/O.
	pub fn try_read_page(&self, page: PageNo) -> Option<SharedSlot<'_>> {
		let meta = self.pool.control().read();
		let slot = meta.slot_holding(page)?;
		if !matches!(
			meta.state[slot],
			SlotState::Valid | SlotState::WriteInProgress
		) {
			return None;
		}
		self.pool.touch(slot);
		Some(SharedSlot {
			pool: &self.pool,
			meta,
			slot,
		})
	}

	/// Writes the page in `slot` back to disk if it is still dirty. A clean
	/// or recycled slot is a no-op.
	pub fn write_page(&self, slot: usize) -> Result<(), SlruError> {
		assert!(slot < self.pool.num_slots());
		let meta = self.pool.control().write();
		let (meta, result) = self.write_slot(meta, slot, None);
		drop(meta);
		result
	}

	/// Writes every dirty page out, batching open segment files, then fsyncs
	/// (when enabled) and closes them. With `checkpoint` the pool stays warm;
	/// otherwise this is the shutdown path and every slot is expected to end
	/// up clean, except pages re-dirtied concurrently, which are tolerated
	/// and counted.
	pub fn flush(&self, checkpoint: bool) -> Result<(), SlruError> {
		let mut fctx = FlushContext::new(self.flush_batch_cap);
		let mut first_error: Option<SlruError> = None;
		let mut redirtied = 0usize;

		let mut meta = self.pool.control().write();
		for slot in 0..self.pool.num_slots() {
			let (m, result) = self.write_slot(meta, slot, Some(&mut fctx));
			meta = m;
			if let Err(e) = result {
				if first_error.is_none() {
					first_error = Some(e);
				} else {
					warn!("{e}");
				}
			}
			if !checkpoint && meta.state[slot] == SlotState::Valid && meta.dirty[slot] {
				redirtied += 1;
			}
		}
		drop(meta);

		if redirtied > 0 {
			debug!("{redirtied} pages were re-dirtied while being flushed");
		}

		let finish = self.physical.finish_flush(fctx);
		if let Some(error) = first_error {
			return Err(error);
		}
		finish.map_err(|failure| SlruError::WriteBack {
			page: failure.first_page,
			source: failure.error,
		})
	}

	/// Drops every page preceding `cutoff` (rounded down to its segment
	/// boundary) from the pool and removes the segment files wholly before
	/// it. Refuses with a log entry when the cutoff appears to have wrapped
	/// past the latest page.
	pub fn truncate(&self, cutoff: PageNo) -> Result<(), SlruError> {
		let cutoff = self.physical.segment_start(cutoff);

		let mut meta = self.pool.control().write();

		// A cutoff the latest page precedes means the page horizon wrapped;
		// truncating now could remove live data.
		if self.host.page_precedes(meta.latest_page_number, cutoff) {
			error!(
				"refusing apparent wraparound truncation: latest page {} precedes cutoff {cutoff}",
				meta.latest_page_number
			);
			return Ok(());
		}

		let mut restart = true;
		while mem::take(&mut restart) {
			for slot in 0..self.pool.num_slots() {
				if meta.state[slot] == SlotState::Empty {
					continue;
				}
				if !self.host.page_precedes(meta.page_number[slot], cutoff) {
					continue;
				}

				if meta.state[slot] == SlotState::Valid && !meta.dirty[slot] {
					meta.state[slot] = SlotState::Empty;
					continue;
				}

				// Dirty pages in range are written back rather than
				// discarded; any lock release invalidates the scan, so it
				// starts over.
				if meta.state[slot] == SlotState::Valid {
					let (m, result) = self.write_slot(meta, slot, None);
					meta = m;
					result?;
				} else {
					meta = self.wait_for_io(meta, slot);
				}
				restart = true;
				break;
			}
		}
		drop(meta);

		self.delete_segments_before(cutoff);
		Ok(())
	}

	/// Whether `page` can be read successfully. Any I/O failure, including a
	/// missing segment file outside recovery, reads as "does not exist".
	pub fn page_exists(&self, page: PageNo) -> bool {
		let meta = self.pool.control().write();
		self.read_slot(meta, page, false, 0).is_ok()
	}

	/// Finds the slot holding `target` if resident (in any state), or a
	/// freeable slot to install it in. Called and returns with the control
	/// lock held exclusively; may release it internally to write back or
	/// wait on a victim.
	fn select_victim<'c>(
		&'c self,
		mut meta: Ctl<'c>,
		target: PageNo,
	) -> Result<(Ctl<'c>, usize), SlruError> {
		loop {
			if let Some(slot) = meta.slot_holding(target) {
				return Ok((meta, slot));
			}

			let cur = self.pool.advance_lru();
			let mut best: Option<(usize, i64)> = None;
			for slot in 0..self.pool.num_slots() {
				if meta.state[slot] == SlotState::Empty {
					return Ok((meta, slot));
				}
				#[allow(clippy::cast_possible_wrap)]
				let mut delta = cur.wrapping_sub(self.pool.lru_tick(slot)) as i64;
				if delta < 0 {
					// A racing touch pushed this tick past `cur`; clamp it so
					// deltas stay comparable within this scan.
					self.pool.clamp_lru(slot, cur);
					delta = 0;
				}
				if meta.page_number[slot] == meta.latest_page_number {
					continue;
				}
				let replace = match best {
					None => true,
					Some((best_slot, best_delta)) => {
						delta > best_delta
							|| (delta == best_delta
								&& self.host.page_precedes(
									meta.page_number[slot],
									meta.page_number[best_slot],
								))
					}
				};
				if replace {
					best = Some((slot, delta));
				}
			}

			let (victim, _) = best.expect("no evictable slot: the latest page is never evicted");

			match (meta.state[victim], meta.dirty[victim]) {
				(SlotState::Valid, false) => return Ok((meta, victim)),
				(SlotState::Valid, true) => {
					let (m, result) = self.write_slot(meta, victim, None);
					meta = m;
					result?;
				}
				_ => meta = self.wait_for_io(meta, victim),
			}
		}
	}

	/// Waits for the I/O in flight on `slot`, releasing the control lock
	/// while blocked; the slot may hold a different page on return. An owner
	/// that vanished without completing is detected by its freed I/O lock and
	/// the slot state healed.
	fn wait_for_io<'c>(&'c self, meta: Ctl<'c>, slot: usize) -> Ctl<'c> {
		drop(meta);
		self.pool.wait_io_done(slot);
		let mut meta = self.pool.control().write();

		let state = meta.state[slot];
		match state {
			SlotState::ReadInProgress if self.pool.probe_io_idle(&mut meta, slot) => {
				// The reader released its lock without publishing a result:
				// it failed or died, and the slot holds nothing usable.
				meta.state[slot] = SlotState::Empty;
				meta.dirty[slot] = false;
			}
			SlotState::WriteInProgress if self.pool.probe_io_idle(&mut meta, slot) => {
				// Same for a writer; the in-memory page is still good but was
				// never confirmed on disk.
				meta.state[slot] = SlotState::Valid;
				meta.dirty[slot] = true;
			}
			_ => {}
		}
		meta
	}

	fn read_slot<'c>(
		&'c self,
		mut meta: Ctl<'c>,
		page: PageNo,
		write_ok: bool,
		tag: u64,
	) -> Result<(Ctl<'c>, usize), SlruError> {
		loop {
			let (m, slot) = self.select_victim(meta, page)?;
			meta = m;

			if meta.page_number[slot] == page && meta.state[slot] != SlotState::Empty {
				let state = meta.state[slot];
				if state == SlotState::ReadInProgress
					|| (state == SlotState::WriteInProgress && !write_ok)
				{
					meta = self.wait_for_io(meta, slot);
					continue;
				}
				self.pool.touch(slot);
				return Ok((meta, slot));
			}

			debug_assert!(
				meta.state[slot] == SlotState::Empty
					|| (meta.state[slot] == SlotState::Valid && !meta.dirty[slot]),
				"victim slot is not freeable"
			);

			meta.page_number[slot] = page;
			meta.state[slot] = SlotState::ReadInProgress;
			meta.dirty[slot] = false;
			let token = self.pool.begin_io(&mut meta, slot);
			// Touch before the read so concurrent victim scans steer away
			// from this slot.
			self.pool.touch(slot);
			drop(meta);

			// Safety: this process holds the slot's I/O lock exclusively and
			// just set the slot ReadInProgress.
			let buf = unsafe { self.pool.page_io(slot) };
			let result = self.physical.read_page(page, buf, self.host.in_recovery());

			let mut meta = self.pool.control().write();
			debug_assert!(
				meta.state[slot] == SlotState::ReadInProgress && meta.page_number[slot] == page,
				"slot changed hands during a read"
			);
			self.pool.group_lsns_mut(&mut meta, slot).fill(0);
			meta.state[slot] = if result.is_ok() {
				SlotState::Valid
			} else {
				SlotState::Empty
			};
			self.pool.finish_io(&mut meta, token);

			return match result {
				Ok(()) => {
					self.pool.touch(slot);
					Ok((meta, slot))
				}
				Err(source) => Err(SlruError::Io { page, tag, source }),
			};
		}
	}

	/// Writes `slot` back if it still holds a dirty valid page. Called and
	/// returns with the control lock held exclusively; releases it across the
	/// disk write. On failure the page is re-marked dirty.
	fn write_slot<'c>(
		&'c self,
		mut meta: Ctl<'c>,
		slot: usize,
		fctx: Option<&mut FlushContext<DF::SegmentFile>>,
	) -> (Ctl<'c>, Result<(), SlruError>) {
		let page = meta.page_number[slot];

		while meta.state[slot] == SlotState::WriteInProgress && meta.page_number[slot] == page {
			meta = self.wait_for_io(meta, slot);
		}

		if !meta.dirty[slot]
			|| meta.state[slot] != SlotState::Valid
			|| meta.page_number[slot] != page
		{
			return (meta, Ok(()));
		}

		meta.state[slot] = SlotState::WriteInProgress;
		meta.dirty[slot] = false;
		let token = self.pool.begin_io(&mut meta, slot);

		if self.pool.lsn_groups_per_page() > 0 {
			// Redo ordering: the log must reach the newest position recorded
			// for this page before the page itself hits disk.
			let max_lsn = self
				.pool
				.group_lsns(&meta, slot)
				.iter()
				.copied()
				.max()
				.unwrap_or(0);
			if max_lsn != 0 {
				self.host.flush_redo(max_lsn);
			}
		}

		// Concurrent callers may re-dirty the page while the write is in
		// flight, so the write works from a copy taken under the lock.
		let snapshot: Box<[u8]> = self.pool.page(&meta, slot).into();
		drop(meta);

		let result = self.physical.write_page(page, &snapshot, fctx);

		let mut meta = self.pool.control().write();
		debug_assert!(
			meta.state[slot] == SlotState::WriteInProgress && meta.page_number[slot] == page,
			"slot changed hands during a write"
		);
		if result.is_err() {
			meta.dirty[slot] = true;
		}
		meta.state[slot] = SlotState::Valid;
		self.pool.finish_io(&mut meta, token);

		(
			meta,
			result.map_err(|source| SlruError::WriteBack { page, source }),
		)
	}

	fn delete_segments_before(&self, cutoff: PageNo) {
		let segments = match self.physical.iter_segments() {
			Ok(segments) => segments,
			Err(error) => {
				warn!("could not scan cache directory for truncation: {error}");
				return;
			}
		};
		for entry in segments {
			let segno = match entry {
				Ok(segno) => segno,
				Err(error) => {
					warn!("could not scan cache directory for truncation: {error}");
					continue;
				}
			};
			if !self
				.host
				.page_precedes(self.physical.first_page_of(segno), cutoff)
			{
				continue;
			}
			match self.physical.delete_segment(segno) {
				Ok(()) => debug!("removed segment file {segno:04X}"),
				Err(error) => warn!("{error}"),
			}
		}
	}
}

#[cfg(test)]
impl<H, DF> SlruCache<H, DF>
where
	H: CacheHost,
	DF: CacheDirApi,
{
	fn slot_states(&self) -> Vec<(SlotState, bool, PageNo)> {
		let meta = self.pool.control().read();
		(0..self.pool.num_slots())
			.map(|slot| (meta.state[slot], meta.dirty[slot], meta.page_number[slot]))
			.collect()
	}

	fn resident_pages(&self) -> Vec<PageNo> {
		let meta = self.pool.control().read();
		let mut pages: Vec<PageNo> = (0..self.pool.num_slots())
			.filter(|&slot| meta.state[slot] != SlotState::Empty)
			.map(|slot| meta.page_number[slot])
			.collect();
		pages.sort_unstable();
		pages
	}

	/// Forges a slot state, simulating an I/O owner that died without
	/// updating it.
	fn poison_slot(&self, slot: usize, state: SlotState, dirty: bool, page: PageNo) {
		let mut meta = self.pool.control().write();
		meta.state[slot] = state;
		meta.dirty[slot] = dirty;
		meta.page_number[slot] = page;
	}

	fn set_lru_tick(&self, slot: usize, tick: u64) {
		self.pool.clamp_lru(slot, tick);
	}
}

/// A resident page slot held under the exclusive control lock. Dropping the
/// guard releases the lock; no other operation on the same cache may be
/// called by this thread while the guard lives.
pub struct ExclusiveSlot<'a> {
	pool: &'a SlotPool,
	meta: Ctl<'a>,
	slot: usize,
}

impl std::fmt::Debug for ExclusiveSlot<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExclusiveSlot").field("slot", &self.slot).finish()
	}
}

impl ExclusiveSlot<'_> {
	/// Index of the pool slot holding the page.
	pub fn index(&self) -> usize {
		self.slot
	}

	pub fn page_number(&self) -> PageNo {
		self.meta.page_number[self.slot]
	}

	pub fn bytes(&self) -> &[u8] {
		self.pool.page(&self.meta, self.slot)
	}

	/// Mutable page bytes. Callers that modify them must also call
	/// [`mark_dirty`](Self::mark_dirty) before releasing the slot.
	pub fn bytes_mut(&mut self) -> &mut [u8] {
		self.pool.page_mut(&mut self.meta, self.slot)
	}

	pub fn is_dirty(&self) -> bool {
		self.meta.dirty[self.slot]
	}

	pub fn mark_dirty(&mut self) {
		self.meta.dirty[self.slot] = true;
	}

	pub fn group_lsn(&self, group: usize) -> Lsn {
		self.pool.group_lsns(&self.meta, self.slot)[group]
	}

	/// Records the redo position a modification of LSN group `group` depends
	/// on. Positions only ever advance.
	pub fn set_group_lsn(&mut self, group: usize, lsn: Lsn) {
		let lsns = self.pool.group_lsns_mut(&mut self.meta, self.slot);
		if lsn > lsns[group] {
			lsns[group] = lsn;
		}
	}
}

/// A resident page slot held under the shared control lock.
pub struct SharedSlot<'a> {
	pool: &'a SlotPool,
	meta: RwLockReadGuard<'a, PoolMeta>,
	slot: usize,
}

impl SharedSlot<'_> {
	pub fn index(&self) -> usize {
		self.slot
	}

	pub fn page_number(&self) -> PageNo {
		self.meta.page_number[self.slot]
	}

	pub fn bytes(&self) -> &[u8] {
		self.pool.page(&self.meta, self.slot)
	}

	pub fn group_lsn(&self, group: usize) -> Lsn {
		self.pool.group_lsns(&self.meta, self.slot)[group]
	}
}

#[cfg(test)]
mod tests {
	use std::{
		fs, io,
		sync::{
			atomic::{AtomicBool, AtomicUsize, Ordering},
			mpsc,
		},
		thread,
	};

	use mockall::predicate::eq;
	use parking_lot::Mutex;
	use tempfile::TempDir;

	use crate::{
		consts::PAGE_SIZE,
		files::{
			segment::{MockSegmentFileApi, SegmentFile, SegmentFileApi},
			IoCause, MockCacheDirApi,
		},
		host::{MockCacheHost, SegmentNo},
		shmem::ProcessShmem,
	};

	use super::*;

	struct TestHost {
		recovery: bool,
		redo: Mutex<Vec<Lsn>>,
	}

	impl TestHost {
		fn new() -> Self {
			Self {
				recovery: false,
				redo: Mutex::new(Vec::new()),
			}
		}

		fn recovering() -> Self {
			Self {
				recovery: true,
				..Self::new()
			}
		}
	}

	impl CacheHost for TestHost {
		fn page_precedes(&self, a: PageNo, b: PageNo) -> bool {
			a < b
		}

		fn flush_redo(&self, upto: Lsn) {
			self.redo.lock().push(upto);
		}

		fn in_recovery(&self) -> bool {
			self.recovery
		}
	}

	fn config(num_slots: usize) -> CacheConfig {
		CacheConfig {
			num_slots,
			do_fsync: false,
			..Default::default()
		}
	}

	fn disk_cache(tmp: &TempDir, num_slots: usize) -> SlruCache<TestHost> {
		SlruCache::new(
			"cache",
			&config(num_slots),
			tmp.path().to_path_buf(),
			Arc::new(TestHost::new()),
			&ProcessShmem::new(),
		)
		.unwrap()
	}

	fn mock_cache(dir: MockCacheDirApi, num_slots: usize) -> SlruCache<TestHost, MockCacheDirApi> {
		SlruCache::with_dir(
			"mock",
			&config(num_slots),
			Arc::new(dir),
			Arc::new(TestHost::new()),
			&ProcessShmem::new(),
		)
		.unwrap()
	}

	fn seed_segment(tmp: &TempDir, segno: SegmentNo, pages: u32, fill: u8) {
		fs::write(
			tmp.path().join(format!("{segno:04X}")),
			vec![fill; pages as usize * PAGE_SIZE],
		)
		.unwrap();
	}

	#[test]
	fn a_hit_after_a_miss_reads_disk_once() {
		let mut dir = MockCacheDirApi::new();
		dir.expect_open_segment().once().with(eq(0)).returning(|_| {
			let mut file = MockSegmentFileApi::new();
			file.expect_read_page()
				.once()
				.withf(|index, _| *index == 17)
				.returning(|_, buf| {
					buf.fill(0);
					Ok(())
				});
			file.expect_close().once().return_once(|| Ok(()));
			Ok(file)
		});
		let cache = mock_cache(dir, 4);

		let first = cache.read_page(17, false, 1).unwrap().index();
		let second = cache.read_page(17, false, 2).unwrap().index();

		assert_eq!(first, second);
	}

	#[test]
	fn eviction_prefers_the_oldest_page_and_spares_the_latest() {
		let tmp = tempfile::tempdir().unwrap();
		seed_segment(&tmp, 0, 32, 0);
		let cache = disk_cache(&tmp, 3);

		cache.zero_page(0).unwrap();
		cache.zero_page(1).unwrap();
		cache.zero_page(2).unwrap();

		cache.read_page(3, false, 0).unwrap();

		assert_eq!(cache.resident_pages(), vec![1, 2, 3]);
	}

	#[test]
	fn evicting_a_dirty_page_writes_it_before_the_read() {
		let mut seq = mockall::Sequence::new();
		let mut dir = MockCacheDirApi::new();
		dir.expect_create_segment()
			.once()
			.in_sequence(&mut seq)
			.with(eq(0))
			.returning(|_| {
				let mut file = MockSegmentFileApi::new();
				file.expect_write_page()
					.once()
					.withf(|index, _| *index == 0)
					.returning(|_, _| Ok(()));
				file.expect_close().once().return_once(|| Ok(()));
				Ok(file)
			});
		dir.expect_open_segment()
			.once()
			.in_sequence(&mut seq)
			.with(eq(0))
			.returning(|_| {
				let mut file = MockSegmentFileApi::new();
				file.expect_read_page()
					.once()
					.withf(|index, _| *index == 5)
					.returning(|_, buf| {
						buf.fill(0);
						Ok(())
					});
				file.expect_close().once().return_once(|| Ok(()));
				Ok(file)
			});
		let cache = mock_cache(dir, 2);

		cache.zero_page(0).unwrap();
		cache.zero_page(1).unwrap();

		let slot = cache.read_page(5, false, 0).unwrap();
		assert_eq!(slot.page_number(), 5);
		assert_eq!(slot.index(), 0);
	}

	#[test]
	fn a_missing_segment_reads_as_zeros_during_recovery() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = SlruCache::new(
			"recovery",
			&config(4),
			tmp.path().to_path_buf(),
			Arc::new(TestHost::recovering()),
			&ProcessShmem::new(),
		)
		.unwrap();

		let slot = cache.read_page(42, false, 9).unwrap();
		assert!(slot.bytes().iter().all(|b| *b == 0));
		drop(slot);

		assert_eq!(cache.slot_states()[0], (SlotState::Valid, false, 42));
	}

	#[test]
	fn truncate_refuses_an_apparent_wraparound() {
		let tmp = tempfile::tempdir().unwrap();
		seed_segment(&tmp, 0, 1, 0);
		seed_segment(&tmp, 1, 1, 0);
		let cache = disk_cache(&tmp, 4);
		cache.set_latest_page_number(10);

		cache.truncate(1_000_000).unwrap();

		assert!(tmp.path().join("0000").exists());
		assert!(tmp.path().join("0001").exists());
	}

	#[test]
	fn truncate_rounds_the_cutoff_down_to_a_segment_boundary() {
		let tmp = tempfile::tempdir().unwrap();
		let mut host = MockCacheHost::new();
		host.expect_page_precedes()
			.once()
			.with(eq(0), eq(992))
			.returning(|_, _| true);
		let cache = SlruCache::new(
			"rounding",
			&config(2),
			tmp.path().to_path_buf(),
			Arc::new(host),
			&ProcessShmem::new(),
		)
		.unwrap();

		// The rounded cutoff reaches the wraparound check, which refuses it.
		cache.truncate(1000).unwrap();
	}

	#[test]
	fn a_zeroed_page_roundtrips_through_disk() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = disk_cache(&tmp, 4);

		let slot = cache.zero_page(7).unwrap().index();
		cache.write_page(slot).unwrap();
		assert_eq!(
			fs::metadata(tmp.path().join("0000")).unwrap().len(),
			8 * PAGE_SIZE as u64
		);

		let other = disk_cache(&tmp, 4);
		let page = other.read_page(7, false, 0).unwrap();
		assert!(page.bytes().iter().all(|b| *b == 0));
	}

	#[test]
	fn writing_a_clean_page_is_a_noop() {
		let mut dir = MockCacheDirApi::new();
		dir.expect_create_segment().once().with(eq(0)).returning(|_| {
			let mut file = MockSegmentFileApi::new();
			file.expect_write_page().once().returning(|_, _| Ok(()));
			file.expect_close().once().return_once(|| Ok(()));
			Ok(file)
		});
		let cache = mock_cache(dir, 2);

		let slot = cache.zero_page(0).unwrap().index();
		cache.write_page(slot).unwrap();
		cache.write_page(slot).unwrap();

		assert_eq!(cache.slot_states()[slot], (SlotState::Valid, false, 0));
	}

	#[test]
	fn readonly_reads_hit_under_the_shared_lock() {
		let mut dir = MockCacheDirApi::new();
		dir.expect_open_segment().once().with(eq(0)).returning(|_| {
			let mut file = MockSegmentFileApi::new();
			file.expect_read_page().once().returning(|_, buf| {
				buf.fill(7);
				Ok(())
			});
			file.expect_close().once().return_once(|| Ok(()));
			Ok(file)
		});
		let cache = mock_cache(dir, 4);

		assert!(cache.try_read_page(3).is_none());

		let miss = cache.read_page_readonly(3, 0).unwrap();
		assert_eq!(miss.bytes()[0], 7);
		drop(miss);

		let hit = cache.read_page_readonly(3, 0).unwrap();
		assert_eq!(hit.page_number(), 3);
		drop(hit);

		assert!(cache.try_read_page(3).is_some());
	}

	#[test]
	fn eviction_ties_break_toward_the_earlier_page() {
		let tmp = tempfile::tempdir().unwrap();
		seed_segment(&tmp, 0, 32, 0);
		let cache = disk_cache(&tmp, 3);

		cache.zero_page(2).unwrap();
		cache.zero_page(1).unwrap();
		cache.zero_page(0).unwrap();
		for slot in 0..3 {
			cache.set_lru_tick(slot, 0);
		}

		cache.read_page(5, false, 0).unwrap();

		assert_eq!(cache.resident_pages(), vec![0, 2, 5]);
	}

	#[test]
	fn a_failed_read_surfaces_the_page_and_tag_and_empties_the_slot() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = disk_cache(&tmp, 2);

		let error = cache.read_page(9, false, 77).unwrap_err();
		match error {
			SlruError::Io { page, tag, source } => {
				assert_eq!(page, 9);
				assert_eq!(tag, 77);
				assert_eq!(source.cause, IoCause::Open);
			}
			other => panic!("unexpected error: {other}"),
		}

		assert_eq!(cache.slot_states()[0], (SlotState::Empty, false, 9));
	}

	#[test]
	fn waiters_heal_a_reader_that_died_mid_io() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = SlruCache::new(
			"heal-read",
			&config(2),
			tmp.path().to_path_buf(),
			Arc::new(TestHost::recovering()),
			&ProcessShmem::new(),
		)
		.unwrap();
		cache.poison_slot(1, SlotState::ReadInProgress, false, 9);

		let slot = cache.read_page(9, false, 0).unwrap();
		assert_eq!(slot.page_number(), 9);
		assert!(slot.bytes().iter().all(|b| *b == 0));
		drop(slot);

		assert_eq!(cache.slot_states()[1].0, SlotState::Empty);
	}

	#[test]
	fn waiters_heal_a_writer_that_died_mid_io() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = disk_cache(&tmp, 2);

		let slot = cache.zero_page(5).unwrap().index();
		cache.poison_slot(slot, SlotState::WriteInProgress, false, 5);

		cache.write_page(slot).unwrap();

		assert_eq!(cache.slot_states()[slot], (SlotState::Valid, false, 5));
		assert_eq!(
			fs::metadata(tmp.path().join("0000")).unwrap().len(),
			6 * PAGE_SIZE as u64
		);
	}

	#[test]
	fn truncate_drops_preceding_pages_and_removes_their_segments() {
		let tmp = tempfile::tempdir().unwrap();
		seed_segment(&tmp, 0, 32, 0);
		seed_segment(&tmp, 1, 32, 0);
		seed_segment(&tmp, 2, 32, 0);
		let cache = disk_cache(&tmp, 4);

		cache.read_page(1, false, 0).unwrap();
		cache.read_page(33, false, 0).unwrap();
		cache.zero_page(70).unwrap();

		cache.truncate(64).unwrap();

		assert_eq!(cache.resident_pages(), vec![70]);
		assert!(!tmp.path().join("0000").exists());
		assert!(!tmp.path().join("0001").exists());
		assert!(tmp.path().join("0002").exists());
	}

	#[test]
	fn truncate_writes_dirty_pages_before_discarding_them() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = disk_cache(&tmp, 4);

		cache.zero_page(1).unwrap();
		cache.set_latest_page_number(70);

		cache.truncate(64).unwrap();

		assert_eq!(cache.resident_pages(), Vec::<PageNo>::new());
		assert!(!tmp.path().join("0000").exists());
	}

	#[test]
	fn the_redo_log_is_flushed_to_the_max_group_position_before_a_write() {
		let tmp = tempfile::tempdir().unwrap();
		let host = Arc::new(TestHost::new());
		let mut cfg = config(4);
		cfg.lsn_groups_per_page = 2;
		let cache = SlruCache::new(
			"redo",
			&cfg,
			tmp.path().to_path_buf(),
			Arc::clone(&host),
			&ProcessShmem::new(),
		)
		.unwrap();

		let slot = {
			let mut slot = cache.zero_page(0).unwrap();
			slot.set_group_lsn(0, 100);
			slot.set_group_lsn(1, 250);
			slot.set_group_lsn(1, 200);
			assert_eq!(slot.group_lsn(1), 250, "positions never move backwards");
			slot.index()
		};
		cache.write_page(slot).unwrap();

		assert_eq!(*host.redo.lock(), vec![250]);

		// A page with no recorded positions skips the redo flush.
		let slot = cache.zero_page(1).unwrap().index();
		cache.write_page(slot).unwrap();
		assert_eq!(*host.redo.lock(), vec![250]);
	}

	#[test]
	fn flush_leaves_the_pool_clean() {
		let tmp = tempfile::tempdir().unwrap();
		let cache = disk_cache(&tmp, 4);

		cache.zero_page(0).unwrap();
		cache.zero_page(33).unwrap();

		cache.flush(false).unwrap();

		for (state, dirty, _) in cache.slot_states() {
			assert!(state == SlotState::Empty || (state == SlotState::Valid && !dirty));
		}
		assert!(tmp.path().join("0000").exists());
		assert!(tmp.path().join("0001").exists());
	}

	#[test]
	fn flush_batches_writes_across_open_segment_files() {
		let mut dir = MockCacheDirApi::new();
		for segno in 0..3u32 {
			dir.expect_create_segment()
				.once()
				.with(eq(segno))
				.returning(|_| {
					let mut file = MockSegmentFileApi::new();
					file.expect_write_page().once().returning(|_, _| Ok(()));
					file.expect_close().once().return_once(|| Ok(()));
					Ok(file)
				});
		}
		let cache = mock_cache(dir, 4);

		cache.zero_page(0).unwrap();
		cache.zero_page(32).unwrap();
		cache.zero_page(64).unwrap();

		cache.flush(true).unwrap();

		for (state, dirty, _) in cache.slot_states() {
			assert!(state == SlotState::Empty || (state == SlotState::Valid && !dirty));
		}
	}

	#[test]
	fn flush_surfaces_the_first_fsync_failure() {
		let mut dir = MockCacheDirApi::new();
		dir.expect_create_segment().once().with(eq(0)).returning(|_| {
			let mut file = MockSegmentFileApi::new();
			file.expect_write_page().once().returning(|_, _| Ok(()));
			file.expect_sync().once().returning(|| {
				Err(FileIoError::new(
					IoCause::Fsync,
					"0000",
					io::Error::other("device error"),
				))
			});
			file.expect_close().once().return_once(|| Ok(()));
			Ok(file)
		});
		let mut cfg = config(2);
		cfg.do_fsync = true;
		let cache = SlruCache::with_dir(
			"fsync",
			&cfg,
			Arc::new(dir),
			Arc::new(TestHost::new()),
			&ProcessShmem::new(),
		)
		.unwrap();
		cache.zero_page(0).unwrap();

		let error = cache.flush(true).unwrap_err();
		assert!(matches!(error, SlruError::WriteBack { page: 0, .. }));
	}

	#[test]
	fn page_exists_probes_without_surfacing_errors() {
		let tmp = tempfile::tempdir().unwrap();
		seed_segment(&tmp, 0, 32, 0);
		let cache = disk_cache(&tmp, 2);

		assert!(cache.page_exists(3));
		assert!(!cache.page_exists(200));
	}

	struct Gate {
		armed: AtomicBool,
		entered: Mutex<mpsc::Sender<()>>,
		release: Mutex<mpsc::Receiver<()>>,
		writes: AtomicUsize,
	}

	struct GateDir {
		inner: CacheDir,
		gate: Arc<Gate>,
	}

	struct GateFile {
		inner: SegmentFile,
		gate: Arc<Gate>,
	}

	impl SegmentFileApi for GateFile {
		fn read_page(&mut self, index: u32, buf: &mut [u8]) -> Result<(), FileIoError> {
			self.inner.read_page(index, buf)
		}

		fn write_page(&mut self, index: u32, buf: &[u8]) -> Result<(), FileIoError> {
			self.gate.writes.fetch_add(1, Ordering::SeqCst);
			if self.gate.armed.swap(false, Ordering::SeqCst) {
				self.gate.entered.lock().send(()).unwrap();
				self.gate.release.lock().recv().unwrap();
			}
			self.inner.write_page(index, buf)
		}

		fn sync(&mut self) -> Result<(), FileIoError> {
			self.inner.sync()
		}

		fn close(self) -> Result<(), FileIoError> {
			self.inner.close()
		}
	}

	impl CacheDirApi for GateDir {
		type SegmentFile = GateFile;
		type IterSegments = std::vec::IntoIter<Result<SegmentNo, FileIoError>>;

		fn open_segment(&self, segno: SegmentNo) -> Result<GateFile, FileIoError> {
			Ok(GateFile {
				inner: self.inner.open_segment(segno)?,
				gate: Arc::clone(&self.gate),
			})
		}

		fn create_segment(&self, segno: SegmentNo) -> Result<GateFile, FileIoError> {
			Ok(GateFile {
				inner: self.inner.create_segment(segno)?,
				gate: Arc::clone(&self.gate),
			})
		}

		fn delete_segment(&self, segno: SegmentNo) -> Result<(), FileIoError> {
			self.inner.delete_segment(segno)
		}

		fn iter_segments(&self) -> Result<Self::IterSegments, FileIoError> {
			Ok(Vec::new().into_iter())
		}
	}

	#[test]
	fn a_page_redirtied_during_its_write_stays_dirty() {
		let tmp = tempfile::tempdir().unwrap();
		let (entered_tx, entered_rx) = mpsc::channel();
		let (release_tx, release_rx) = mpsc::channel();
		let gate = Arc::new(Gate {
			armed: AtomicBool::new(true),
			entered: Mutex::new(entered_tx),
			release: Mutex::new(release_rx),
			writes: AtomicUsize::new(0),
		});
		let dir = GateDir {
			inner: CacheDir::open(tmp.path().to_path_buf()).unwrap(),
			gate: Arc::clone(&gate),
		};
		let cache = SlruCache::with_dir(
			"gate",
			&config(2),
			Arc::new(dir),
			Arc::new(TestHost::new()),
			&ProcessShmem::new(),
		)
		.unwrap();

		let slot = cache.zero_page(0).unwrap().index();

		thread::scope(|s| {
			let writer = s.spawn(|| cache.write_page(slot).unwrap());
			entered_rx.recv().unwrap();

			// The write is in flight with the control lock released; modify
			// the page through the write-ok path.
			{
				let mut guard = cache.read_page(0, true, 0).unwrap();
				guard.bytes_mut()[0] = 1;
				guard.mark_dirty();
			}

			release_tx.send(()).unwrap();
			writer.join().unwrap();
		});

		assert_eq!(cache.slot_states()[slot], (SlotState::Valid, true, 0));
		assert_eq!(gate.writes.load(Ordering::SeqCst), 1);

		cache.write_page(slot).unwrap();
		assert_eq!(gate.writes.load(Ordering::SeqCst), 2);
		assert_eq!(cache.slot_states()[slot], (SlotState::Valid, false, 0));
	}

	#[test]
	fn concurrent_readers_and_writers_preserve_the_pool_invariants() {
		let tmp = tempfile::tempdir().unwrap();
		seed_segment(&tmp, 0, 32, 0);
		let cache = disk_cache(&tmp, 4);

		thread::scope(|s| {
			for t in 0..4u32 {
				let cache = &cache;
				s.spawn(move || {
					for i in 0..40u32 {
						let page = (i * 7 + t) % 8;
						let mut slot = cache.read_page(page, true, u64::from(t)).unwrap();
						slot.bytes_mut()[t as usize] = 1;
						slot.mark_dirty();
						drop(slot);
						if i % 10 == 9 {
							cache.flush(true).unwrap();
						}
					}
				});
			}
		});

		cache.flush(false).unwrap();

		let states = cache.slot_states();
		let resident: Vec<PageNo> = states
			.iter()
			.filter(|(state, _, _)| *state != SlotState::Empty)
			.map(|(_, _, page)| *page)
			.collect();
		let mut unique = resident.clone();
		unique.sort_unstable();
		unique.dedup();
		assert_eq!(unique.len(), resident.len(), "two slots share a page");
		for (state, dirty, _) in states {
			assert!(state == SlotState::Empty || (state == SlotState::Valid && !dirty));
		}
	}
}
