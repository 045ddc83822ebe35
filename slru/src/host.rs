#[cfg(test)]
use mockall::automock;

/// Logical page number. Wraps around at a modulus chosen by the embedder.
pub type PageNo = u32;

/// Segment file number; wraps at the same boundary as page numbers.
pub type SegmentNo = u32;

/// Redo-log position. Zero means "no position recorded".
pub type Lsn = u64;

/// Capabilities the embedding subsystem supplies to a cache.
#[cfg_attr(test, automock)]
pub trait CacheHost: Send + Sync {
	/// Strict ordering on page numbers, aware of the embedder's wrap-around
	/// modulus. Must be irreflexive and antisymmetric on any bounded window
	/// of live pages; the cache only compares pages currently in the pool or
	/// on disk.
	fn page_precedes(&self, a: PageNo, b: PageNo) -> bool;

	/// Persist the redo log up to `upto` before a page depending on it is
	/// written.
	///
	/// Must not fail: an implementation that cannot flush is expected to
	/// abort the process, and a panic here is unrecoverable by contract.
	fn flush_redo(&self, upto: Lsn);

	/// Whether the embedder is currently replaying after a crash. While true,
	/// reads of missing segment files yield zero-filled pages.
	fn in_recovery(&self) -> bool;
}
