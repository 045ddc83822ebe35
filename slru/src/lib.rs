// Lint config
#![cfg_attr(
	not(test),
	warn(clippy::cast_possible_wrap),
	warn(clippy::cast_possible_truncation)
)]

mod cache;
mod consts;
mod files;
mod host;
mod physical;
mod pool;
mod shmem;
mod tick;
mod utils;

pub use cache::{CacheConfig, ExclusiveSlot, SharedSlot, SlruCache, SlruError};
pub use consts::PAGE_SIZE;
pub use files::{
	segment::{SegmentFile, SegmentFileApi},
	CacheDir, CacheDirApi, FileIoError, IoCause, IterSegments,
};
pub use host::{CacheHost, Lsn, PageNo, SegmentNo};
pub use pool::{shmem_size, SlotState};
pub use shmem::{ProcessShmem, ShmemError, ShmemHandle, ShmemProvider};
