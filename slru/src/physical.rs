use std::sync::Arc;

use log::{info, warn};
use static_assertions::assert_impl_all;

use crate::{
	files::{segment::SegmentFileApi, CacheDir, CacheDirApi, FileIoError},
	host::{PageNo, SegmentNo},
};

/// Maps logical pages onto segment files and performs single-page disk I/O.
pub(crate) struct PhysicalStorage<DF = CacheDir>
where
	DF: CacheDirApi,
{
	dir: Arc<DF>,
	pages_per_segment: u32,
	do_fsync: bool,
}

assert_impl_all!(PhysicalStorage: Send, Sync);

impl<DF: CacheDirApi> PhysicalStorage<DF> {
	pub fn new(dir: Arc<DF>, pages_per_segment: u32, do_fsync: bool) -> Self {
		assert!(pages_per_segment > 0);
		Self {
			dir,
			pages_per_segment,
			do_fsync,
		}
	}

	pub fn locate(&self, page: PageNo) -> (SegmentNo, u32) {
		(page / self.pages_per_segment, page % self.pages_per_segment)
	}

	pub fn first_page_of(&self, segno: SegmentNo) -> PageNo {
		segno.wrapping_mul(self.pages_per_segment)
	}

	/// Rounds `page` down to the first page of its segment.
	pub fn segment_start(&self, page: PageNo) -> PageNo {
		page - page % self.pages_per_segment
	}

	/// Reads one page into `buf`. A missing segment file while the embedder
	/// is in crash recovery reads as a zero-filled page.
	pub fn read_page(
		&self,
		page: PageNo,
		buf: &mut [u8],
		in_recovery: bool,
	) -> Result<(), FileIoError> {
		let (segno, index) = self.locate(page);
		let mut file = match self.dir.open_segment(segno) {
			Ok(file) => file,
			Err(error) if error.is_missing_file() && in_recovery => {
				info!(
					"file {} does not exist, reading page {page} as zeros",
					error.path.display()
				);
				buf.fill(0);
				return Ok(());
			}
			Err(error) => return Err(error),
		};
		file.read_page(index, buf)?;
		file.close()
	}

	/// Writes one page. With a flush context the segment file stays open in
	/// the context for a later fsync-and-close; without one, or when the
	/// context is at capacity, the write is fsynced and closed immediately.
	pub fn write_page(
		&self,
		page: PageNo,
		buf: &[u8],
		fctx: Option<&mut FlushContext<DF::SegmentFile>>,
	) -> Result<(), FileIoError> {
		let (segno, index) = self.locate(page);

		if let Some(fctx) = fctx {
			if let Some(file) = fctx.open_file(segno) {
				return file.write_page(index, buf);
			}
			if fctx.has_room() {
				let file = self.dir.create_segment(segno)?;
				let file = fctx.keep(segno, self.first_page_of(segno), file);
				return file.write_page(index, buf);
			}
		}

		let mut file = self.dir.create_segment(segno)?;
		file.write_page(index, buf)?;
		if self.do_fsync {
			file.sync()?;
		}
		if let Err(error) = file.close() {
			// A close failure after a completed write does not fail the
			// write.
			warn!("{error}");
		}
		Ok(())
	}

	/// Fsyncs (when enabled) and closes every file kept in the context. The
	/// first failure is recorded together with the failing segment's first
	/// page; the remaining files are still closed.
	pub fn finish_flush(&self, fctx: FlushContext<DF::SegmentFile>) -> Result<(), FlushError> {
		let mut first_failure: Option<FlushError> = None;
		for kept in fctx.files {
			let mut file = kept.file;
			if self.do_fsync {
				if let Err(error) = file.sync() {
					note_failure(&mut first_failure, kept.first_page, error);
				}
			}
			if let Err(error) = file.close() {
				note_failure(&mut first_failure, kept.first_page, error);
			}
		}
		match first_failure {
			Some(failure) => Err(failure),
			None => Ok(()),
		}
	}

	pub fn delete_segment(&self, segno: SegmentNo) -> Result<(), FileIoError> {
		self.dir.delete_segment(segno)
	}

	pub fn iter_segments(&self) -> Result<DF::IterSegments, FileIoError> {
		self.dir.iter_segments()
	}
}

fn note_failure(first: &mut Option<FlushError>, first_page: PageNo, error: FileIoError) {
	if first.is_none() {
		*first = Some(FlushError { first_page, error });
	} else {
		warn!("{error}");
	}
}

/// Failure of the fsync-and-close stage of a flush.
#[derive(Debug)]
pub(crate) struct FlushError {
	pub first_page: PageNo,
	pub error: FileIoError,
}

/// Segment files held open across the many page writes of one flush.
pub(crate) struct FlushContext<F: SegmentFileApi> {
	files: Vec<KeptFile<F>>,
	cap: usize,
}

struct KeptFile<F> {
	segno: SegmentNo,
	first_page: PageNo,
	file: F,
}

impl<F: SegmentFileApi> FlushContext<F> {
	pub fn new(cap: usize) -> Self {
		Self {
			files: Vec::with_capacity(cap),
			cap,
		}
	}

	fn open_file(&mut self, segno: SegmentNo) -> Option<&mut F> {
		self.files
			.iter_mut()
			.find(|kept| kept.segno == segno)
			.map(|kept| &mut kept.file)
	}

	fn has_room(&self) -> bool {
		self.files.len() < self.cap
	}

	fn keep(&mut self, segno: SegmentNo, first_page: PageNo, file: F) -> &mut F {
		self.files.push(KeptFile {
			segno,
			first_page,
			file,
		});
		let last = self.files.len() - 1;
		&mut self.files[last].file
	}
}
