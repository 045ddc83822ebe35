use std::{
	fs::File,
	io::{Read, Seek, SeekFrom, Write},
	path::PathBuf,
};

#[cfg(unix)]
use std::{io, os::unix::io::IntoRawFd};

#[cfg(test)]
use mockall::automock;

use crate::consts::PAGE_SIZE;

use super::{FileIoError, IoCause};

/// One open segment file. Page I/O is seek-then-exact-length; any short read
/// or write is a failure.
#[derive(Debug)]
pub struct SegmentFile {
	file: File,
	path: PathBuf,
}

#[cfg_attr(test, automock)]
pub trait SegmentFileApi {
	/// Reads the page at `index` (counted in pages from the start of the
	/// file).
	fn read_page(&mut self, index: u32, buf: &mut [u8]) -> Result<(), FileIoError>;

	fn write_page(&mut self, index: u32, buf: &[u8]) -> Result<(), FileIoError>;

	fn sync(&mut self) -> Result<(), FileIoError>;

	/// Closes the file, reporting the close result instead of swallowing it.
	fn close(self) -> Result<(), FileIoError>;
}

impl SegmentFile {
	pub fn new(file: File, path: PathBuf) -> Self {
		Self { file, path }
	}

	fn offset_of(index: u32) -> u64 {
		u64::from(index) * PAGE_SIZE as u64
	}

	fn seek_to(&mut self, index: u32) -> Result<(), FileIoError> {
		self.file
			.seek(SeekFrom::Start(Self::offset_of(index)))
			.map(|_| ())
			.map_err(|e| FileIoError::new(IoCause::Seek, &self.path, e))
	}
}

impl SegmentFileApi for SegmentFile {
	fn read_page(&mut self, index: u32, buf: &mut [u8]) -> Result<(), FileIoError> {
		debug_assert_eq!(buf.len(), PAGE_SIZE);
		self.seek_to(index)?;
		self.file
			.read_exact(buf)
			.map_err(|e| FileIoError::new(IoCause::Read, &self.path, e))
	}

	fn write_page(&mut self, index: u32, buf: &[u8]) -> Result<(), FileIoError> {
		debug_assert_eq!(buf.len(), PAGE_SIZE);
		self.seek_to(index)?;
		self.file
			.write_all(buf)
			.map_err(|e| FileIoError::new(IoCause::Write, &self.path, e))
	}

	fn sync(&mut self) -> Result<(), FileIoError> {
		self.file
			.sync_all()
			.map_err(|e| FileIoError::new(IoCause::Fsync, &self.path, e))
	}

	#[cfg(unix)]
	fn close(self) -> Result<(), FileIoError> {
		let fd = self.file.into_raw_fd();
		// Safety: `fd` was just detached from the `File` and is closed exactly
		// once here.
		if unsafe { libc::close(fd) } != 0 {
			return Err(FileIoError::new(
				IoCause::Close,
				self.path,
				io::Error::last_os_error(),
			));
		}
		Ok(())
	}

	#[cfg(not(unix))]
	fn close(self) -> Result<(), FileIoError> {
		Ok(())
	}
}
