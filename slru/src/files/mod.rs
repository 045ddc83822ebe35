use std::{fmt, fs, io, path::PathBuf};

use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::host::SegmentNo;

use self::segment::{SegmentFile, SegmentFileApi};

#[cfg(test)]
use self::segment::MockSegmentFileApi;

pub(crate) mod segment;

pub(crate) const SEGMENT_NAME_LEN: usize = 4;

/// Which step of a file operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCause {
	Open,
	Seek,
	Read,
	Write,
	Fsync,
	Close,
	Unlink,
}

impl fmt::Display for IoCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Open => "open",
			Self::Seek => "seek in",
			Self::Read => "read from",
			Self::Write => "write to",
			Self::Fsync => "fsync",
			Self::Close => "close",
			Self::Unlink => "remove",
		})
	}
}

/// A failed file operation, recorded by the physical layer and surfaced by
/// the cache only after shared state has been restored.
#[derive(Debug, Error)]
#[error("could not {cause} file {}: {source}", path.display())]
pub struct FileIoError {
	pub cause: IoCause,
	pub path: PathBuf,
	pub source: io::Error,
}

impl FileIoError {
	pub(crate) fn new(cause: IoCause, path: impl Into<PathBuf>, source: io::Error) -> Self {
		Self {
			cause,
			path: path.into(),
			source,
		}
	}

	pub(crate) fn is_missing_file(&self) -> bool {
		self.cause == IoCause::Open && self.source.kind() == io::ErrorKind::NotFound
	}
}

pub(crate) fn segment_file_name(segno: SegmentNo) -> String {
	format!("{segno:04X}")
}

fn parse_segment_file_name(name: &str) -> Option<SegmentNo> {
	if name.len() != SEGMENT_NAME_LEN
		|| !name
			.bytes()
			.all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
	{
		return None;
	}
	SegmentNo::from_str_radix(name, 16).ok()
}

/// Handle to the directory holding one cache's segment files.
pub struct CacheDir {
	path: PathBuf,
}

impl CacheDir {
	pub fn open(path: PathBuf) -> Result<Self, FileIoError> {
		fs::create_dir_all(&path).map_err(|e| FileIoError::new(IoCause::Open, &path, e))?;
		Ok(Self { path })
	}

	fn segment_path(&self, segno: SegmentNo) -> PathBuf {
		self.path.join(segment_file_name(segno))
	}

	#[cfg(test)]
	pub fn path(&self) -> &std::path::Path {
		&self.path
	}
}

#[cfg_attr(test, automock(
    type SegmentFile = MockSegmentFileApi;
    type IterSegments = std::vec::IntoIter<Result<SegmentNo, FileIoError>>;
))]
pub trait CacheDirApi {
	type SegmentFile: SegmentFileApi + Send;
	type IterSegments: Iterator<Item = Result<SegmentNo, FileIoError>>;

	/// Opens an existing segment file read-write.
	fn open_segment(&self, segno: SegmentNo) -> Result<Self::SegmentFile, FileIoError>;

	/// Opens a segment file read-write, creating it if missing. Never
	/// truncates, and tolerates concurrent creation of the same file.
	fn create_segment(&self, segno: SegmentNo) -> Result<Self::SegmentFile, FileIoError>;

	fn delete_segment(&self, segno: SegmentNo) -> Result<(), FileIoError>;

	/// Iterates the segment numbers present in the directory. File names that
	/// are not exactly four uppercase hex digits are skipped.
	fn iter_segments(&self) -> Result<Self::IterSegments, FileIoError>;
}

impl CacheDirApi for CacheDir {
	type SegmentFile = SegmentFile;
	type IterSegments = IterSegments;

	fn open_segment(&self, segno: SegmentNo) -> Result<SegmentFile, FileIoError> {
		let path = self.segment_path(segno);
		let file = fs::OpenOptions::new()
			.read(true)
			.write(true)
			.open(&path)
			.map_err(|e| FileIoError::new(IoCause::Open, &path, e))?;
		Ok(SegmentFile::new(file, path))
	}

	fn create_segment(&self, segno: SegmentNo) -> Result<SegmentFile, FileIoError> {
		let path = self.segment_path(segno);
		let file = fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(&path)
			.map_err(|e| FileIoError::new(IoCause::Open, &path, e))?;
		Ok(SegmentFile::new(file, path))
	}

	fn delete_segment(&self, segno: SegmentNo) -> Result<(), FileIoError> {
		let path = self.segment_path(segno);
		fs::remove_file(&path).map_err(|e| FileIoError::new(IoCause::Unlink, &path, e))
	}

	fn iter_segments(&self) -> Result<IterSegments, FileIoError> {
		let entries = fs::read_dir(&self.path)
			.map_err(|e| FileIoError::new(IoCause::Open, &self.path, e))?;
		Ok(IterSegments {
			entries,
			path: self.path.clone(),
		})
	}
}

pub struct IterSegments {
	entries: fs::ReadDir,
	path: PathBuf,
}

impl Iterator for IterSegments {
	type Item = Result<SegmentNo, FileIoError>;

	fn next(&mut self) -> Option<Self::Item> {
		for entry in &mut self.entries {
			let entry = match entry {
				Ok(entry) => entry,
				Err(error) => {
					return Some(Err(FileIoError::new(IoCause::Read, &self.path, error)))
				}
			};
			if let Some(segno) = entry.file_name().to_str().and_then(parse_segment_file_name) {
				return Some(Ok(segno));
			}
		}
		None
	}
}
