//! Outbound data units.
//!
//! A [`Buffer`] is one contiguous piece of a response in one of three forms:
//!
//! - [`Buffer::Owned`]: bytes produced for this response only
//! - [`Buffer::Shared`]: a sub-range of [`SharedBytes`], an atomically reference
//!   counted body that may be reused by many connections at once
//! - [`Buffer::File`]: a [`FileRegion`] sent with a zero-copy primitive where the
//!   transport supports one
//!
//! Buffers are immutable once built. Ranges are validated at construction so a
//! buffer can never reach past its backing storage.

use std::fmt;
use std::fs::File;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;

use crate::ensure;
use crate::protocol::PipelineError;

/// Immutable storage shared across responses and connections.
///
/// Cloning is cheap and only bumps the reference count; the storage is freed
/// deterministically when the last holder is dropped.
#[derive(Clone)]
pub struct SharedBytes {
    inner: Arc<[u8]>,
}

impl SharedBytes {
    pub fn new<T: Into<Arc<[u8]>>>(data: T) -> Self {
        Self { inner: data.into() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of live handles on this storage, including `self`.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Creates a slice covering `range`, failing if it reaches past the storage.
    pub fn slice(&self, range: Range<usize>) -> Result<SharedSlice, PipelineError> {
        ensure!(
            range.start <= range.end,
            PipelineError::invalid_buffer(format!("shared range {}..{} is reversed", range.start, range.end))
        );
        ensure!(
            range.end <= self.len(),
            PipelineError::invalid_buffer(format!("shared range {}..{} exceeds storage of {} bytes", range.start, range.end, self.len()))
        );
        Ok(SharedSlice { storage: self.clone(), range })
    }

    /// Creates a slice covering the whole storage.
    pub fn full(&self) -> SharedSlice {
        SharedSlice { storage: self.clone(), range: 0..self.len() }
    }
}

impl fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBytes").field("len", &self.len()).field("ref_count", &self.ref_count()).finish()
    }
}

impl From<Vec<u8>> for SharedBytes {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&'static str> for SharedBytes {
    fn from(value: &'static str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<&[u8]> for SharedBytes {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

/// A validated sub-range of [`SharedBytes`].
#[derive(Clone, Debug)]
pub struct SharedSlice {
    storage: SharedBytes,
    range: Range<usize>,
}

impl SharedSlice {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage.inner[self.range.clone()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn storage(&self) -> &SharedBytes {
        &self.storage
    }
}

/// A region of an open file, transferred without staging it in process memory
/// when the transport allows it.
///
/// The file handle is reference counted so several regions of one file can sit
/// in the same or in different write groups; it is closed when the last region
/// is dropped.
#[derive(Clone)]
pub struct FileRegion {
    file: Arc<File>,
    offset: u64,
    length: u64,
}

impl FileRegion {
    pub fn new<F: Into<Arc<File>>>(file: F, offset: u64, length: u64) -> Self {
        Self { file: file.into(), offset, length }
    }

    /// Creates a region spanning the whole file, sized from its metadata.
    pub fn whole(file: File) -> Result<Self, PipelineError> {
        let length = file
            .metadata()
            .map_err(|e| PipelineError::invalid_buffer(format!("can't read file metadata: {e}")))?
            .len();
        Ok(Self::new(file, 0, length))
    }

    #[inline]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        ensure!(self.length > 0, PipelineError::invalid_buffer("file region length must be positive"));
        ensure!(
            self.offset.checked_add(self.length).is_some(),
            PipelineError::invalid_buffer(format!("file region {}+{} overflows", self.offset, self.length))
        );
        Ok(())
    }
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion").field("offset", &self.offset).field("length", &self.length).finish_non_exhaustive()
    }
}

/// One contiguous unit of outbound data.
#[derive(Clone, Debug)]
pub enum Buffer {
    Owned(Bytes),
    Shared(SharedSlice),
    File(FileRegion),
}

impl Buffer {
    pub fn owned<B: Into<Bytes>>(bytes: B) -> Self {
        Self::Owned(bytes.into())
    }

    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self::Owned(Bytes::from_static(bytes))
    }

    pub fn shared(storage: &SharedBytes, range: Range<usize>) -> Result<Self, PipelineError> {
        storage.slice(range).map(Self::Shared)
    }

    pub fn file(region: FileRegion) -> Self {
        Self::File(region)
    }

    /// Size of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        match self {
            Buffer::Owned(bytes) => bytes.len() as u64,
            Buffer::Shared(slice) => slice.len() as u64,
            Buffer::File(region) => region.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the buffer lives in process memory and can join a vectored write.
    #[inline]
    pub fn is_memory(&self) -> bool {
        !matches!(self, Buffer::File(_))
    }

    #[inline]
    pub(crate) fn memory(&self) -> Option<&[u8]> {
        match self {
            Buffer::Owned(bytes) => Some(bytes.as_ref()),
            Buffer::Shared(slice) => Some(slice.as_bytes()),
            Buffer::File(_) => None,
        }
    }
}

impl From<Bytes> for Buffer {
    fn from(bytes: Bytes) -> Self {
        Self::Owned(bytes)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes.into())
    }
}

impl From<&'static str> for Buffer {
    fn from(str: &'static str) -> Self {
        Self::Owned(Bytes::from_static(str.as_bytes()))
    }
}

impl From<SharedSlice> for Buffer {
    fn from(slice: SharedSlice) -> Self {
        Self::Shared(slice)
    }
}

impl From<FileRegion> for Buffer {
    fn from(region: FileRegion) -> Self {
        Self::File(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_slice_stays_within_storage() {
        let storage = SharedBytes::from("hello world");

        let slice = storage.slice(6..11).unwrap();
        assert_eq!(slice.as_bytes(), b"world");

        assert!(matches!(storage.slice(6..12), Err(PipelineError::InvalidBuffer { .. })));
        #[allow(clippy::reversed_empty_ranges, reason = "reversed range is the case under test")]
        let reversed = storage.slice(5..2);
        assert!(matches!(reversed, Err(PipelineError::InvalidBuffer { .. })));
    }

    #[test]
    fn shared_slices_hold_the_storage() {
        let storage = SharedBytes::from(vec![1u8; 32]);
        assert_eq!(storage.ref_count(), 1);

        let a = Buffer::shared(&storage, 0..16).unwrap();
        let b = Buffer::shared(&storage, 16..32).unwrap();
        assert_eq!(storage.ref_count(), 3);

        drop(a);
        assert_eq!(storage.ref_count(), 2);
        drop(b);
        assert_eq!(storage.ref_count(), 1);
    }

    #[test]
    fn file_region_validation() {
        let file = tempfile::tempfile().unwrap();
        let file = Arc::new(file);

        assert!(FileRegion::new(Arc::clone(&file), 0, 0).validate().is_err());
        assert!(FileRegion::new(Arc::clone(&file), u64::MAX, 2).validate().is_err());
        assert!(FileRegion::new(file, 10, 20).validate().is_ok());
    }

    #[test]
    fn file_region_whole_uses_metadata() {
        use std::io::Write;

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[7u8; 1000]).unwrap();

        let region = FileRegion::whole(file).unwrap();
        assert_eq!(region.offset(), 0);
        assert_eq!(region.len(), 1000);
        assert_eq!(Buffer::file(region).len(), 1000);
    }
}
