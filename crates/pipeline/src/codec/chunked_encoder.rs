use crate::protocol::{AfterWrite, Buffer, WriteGroup};
use bytes::{Bytes, BytesMut};
use std::io::Write;

const CRLF: &[u8] = b"\r\n";
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frames streamed body items with chunked transfer coding, one write group per
/// item so the data itself is never copied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkedEncoder {
    eof: bool,
    send_size: u64,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payload bytes framed so far.
    pub fn send_size(&self) -> u64 {
        self.send_size
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }

    /// Frames one body chunk. Returns `None` for an empty chunk, which would
    /// otherwise read as the terminating chunk on the wire.
    pub fn encode_chunk(&mut self, bytes: Bytes) -> Option<WriteGroup> {
        if self.eof || bytes.is_empty() {
            return None;
        }

        let mut size_line = BytesMut::with_capacity(18);
        // writing into a BytesMut can't fail
        let _ = write!(helper::Writer(&mut size_line), "{:X}\r\n", bytes.len());
        self.send_size += bytes.len() as u64;

        let buffers = [Buffer::Owned(size_line.freeze()), Buffer::Owned(bytes), Buffer::from_static(CRLF)];
        WriteGroup::new(buffers).ok().map(|group| group.with_last(false))
    }

    /// Produces the terminating chunk, the final group of the response.
    pub fn finish(&mut self, after_write: AfterWrite) -> WriteGroup {
        self.eof = true;
        WriteGroup::from_bytes(Bytes::from_static(LAST_CHUNK)).with_after_write(after_write)
    }
}

mod helper {
    use bytes::{BufMut, BytesMut};
    use std::io;

    pub struct Writer<'a>(pub &'a mut BytesMut);

    impl io::Write for Writer<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.put_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
