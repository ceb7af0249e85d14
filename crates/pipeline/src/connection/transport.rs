//! The byte sink under the output writer.
//!
//! A [`Transport`] offers the two primitives the writer needs: a vectored
//! write and a file transfer. Both follow the `poll_*` convention of
//! [`AsyncWrite`]: `Poll::Pending` means "try later" and registers the task
//! waker for writability.

use std::fs::File;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

/// Largest file chunk moved by one call.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

pub trait Transport {
    /// Writes as much of `bufs`, in order, as the transport takes right now.
    fn poll_write_buffers(&mut self, cx: &mut Context<'_>, bufs: &[IoSlice<'_>]) -> Poll<io::Result<usize>>;

    /// Sends up to `length` bytes of `file` starting at `offset`.
    ///
    /// Returns the number of bytes sent. Fewer than `length` is a partial
    /// transfer, zero means the file ended early. After `Poll::Pending` or a
    /// partial transfer the caller continues with the same file at the offset
    /// reached so far.
    fn poll_send_file(&mut self, cx: &mut Context<'_>, file: &File, offset: u64, length: u64) -> Poll<io::Result<u64>>;

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn poll_write_buffers(&mut self, cx: &mut Context<'_>, bufs: &[IoSlice<'_>]) -> Poll<io::Result<usize>> {
        (**self).poll_write_buffers(cx, bufs)
    }

    fn poll_send_file(&mut self, cx: &mut Context<'_>, file: &File, offset: u64, length: u64) -> Poll<io::Result<u64>> {
        (**self).poll_send_file(cx, file, offset, length)
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_flush(cx)
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_shutdown(cx)
    }
}

/// A transport over any [`AsyncWrite`].
///
/// File regions are read on the blocking pool one chunk at a time and written
/// like memory. A chunk stays staged until the writer took all of it, so a
/// stalled or partial write never goes back to the disk. The staged chunk is
/// matched by file descriptor and offset; any other request drops it.
///
/// Sending files needs a running tokio runtime.
#[derive(Debug)]
pub struct IoTransport<W> {
    writer: W,
    staging: Staging,
}

#[derive(Debug, Default)]
enum Staging {
    #[default]
    Empty,
    Reading { key: FileKey, offset: u64, task: JoinHandle<io::Result<Bytes>> },
    /// `chunk` holds the file content starting at `offset`
    Staged { key: FileKey, offset: u64, chunk: Bytes },
}

impl<W> IoTransport<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer, staging: Staging::Empty }
    }

    #[inline]
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> Transport for IoTransport<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write_buffers(&mut self, cx: &mut Context<'_>, bufs: &[IoSlice<'_>]) -> Poll<io::Result<usize>> {
        if self.writer.is_write_vectored() || bufs.len() <= 1 {
            return Pin::new(&mut self.writer).poll_write_vectored(cx, bufs);
        }

        // without vectored support, write the first non-empty slice
        let first = bufs.iter().find(|buf| !buf.is_empty()).map_or(&[][..], |buf| &buf[..]);
        Pin::new(&mut self.writer).poll_write(cx, first)
    }

    fn poll_send_file(&mut self, cx: &mut Context<'_>, file: &File, offset: u64, length: u64) -> Poll<io::Result<u64>> {
        if length == 0 {
            return Poll::Ready(Ok(0));
        }

        let key = file_key(file);
        loop {
            match &mut self.staging {
                Staging::Staged { key: staged_key, offset: staged_at, chunk } if *staged_key == key && *staged_at == offset => {
                    if chunk.is_empty() {
                        self.staging = Staging::Empty;
                        return Poll::Ready(Ok(0));
                    }

                    let want = usize::try_from(length).unwrap_or(usize::MAX).min(chunk.len());
                    let written = ready!(Pin::new(&mut self.writer).poll_write(cx, &chunk[..want]))?;
                    chunk.advance(written);
                    *staged_at += written as u64;
                    if chunk.is_empty() {
                        self.staging = Staging::Empty;
                    }
                    return Poll::Ready(Ok(written as u64));
                }

                Staging::Reading { key: reading_key, offset: reading_at, task } if *reading_key == key && *reading_at == offset => {
                    let chunk = ready!(Pin::new(task).poll(cx)).map_err(io::Error::other)??;
                    self.staging = Staging::Staged { key, offset, chunk };
                }

                _ => {
                    let want = usize::try_from(length).unwrap_or(usize::MAX).min(FILE_CHUNK_SIZE);
                    let file = file.try_clone()?;
                    let task = tokio::task::spawn_blocking(move || read_chunk(&file, offset, want));
                    self.staging = Staging::Reading { key, offset, task };
                }
            }
        }
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Reads up to `want` bytes at `offset`; shorter only at the end of the file.
fn read_chunk(file: &File, offset: u64, want: usize) -> io::Result<Bytes> {
    let mut chunk = BytesMut::zeroed(want);
    let mut filled = 0;
    while filled < want {
        match read_at(file, &mut chunk[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    chunk.truncate(filled);
    Ok(chunk.freeze())
}

#[cfg(unix)]
type FileKey = std::os::fd::RawFd;

#[cfg(unix)]
fn file_key(file: &File) -> FileKey {
    use std::os::fd::AsRawFd;
    file.as_raw_fd()
}

#[cfg(windows)]
type FileKey = usize;

#[cfg(windows)]
fn file_key(file: &File) -> FileKey {
    use std::os::windows::io::AsRawHandle;
    file.as_raw_handle().addr()
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(target_os = "linux")]
pub use sendfile::{AsTcpStream, SendfileTransport};

#[cfg(target_os = "linux")]
mod sendfile {
    use std::fs::File;
    use std::io::{self, IoSlice};
    use std::os::fd::AsRawFd;
    use std::pin::Pin;
    use std::task::{Context, Poll, ready};

    use tokio::io::{AsyncWrite, Interest};
    use tokio::net::TcpStream;
    use tokio::net::tcp::OwnedWriteHalf;
    use tracing::trace;

    use super::{FILE_CHUNK_SIZE, Transport};

    /// Access to the socket behind a write handle.
    pub trait AsTcpStream {
        fn as_tcp_stream(&self) -> &TcpStream;
    }

    impl AsTcpStream for TcpStream {
        fn as_tcp_stream(&self) -> &TcpStream {
            self
        }
    }

    impl AsTcpStream for OwnedWriteHalf {
        fn as_tcp_stream(&self) -> &TcpStream {
            self.as_ref()
        }
    }

    /// A TCP transport that moves file regions with `sendfile(2)`, so file
    /// content never passes through user space.
    #[derive(Debug)]
    pub struct SendfileTransport<S> {
        stream: S,
    }

    impl<S> SendfileTransport<S>
    where
        S: AsTcpStream + AsyncWrite + Unpin,
    {
        pub fn new(stream: S) -> Self {
            Self { stream }
        }

        pub fn into_inner(self) -> S {
            self.stream
        }
    }

    impl<S> Transport for SendfileTransport<S>
    where
        S: AsTcpStream + AsyncWrite + Unpin,
    {
        fn poll_write_buffers(&mut self, cx: &mut Context<'_>, bufs: &[IoSlice<'_>]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
        }

        fn poll_send_file(&mut self, cx: &mut Context<'_>, file: &File, offset: u64, length: u64) -> Poll<io::Result<u64>> {
            let tcp = self.stream.as_tcp_stream();
            loop {
                ready!(tcp.poll_write_ready(cx))?;

                match tcp.try_io(Interest::WRITABLE, || send_file(tcp.as_raw_fd(), file.as_raw_fd(), offset, length)) {
                    Ok(sent) => {
                        trace!(offset, sent, "sendfile");
                        return Poll::Ready(Ok(sent));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }
        }

        fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }

    fn send_file(socket: i32, file: i32, offset: u64, length: u64) -> io::Result<u64> {
        let mut off = libc::off_t::try_from(offset).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let count = usize::try_from(length).unwrap_or(usize::MAX).min(FILE_CHUNK_SIZE * 4);

        // SAFETY: both descriptors are open for the duration of the call and
        // `off` is a valid, exclusively borrowed off_t.
        let sent = unsafe { libc::sendfile(socket, file, &raw mut off, count) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::cast_sign_loss, reason = "checked non-negative above")]
        Ok(sent as u64)
    }
}



#[cfg(all(test, target_os = "linux"))]
mod sendfile_tests {
    use super::*;
    use crate::connection::{ConnectionOutcome, HttpConnection};
    use crate::handler::make_handler;
    use crate::protocol::{FileRegion, ResponseBody};
    use http::{Request, Response};
    use std::convert::Infallible;
    use std::future::poll_fn;
    use std::io::Write;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn patterned_file(len: usize) -> (File, Vec<u8>) {
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&content).unwrap();
        (file, content)
    }

    #[tokio::test]
    async fn sendfile_sends_region_from_offset() {
        let (mut client, server) = socket_pair().await;
        let mut transport = SendfileTransport::new(server);
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let sent = poll_fn(|cx| transport.poll_send_file(cx, &file, 2, 5)).await.unwrap();
        assert_eq!(sent, 5);
        drop(transport);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"23456");
    }

    #[tokio::test]
    async fn sendfile_reports_early_file_end() {
        let (_client, server) = socket_pair().await;
        let mut transport = SendfileTransport::new(server);
        let (file, _) = patterned_file(10);

        let sent = poll_fn(|cx| transport.poll_send_file(cx, &file, 10, 5)).await.unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn connection_serves_file_region_with_sendfile() {
        let (mut client, server) = socket_pair().await;
        let (file, content) = patterned_file(3000);
        let file = Arc::new(file);

        let handler = Arc::new(make_handler(move |_request: Request<Bytes>| {
            let region = FileRegion::new(Arc::clone(&file), 100, 2000);
            async move { Ok::<_, Infallible>(Response::new(ResponseBody::from(region))) }
        }));

        let (reader, writer) = server.into_split();
        let connection = HttpConnection::new(reader, SendfileTransport::new(writer));
        client.write_all(b"GET /file HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();

        let read = async {
            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            received
        };
        let (outcome, received) = tokio::join!(connection.process(handler), read);

        assert!(matches!(outcome, Ok(ConnectionOutcome::Closed)));
        let head_end = received.windows(4).position(|window| window == b"\r\n\r\n").unwrap() + 4;
        assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(&received[head_end..], &content[100..2100]);
    }
}
