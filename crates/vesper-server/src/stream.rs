//! Byte streams handed to scripts.
//!
//! A [`ByteStream`] wraps any `AsyncRead` (request and fetch response bodies
//! arrive through `tokio-util`'s `StreamReader`) behind a small pull
//! interface. Streams
//! shared with an [`IoContext`](crate::IoContext) are wrapped in a
//! [`TrackedStream`] so the context can drain whatever the script left unread
//! before the context is reused.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, TryStreamExt, future};
use http_body_util::BodyStream;
use hyper::body::Body;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

/// Read granularity used when buffering a stream.
pub const CHUNK_SIZE: usize = 16 * 1024;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

pub struct ByteStream {
    reader: Option<BoxedReader>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("closed", &self.reader.is_none())
            .finish()
    }
}

impl ByteStream {
    pub fn new(reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            reader: Some(Box::pin(reader)),
        }
    }

    /// Adapts an HTTP body, skipping trailer frames.
    pub fn from_body<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let chunks = BodyStream::new(body)
            .map_err(io::Error::other)
            .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())));
        Self::new(StreamReader::new(chunks))
    }

    /// Adapts a stream of chunks, such as a `reqwest` response body.
    pub fn from_stream<S, E>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        Self::new(StreamReader::new(chunks.map_err(io::Error::other)))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(io::Cursor::new(bytes.into()))
    }

    /// Reads up to `len` bytes into `buf[offset..offset + len]`.
    ///
    /// Returns `Ok(None)` at end of stream or once the stream was closed.
    pub async fn read_into(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        len: usize,
    ) -> io::Result<Option<usize>> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "read range out of bounds")
            })?;

        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        if len == 0 {
            return Ok(Some(0));
        }

        match reader.read(&mut buf[offset..end]).await? {
            0 => Ok(None),
            n => Ok(Some(n)),
        }
    }

    /// Reads the next chunk of at most `max` bytes, `None` at end of stream.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        let mut chunk = vec![0u8; max];
        match self.read_into(&mut chunk, 0, max).await? {
            Some(n) => {
                chunk.truncate(n);
                Ok(Some(Bytes::from(chunk)))
            }
            None => Ok(None),
        }
    }

    /// Buffers the rest of the stream and closes it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` once more than `limit` bytes were read, and
    /// `BrokenPipe` if the stream was already consumed.
    pub async fn read_to_end(&mut self, limit: usize) -> io::Result<Bytes> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "body already consumed"));
        }

        let mut out = BytesMut::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        while let Some(n) = self.read_into(&mut chunk, 0, CHUNK_SIZE).await? {
            if out.len() + n > limit {
                self.close();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("body exceeds {limit} bytes"),
                ));
            }
            out.extend_from_slice(&chunk[..n]);
        }
        self.close();
        Ok(out.freeze())
    }

    /// Reads and throws away everything left, then closes the stream.
    pub async fn discard(&mut self) -> io::Result<u64> {
        let copied = match self.reader.as_mut() {
            Some(reader) => tokio::io::copy(reader, &mut tokio::io::sink()).await,
            None => Ok(0),
        };
        self.close();
        copied
    }

    pub fn close(&mut self) {
        self.reader = None;
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }
}

/// A stream shared between a script and the owning IO context.
#[derive(Debug, Clone)]
pub struct TrackedStream {
    inner: Arc<tokio::sync::Mutex<ByteStream>>,
}

impl TrackedStream {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(stream)),
        }
    }

    pub async fn read_to_end(&self, limit: usize) -> io::Result<Bytes> {
        self.inner.lock().await.read_to_end(limit).await
    }

    pub async fn read_chunk(&self, max: usize) -> io::Result<Option<Bytes>> {
        self.inner.lock().await.read_chunk(max).await
    }

    pub async fn close(&self) {
        self.inner.lock().await.close();
    }

    pub async fn discard(&self) -> io::Result<u64> {
        self.inner.lock().await.discard().await
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_closed()
    }
}
