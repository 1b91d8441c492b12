//! Blob reader.
//!
//! Layers are read with a sequence of `Range` requests (*windows*), so
//! listing the first entries of a large layer does not require to
//! download all of it.

use std::{
    cell::RefCell,
    io::{self, Read, Seek, SeekFrom},
    rc::Rc,
};

use tracing::{debug, warn};

use crate::{
    digest::Digest,
    error::{Error, Result},
    http::RangeResponse,
    Reference, RegistryContext,
};

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];

const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];

/// Compression of a layer, detected from its first bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    None,
}

impl Compression {
    pub fn detect(prefix: &[u8]) -> Compression {
        if prefix.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if prefix.starts_with(ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Download a whole blob. Its content is verified against `digest`.
pub fn read_blob(ctx: &RegistryContext, reference: &Reference, digest: &Digest) -> Result<Vec<u8>> {
    debug!(reference = %reference, digest = %digest, "reading whole blob");
    ctx.transport().get_bytes(ctx.scope(), reference, digest)
}

/// Read a blob in windows of `window` bytes.
pub fn read_ranged<'a>(
    ctx: &'a RegistryContext,
    reference: &'a Reference,
    digest: &'a Digest,
    window: u64,
) -> Chunks<'a> {
    let window = window.max(1);
    Chunks {
        ctx,
        reference,
        digest,
        window,
        overlap: ctx.config().overlap(window),
        offset: 0,
        tail: Vec::new(),
        done: false,
    }
}

/// Iterator over the windows of a blob.
///
/// Every item contains the bytes following the previous item. Each
/// request starts `overlap` bytes before the end of the previous
/// window, and those bytes must be identical to the ones already
/// received.
///
/// The iterator ends after a window shorter than requested, a `416`,
/// or an empty response. If the registry ignores the `Range` header,
/// the rest of the full response is returned as the last item.
pub struct Chunks<'a> {
    ctx: &'a RegistryContext,
    reference: &'a Reference,
    digest: &'a Digest,
    window: u64,
    overlap: u64,

    /// Position of the next byte to return.
    offset: u64,

    /// Last bytes before `offset`.
    tail: Vec<u8>,

    done: bool,
}

impl Chunks<'_> {
    /// Position of the next byte returned by the iterator.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move to `offset`. The next window starts there, without overlap.
    pub fn seek_to(&mut self, offset: u64) {
        if offset != self.offset {
            self.offset = offset;
            self.tail.clear();
        }
    }

    fn next_window(&mut self) -> Result<Option<Vec<u8>>> {
        let overlap = self.tail.len() as u64;
        let start = self.offset - overlap;

        let response = self.ctx.transport().get_range(
            self.ctx.scope(),
            self.reference,
            self.digest,
            start,
            self.window,
        )?;

        let body = match response {
            RangeResponse::Exhausted => return Ok(None),

            RangeResponse::Partial(body) => body,

            RangeResponse::Whole(body) => {
                debug!(digest = %self.digest, "registry ignored the range");
                self.done = true;

                if !self.digest.matches(&body) {
                    return Err(Error::Protocol(format!(
                        "Digest mismatch for blob {}",
                        self.digest
                    )));
                }

                let offset = usize::try_from(self.offset).unwrap_or(usize::MAX);
                return Ok(body.get(offset..).filter(|b| !b.is_empty()).map(Vec::from));
            }
        };

        if body.len() as u64 > self.window {
            return Err(Error::Protocol(format!(
                "Range response for {} is larger than requested",
                self.digest
            )));
        }

        if body.len() < self.tail.len() || body[..self.tail.len()] != self.tail[..] {
            warn!(digest = %self.digest, offset = start, "range windows do not match");
            return Err(Error::Protocol(format!(
                "Inconsistent range response for {} at {start}",
                self.digest
            )));
        }

        if (body.len() as u64) < self.window {
            self.done = true;
        }

        let keep = body.len().saturating_sub(self.overlap as usize);
        self.tail = body[keep..].to_vec();

        let chunk = body[overlap as usize..].to_vec();
        if chunk.is_empty() {
            return Ok(None);
        }

        self.offset += chunk.len() as u64;
        Ok(Some(chunk))
    }
}

impl Iterator for Chunks<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_window() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Storage for the first error found by a reader.
///
/// Decoders and the `tar` crate wrap I/O errors in their own types, so
/// the original [`Error`] is kept here to be reported after the read.
#[derive(Clone, Default)]
pub(crate) struct ErrorSlot(Rc<RefCell<Option<Error>>>);

impl ErrorSlot {
    /// Store `error`, and return an [`io::Error`] describing it.
    pub fn store(&self, error: Error) -> io::Error {
        let io_error = io::Error::new(
            match error.kind() {
                crate::ErrorKind::Deadline => io::ErrorKind::TimedOut,
                _ => io::ErrorKind::Other,
            },
            error.to_string(),
        );

        self.0.borrow_mut().get_or_insert(error);
        io_error
    }

    pub fn take(&self) -> Option<Error> {
        self.0.borrow_mut().take()
    }
}

/// `Read + Seek` implementation on top of [`Chunks`].
///
/// Only forward seeks are supported beyond the current window. A seek
/// past the buffered bytes discards them, and the next window starts
/// at the new position.
pub(crate) struct RangedReader<'a> {
    chunks: Chunks<'a>,

    buffer: Vec<u8>,

    /// Position in `buffer`.
    position: usize,

    /// Offset in the blob of the first byte in `buffer`.
    buffer_start: u64,

    errors: ErrorSlot,
}

impl<'a> RangedReader<'a> {
    pub fn new(chunks: Chunks<'a>, errors: ErrorSlot) -> Self {
        RangedReader {
            buffer_start: chunks.offset(),
            chunks,
            buffer: Vec::new(),
            position: 0,
            errors,
        }
    }

    /// Return the first bytes available in the reader, fetching the
    /// first window if needed.
    pub fn peek(&mut self) -> Result<&[u8]> {
        if self.position >= self.buffer.len() {
            match self.chunks.next() {
                Some(chunk) => self.replace_buffer(chunk?),
                None => self.replace_buffer(Vec::new()),
            }
        }

        Ok(&self.buffer[self.position..])
    }

    fn replace_buffer(&mut self, chunk: Vec<u8>) {
        self.buffer_start += self.buffer.len() as u64;
        self.buffer = chunk;
        self.position = 0;
    }

    fn logical_position(&self) -> u64 {
        self.buffer_start + self.position as u64
    }
}

impl Read for RangedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.position >= self.buffer.len() {
            match self.chunks.next() {
                None => return Ok(0),
                Some(Err(e)) => return Err(self.errors.store(e)),
                Some(Ok(chunk)) => self.replace_buffer(chunk),
            }
        }

        let available = &self.buffer[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;

        Ok(n)
    }
}

impl Seek for RangedReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(n) => self.logical_position().checked_add_signed(n),
            SeekFrom::End(_) => None,
        };

        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Invalid seek in a ranged blob",
            ));
        };

        let buffer_end = self.buffer_start + self.buffer.len() as u64;

        if (self.buffer_start..=buffer_end).contains(&target) {
            self.position = (target - self.buffer_start) as usize;
        } else if target > buffer_end {
            self.chunks.seek_to(target);
            self.buffer.clear();
            self.position = 0;
            self.buffer_start = target;
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Backward seek in a ranged blob",
            ));
        }

        Ok(target)
    }
}
