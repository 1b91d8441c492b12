use std::{cell::RefCell, io::Write, rc::Rc};

use flate2::write::GzEncoder;
use layerpeek::{Digest, MediaType};
use serde::ser::SerializeStruct;

/// Modification time for every entry: `2024-01-01 00:00 UTC`.
pub const MTIME: u64 = 1704067200;

#[derive(Clone, Debug)]
pub struct Blob {
    pub media_type: MediaType,
    pub digest: Digest,
    pub data: Vec<u8>,
}

impl serde::Serialize for Blob {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("Blob", 3)?;
        s.serialize_field("mediaType", self.media_type.as_str())?;
        s.serialize_field("digest", &self.digest)?;
        s.serialize_field("size", &self.data.len())?;
        s.end()
    }
}

impl Blob {
    pub fn new(media_type: MediaType, data: impl Into<Vec<u8>>) -> Blob {
        let data = data.into();
        Blob {
            media_type,
            digest: Digest::sha256(&data),
            data,
        }
    }

    pub fn config() -> Blob {
        Blob::new(MediaType::OciConfig, &br#"{"architecture":"amd64","os":"linux"}"#[..])
    }

    /// Return a builder to create an archive.
    pub fn archive(media_type: MediaType) -> BlobArchive {
        let buffer = SharedBuffer(Rc::new(Vec::with_capacity(4096).into()));

        let stream: Box<dyn Write> = match media_type {
            MediaType::OciFsTarGzip | MediaType::DockerFsTarGzip => {
                Box::new(GzEncoder::new(buffer.clone(), Default::default()))
            }

            #[cfg(feature = "zstd")]
            MediaType::OciFsTarZstd => Box::new(
                zstd::stream::write::Encoder::new(buffer.clone(), 0)
                    .unwrap()
                    .auto_finish(),
            ),

            _ => Box::new(buffer.clone()),
        };

        BlobArchive {
            media_type,
            buffer,
            archive: tar::Builder::new(stream),
        }
    }
}

pub struct BlobArchive {
    media_type: MediaType,
    buffer: SharedBuffer,
    archive: tar::Builder<Box<dyn Write>>,
}

#[derive(Clone)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobArchive {
    pub fn build(mut self) -> Blob {
        self.archive.finish().unwrap();
        drop(self.archive.into_inner().unwrap());

        Blob::new(self.media_type, self.buffer.0.take())
    }

    fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(MTIME);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    pub fn directory(mut self, path: &str) -> Self {
        let mut header = Self::header(tar::EntryType::dir(), 0o755, 0);
        self.archive.append_data(&mut header, path, &b""[..]).unwrap();
        self
    }

    pub fn regular(mut self, path: &str, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        let mut header = Self::header(tar::EntryType::file(), 0o644, data.len() as u64);
        self.archive.append_data(&mut header, path, data).unwrap();
        self
    }

    /// Regular file with `size` bytes that gzip can't compress.
    pub fn noise(self, path: &str, size: usize) -> Self {
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let data: Vec<u8> = (0..size)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        self.regular(path, data)
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(tar::EntryType::symlink(), 0o777, 0);
        self.archive.append_link(&mut header, path, target).unwrap();
        self
    }

    pub fn hard_link(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(tar::EntryType::hard_link(), 0o644, 0);
        self.archive.append_link(&mut header, path, target).unwrap();
        self
    }

    /// Delete `name` in `directory` from lower layers.
    pub fn whiteout(self, directory: &str, name: &str) -> Self {
        self.regular(&format!("{directory}/.wh.{name}"), "")
    }

    /// Hide the contents of `directory` in lower layers.
    pub fn opaque(self, directory: &str) -> Self {
        self.regular(&format!("{directory}/.wh..wh..opq"), "")
    }
}
