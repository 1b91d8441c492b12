//! Scan entries of a tar stream.

use std::{
    cell::Cell,
    io::{self, Read, Seek},
    ops::ControlFlow,
    rc::Rc,
};

use tracing::warn;

use crate::{
    blobs::{Compression, ErrorSlot},
    error::{Error, ErrorKind, Result},
    scope::OperationScope,
};

use super::LayerEntry;

/// Result of a scan that did not fail.
#[derive(Debug, Default)]
pub(crate) struct ScanOutcome {
    /// Number of entries sent to the visitor.
    pub entries: usize,

    /// The archive was corrupted after the first entry.
    pub truncated: bool,
}

/// Payload of the entry being visited.
pub(crate) struct Payload<'a> {
    reader: &'a mut dyn Read,
    failures: &'a Failures,
}

impl Payload<'_> {
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.reader
            .read_to_end(&mut data)
            .map_err(|e| self.failures.classify(e))?;

        Ok(data)
    }
}

/// Sources of errors from a stream, used to convert I/O errors from
/// the `tar` crate to an [`Error`].
#[derive(Clone)]
pub(crate) struct Failures {
    scope: OperationScope,
    transport: ErrorSlot,
    decoder: Rc<Cell<bool>>,
}

impl Failures {
    pub fn new(scope: &OperationScope, transport: ErrorSlot) -> Self {
        Failures {
            scope: scope.clone(),
            transport,
            decoder: Default::default(),
        }
    }

    fn classify(&self, error: io::Error) -> Error {
        if let Err(e) = self.scope.check() {
            return e;
        }

        if let Some(e) = self.transport.take() {
            return e;
        }

        if error.kind() == io::ErrorKind::TimedOut {
            return Error::Deadline;
        }

        if self.decoder.get() {
            Error::Decompression(error.to_string())
        } else {
            Error::Tar(error.to_string())
        }
    }
}

/// Reader to track errors from a decoder.
struct Decoder<R> {
    reader: R,
    failed: Rc<Cell<bool>>,
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.reader.read(buf);
        if result.is_err() {
            self.failed.set(true);
        }

        result
    }
}

/// Scan the tar archive in `reader`, and send every entry to `visit`.
///
/// If the archive is not compressed, payloads are skipped with `seek`.
///
/// If the archive is corrupted after at least one entry, the scan
/// stops without errors, and the outcome is marked as truncated.
/// Errors from the registry are always returned.
pub(crate) fn scan<R, F>(
    reader: R,
    compression: Compression,
    failures: &Failures,
    visit: F,
) -> Result<ScanOutcome>
where
    R: Read + Seek,
    F: FnMut(LayerEntry, Payload) -> Result<ControlFlow<()>>,
{
    match compression {
        Compression::None => {
            let mut archive = tar::Archive::new(reader);
            let entries = archive
                .entries_with_seek()
                .map_err(|e| failures.classify(e))?;

            scan_entries(entries, failures, visit)
        }

        Compression::Gzip => {
            let decoder = Decoder {
                reader: flate2::read::MultiGzDecoder::new(reader),
                failed: Rc::clone(&failures.decoder),
            };

            let mut archive = tar::Archive::new(decoder);
            let entries = archive.entries().map_err(|e| failures.classify(e))?;
            scan_entries(entries, failures, visit)
        }

        #[cfg(feature = "zstd")]
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| Error::Decompression(e.to_string()))?;

            let decoder = Decoder {
                reader: decoder,
                failed: Rc::clone(&failures.decoder),
            };

            let mut archive = tar::Archive::new(decoder);
            let entries = archive.entries().map_err(|e| failures.classify(e))?;
            scan_entries(entries, failures, visit)
        }

        #[cfg(not(feature = "zstd"))]
        Compression::Zstd => Err(Error::Unsupported("zstd layers".into())),
    }
}

fn scan_entries<R, F>(
    entries: tar::Entries<'_, R>,
    failures: &Failures,
    mut visit: F,
) -> Result<ScanOutcome>
where
    R: Read,
    F: FnMut(LayerEntry, Payload) -> Result<ControlFlow<()>>,
{
    let mut outcome = ScanOutcome::default();

    for entry in entries {
        let parsed = entry
            .map_err(|e| failures.classify(e))
            .and_then(|entry| Ok((LayerEntry::from_tar(&entry)?, entry)));

        let (layer_entry, mut entry) = match parsed {
            Ok(p) => p,

            Err(e) if outcome.entries > 0 && is_archive_error(&e) => {
                warn!(
                    entries = outcome.entries,
                    error = %e,
                    "archive truncated"
                );

                outcome.truncated = true;
                break;
            }

            Err(e) => return Err(e),
        };

        // PAX global headers are metadata for the whole archive.
        if entry.header().entry_type() == tar::EntryType::XGlobalHeader {
            continue;
        }

        outcome.entries += 1;

        let payload = Payload {
            reader: &mut entry,
            failures,
        };

        if visit(layer_entry, payload)?.is_break() {
            break;
        }
    }

    Ok(outcome)
}

/// Errors caused by the content of the archive.
pub(crate) fn is_archive_error(error: &Error) -> bool {
    matches!(error.kind(), ErrorKind::Tar | ErrorKind::Decompression)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn archive(names: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for name in names {
            let data = name.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }

        builder.into_inner().unwrap()
    }

    fn scan_names(data: Vec<u8>, compression: Compression) -> Result<(Vec<String>, ScanOutcome)> {
        let failures = Failures::new(&OperationScope::unbounded(), ErrorSlot::default());
        let mut names = Vec::new();

        let outcome = scan(Cursor::new(data), compression, &failures, |entry, _| {
            names.push(entry.path);
            Ok(ControlFlow::Continue(()))
        })?;

        Ok((names, outcome))
    }

    #[test]
    fn scan_plain_and_gzip() {
        let tar = archive(&["a", "b/c"]);

        let (names, outcome) = scan_names(tar.clone(), Compression::None).unwrap();
        assert_eq!(names, ["/a", "/b/c"]);
        assert!(!outcome.truncated);

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), Default::default());
        io::Write::write_all(&mut gz, &tar).unwrap();
        let gz = gz.finish().unwrap();

        let (names, _) = scan_names(gz, Compression::Gzip).unwrap();
        assert_eq!(names, ["/a", "/b/c"]);
    }

    #[test]
    fn empty_numeric_fields() {
        let mut header = tar::Header::new_ustar();
        header.set_size(1);
        header.set_mode(0o600);
        header.as_ustar_mut().unwrap().uid = [0; 8];
        header.as_ustar_mut().unwrap().mtime = [b' '; 12];

        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, "f", &b"f"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let failures = Failures::new(&OperationScope::unbounded(), ErrorSlot::default());
        let mut entries = Vec::new();
        scan(Cursor::new(data), Compression::None, &failures, |entry, _| {
            entries.push(entry);
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].uid, entries[0].gid, entries[0].mtime), (0, 0, 0));
        assert_eq!(entries[0].mode, 0o600);
    }

    #[test]
    fn truncated_archives() {
        let mut tar = archive(&["a", "b", "c"]);

        // Corrupt the header of the second entry.
        tar[1024..1100].fill(0xFF);

        let (names, outcome) = scan_names(tar, Compression::None).unwrap();
        assert_eq!(names, ["/a"]);
        assert!(outcome.truncated);

        // Errors before the first entry are reported.
        let result = scan_names(vec![0xAB; 2048], Compression::None);
        assert!(matches!(result, Err(Error::Tar(_))));

        let result = scan_names(vec![0x1F, 0x8B, 0, 0], Compression::Gzip);
        assert!(matches!(result, Err(Error::Decompression(_))));
    }

    #[test]
    fn read_payloads() {
        let failures = Failures::new(&OperationScope::unbounded(), ErrorSlot::default());
        let mut contents = Vec::new();

        scan(
            Cursor::new(archive(&["x", "yy", "zzz"])),
            Compression::None,
            &failures,
            |entry, mut payload| {
                if entry.path != "/yy" {
                    contents.push(payload.read_all()?);
                }
                Ok(if contents.len() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            },
        )
        .unwrap();

        assert_eq!(contents, [b"x".to_vec(), b"zzz".to_vec()]);
    }
}
