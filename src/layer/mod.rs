//! Listing of the files in a layer.

mod entry;
pub(crate) mod scanner;

use std::{io::Cursor, ops::ControlFlow};

use tracing::{debug, info, warn};

use crate::{
    blobs::{self, Compression, ErrorSlot, RangedReader},
    digest::Digest,
    error::{Error, Result},
    Reference, RegistryContext,
};

use scanner::{Failures, Payload, ScanOutcome};

pub use entry::{normalize_path, EntryKind, LayerEntry};
pub(crate) use entry::{file_name, parent};

/// Options for [`list_layer`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Include whiteout entries in the listing.
    pub include_whiteouts: bool,

    /// Stop after this number of entries.
    pub limit: Option<usize>,

    /// Keep the payload of regular files.
    pub with_content: bool,
}

/// Entries of a layer, in the same order as they are in the archive.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct LayerListing {
    pub digest: Digest,

    pub entries: Vec<LayerEntry>,

    /// The archive is corrupted, and `entries` only contains the ones
    /// found before the corrupted data.
    pub truncated: bool,
}

impl LayerListing {
    /// Sum of the sizes of all entries.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// List the entries of the layer `digest`.
pub fn list_layer(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    options: &ListOptions,
) -> Result<LayerListing> {
    let mut entries = Vec::new();
    let limit = options.limit.unwrap_or(usize::MAX);

    let outcome = if limit == 0 {
        ScanOutcome::default()
    } else {
        visit_layer(ctx, reference, digest, |mut entry, mut payload| {
            if entry.kind.is_whiteout() && !options.include_whiteouts {
                return Ok(ControlFlow::Continue(()));
            }

            if options.with_content && entry.kind == EntryKind::Regular {
                entry.content = Some(payload.read_all()?);
            }

            entries.push(entry);

            if entries.len() >= limit {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        })?
    };

    info!(
        reference = %reference,
        digest = %digest,
        entries = entries.len(),
        truncated = outcome.truncated,
        "layer listed"
    );

    ctx.transport()
        .event_handler()
        .layer_listed(digest, entries.len());

    Ok(LayerListing {
        digest: digest.clone(),
        entries,
        truncated: outcome.truncated,
    })
}

/// Send every entry of the layer `digest` to `visit`.
///
/// In ranged mode, if the first window can't be parsed as an archive,
/// the whole blob is downloaded, and the scan starts again. An archive
/// that can't be parsed from the whole blob is an
/// [`Error::InvalidBlob`].
pub(crate) fn visit_layer<F>(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    mut visit: F,
) -> Result<ScanOutcome>
where
    F: FnMut(LayerEntry, Payload) -> Result<ControlFlow<()>>,
{
    let Some(window) = ctx.config().window() else {
        return scan_whole(ctx, reference, digest, visit);
    };

    let mut visited = 0;
    let result = scan_ranged(ctx, reference, digest, window, |entry, payload| {
        visited += 1;
        visit(entry, payload)
    });

    match result {
        Err(e) if visited == 0 && scanner::is_archive_error(&e) => {
            warn!(
                digest = %digest,
                error = %e,
                "unable to read layer from ranges, downloading the whole blob"
            );

            scan_whole(ctx, reference, digest, visit)
        }

        result => result,
    }
}

fn scan_ranged<F>(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    window: u64,
    visit: F,
) -> Result<ScanOutcome>
where
    F: FnMut(LayerEntry, Payload) -> Result<ControlFlow<()>>,
{
    let errors = ErrorSlot::default();
    let chunks = blobs::read_ranged(ctx, reference, digest, window);
    let mut reader = RangedReader::new(chunks, errors.clone());

    let compression = Compression::detect(reader.peek()?);
    debug!(digest = %digest, ?compression, "scanning layer from ranges");

    if compression == Compression::Zstd {
        // zstd frames are decoded from the whole blob.
        drop(reader);
        return scan_whole(ctx, reference, digest, visit);
    }

    scanner::scan(
        reader,
        compression,
        &Failures::new(ctx.scope(), errors),
        visit,
    )
}

fn scan_whole<F>(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    visit: F,
) -> Result<ScanOutcome>
where
    F: FnMut(LayerEntry, Payload) -> Result<ControlFlow<()>>,
{
    let blob = blobs::read_blob(ctx, reference, digest)?;
    let compression = Compression::detect(&blob);
    let failures = Failures::new(ctx.scope(), ErrorSlot::default());

    scanner::scan(Cursor::new(blob), compression, &failures, visit).map_err(|e| {
        if scanner::is_archive_error(&e) {
            Error::InvalidBlob(format!("{digest}: {e}"))
        } else {
            e
        }
    })
}
