use std::io::Write;

use flate2::write::GzEncoder;
use layerpeek::{
    read_blob, read_ranged, Config, Digest, EntryKind, ErrorKind, LayerListing, ListOptions,
    MediaType, Reference, RegistryContext,
};

mod common;

use common::{
    blobs::{Blob, MTIME},
    registry::{Registry, Running},
    Event,
};

fn serve(layer: &Blob) -> (Running, Reference) {
    let mut registry = Registry::new("layers/test");
    registry.image(Some("latest"), Blob::config(), std::slice::from_ref(layer));
    let registry = registry.start();

    let reference = Reference::try_from(registry.reference("").as_str()).unwrap();
    (registry, reference)
}

fn list(ctx: &RegistryContext, reference: &Reference, layer: &Blob) -> LayerListing {
    let options = ListOptions {
        with_content: true,
        ..ListOptions::default()
    };

    ctx.fetch_layer_listing(reference, &layer.digest, &options)
        .unwrap()
}

fn blob_requests(registry: &Running) -> Vec<Option<String>> {
    registry
        .requests()
        .into_iter()
        .filter(|r| r.method == "GET" && r.path.contains("/blobs/"))
        .map(|r| r.range)
        .collect()
}

#[test]
fn list_first_window() {
    let mut archive = Blob::archive(MediaType::OciFsTarGzip).directory("data");
    for n in 0..20 {
        archive = archive.regular(&format!("data/{n:02}"), format!("file {n}"));
    }

    let layer = archive.noise("data/big", 1024 * 1024).build();
    let (registry, reference) = serve(&layer);

    let window = 256 * 1024;
    let (ctx, events) = common::context(common::config().range_window_bytes(window));

    let options = ListOptions {
        limit: Some(10),
        ..ListOptions::default()
    };

    let listing = ctx
        .fetch_layer_listing(&reference, &layer.digest, &options)
        .unwrap();

    assert!(!listing.truncated);
    assert_eq!(listing.entries.len(), 10);
    assert_eq!(listing.entries[0].path, "/data");
    assert_eq!(listing.entries[0].kind, EntryKind::Directory);
    assert_eq!(listing.entries[9].path, "/data/08");
    assert_eq!(listing.entries[9].size, 6);
    assert_eq!(listing.entries[9].mtime, MTIME);

    // A single window was needed.
    assert_eq!(
        blob_requests(&registry),
        [Some(format!("bytes=0-{}", window - 1))]
    );

    let events = events.take();
    assert!(events.contains(&Event::Range(0, window as u64 - 1)));
    assert!(events.contains(&Event::Listed(layer.digest.clone(), 10)));

    // Limit 0 does not send any request.
    registry.clear_log();
    let options = ListOptions {
        limit: Some(0),
        ..ListOptions::default()
    };

    let listing = ctx
        .fetch_layer_listing(&reference, &layer.digest, &options)
        .unwrap();

    assert!(listing.entries.is_empty());
    assert!(registry.requests().is_empty());
}

#[test]
fn ranged_and_whole_listings_are_equal() {
    for media_type in [MediaType::OciFsTar, MediaType::OciFsTarGzip] {
        let layer = Blob::archive(media_type)
            .directory("bin")
            .noise("bin/a", 200 * 1024)
            .regular("bin/b", "b")
            .symlink("bin/c", "a")
            .noise("bin/d", 70 * 1024 + 3)
            .hard_link("bin/e", "bin/b")
            .regular(&format!("{}/long-name", "x".repeat(120)), "long")
            .build();

        let (_registry, reference) = serve(&layer);

        let ranged = common::config()
            .range_window_bytes(64 * 1024)
            .range_back_overlap_bytes(4096);

        let (ctx, events) = common::context(ranged);
        let from_ranges = list(&ctx, &reference, &layer);
        assert!(events.ranges() > 1, "{media_type:?}");

        let (ctx, events) = common::context(common::config().range_window_bytes(0));
        let from_blob = list(&ctx, &reference, &layer);
        assert_eq!(events.ranges(), 0);

        assert_eq!(from_ranges, from_blob, "{media_type:?}");

        let long_name = format!("/{}/long-name", "x".repeat(120));
        let names: Vec<_> = from_blob.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            names,
            [
                "/bin",
                "/bin/a",
                "/bin/b",
                "/bin/c",
                "/bin/d",
                "/bin/e",
                long_name.as_str(),
            ]
        );

        let e = &from_blob.entries[5];
        assert!(e.hard_link);
        assert_eq!(e.link_target.as_deref(), Some("bin/b"));
        assert_eq!(from_blob.entries[3].link_target.as_deref(), Some("a"));
        assert_eq!(from_blob.entries[2].content.as_deref(), Some(&b"b"[..]));
        assert_eq!(from_blob.entries[4].content.as_ref().unwrap().len(), 70 * 1024 + 3);
        assert_eq!(from_blob.total_size(), 270 * 1024 + 3 + 1 + 4);
    }
}

#[test]
fn registry_ignores_ranges() {
    let layer = Blob::archive(MediaType::OciFsTarGzip)
        .noise("a", 100 * 1024)
        .regular("b", "b")
        .build();

    let mut registry = Registry::new("layers/test");
    registry.image(Some("latest"), Blob::config(), std::slice::from_ref(&layer));
    let registry = registry.ignore_ranges().start();
    let reference = Reference::try_from(registry.reference("").as_str()).unwrap();

    let (ctx, _) = common::context(common::config().range_window_bytes(16 * 1024));
    let listing = list(&ctx, &reference, &layer);

    assert_eq!(listing.entries.len(), 2);
    assert_eq!(listing.entries[1].content.as_deref(), Some(&b"b"[..]));
    assert_eq!(blob_requests(&registry).len(), 1);
}

#[test]
fn multiple_gzip_members() {
    let tar = Blob::archive(MediaType::OciFsTar)
        .regular("a", "a")
        .regular("b", "b")
        .regular("c", "c")
        .build();

    // The first member ends after the first entry.
    let mut data = Vec::new();
    for part in [&tar.data[..1024], &tar.data[1024..]] {
        let mut member = GzEncoder::new(Vec::new(), Default::default());
        member.write_all(part).unwrap();
        data.extend(member.finish().unwrap());
    }

    let layer = Blob::new(MediaType::OciFsTarGzip, data);
    let (_registry, reference) = serve(&layer);

    for window in [0, 64] {
        let (ctx, _) = common::context(common::config().range_window_bytes(window));
        let listing = list(&ctx, &reference, &layer);

        let names: Vec<_> = listing.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, ["/a", "/b", "/c"], "window = {window}");
        assert!(!listing.truncated);
        assert_eq!(listing.entries[2].content.as_deref(), Some(&b"c"[..]));
    }
}

#[cfg(feature = "zstd")]
#[test]
fn zstd_layers_use_whole_blobs() {
    let layer = Blob::archive(MediaType::OciFsTarZstd)
        .regular("etc/os-release", "ID=test")
        .noise("usr/lib/blob", 300 * 1024)
        .build();

    let (registry, reference) = serve(&layer);
    let (ctx, _) = common::context(common::config().range_window_bytes(64 * 1024));

    let listing = list(&ctx, &reference, &layer);
    assert_eq!(listing.entries.len(), 2);
    assert_eq!(listing.entries[0].content.as_deref(), Some(&b"ID=test"[..]));

    let requests = blob_requests(&registry);
    assert_eq!(requests.len(), 2);
    assert!(requests[0].is_some());
    assert!(requests[1].is_none());
}

#[test]
fn invalid_layers() {
    let garbage = Blob::new(MediaType::OciFsTarGzip, vec![0xAB; 4096]);
    let (_registry, reference) = serve(&garbage);

    for window in [0, 1024] {
        let (ctx, _) = common::context(common::config().range_window_bytes(window));
        let error = ctx
            .fetch_layer_listing(&reference, &garbage.digest, &ListOptions::default())
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InvalidBlob, "window = {window}");
    }

    // Digest not in the registry.
    let (ctx, _) = common::context(common::config());
    let missing = Digest::sha256(b"missing");
    let error = ctx
        .fetch_layer_listing(&reference, &missing, &ListOptions::default())
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[test]
fn truncated_layers() {
    let layer = Blob::archive(MediaType::OciFsTar)
        .regular("a", "0123456789")
        .regular("b", "0123456789")
        .regular("c", "0123456789")
        .build();

    // Each entry uses a header block and a data block, so the third
    // header starts at 2048.
    let mut data = layer.data.clone();
    data[2048..2148].fill(0xAB);
    let layer = Blob::new(MediaType::OciFsTar, data);

    let (_registry, reference) = serve(&layer);

    for window in [0, 1024] {
        let (ctx, _) = common::context(common::config().range_window_bytes(window));
        let listing = ctx
            .fetch_layer_listing(&reference, &layer.digest, &ListOptions::default())
            .unwrap();

        assert!(listing.truncated, "window = {window}");
        assert_eq!(listing.entries.len(), 2);
    }
}

#[test]
fn read_blobs() {
    let layer = Blob::archive(MediaType::OciFsTar)
        .noise("a", 10_000)
        .build();

    let (registry, reference) = serve(&layer);
    let (ctx, _) = common::context(common::config());

    assert_eq!(read_blob(&ctx, &reference, &layer.digest).unwrap(), layer.data);

    let chunks = read_ranged(&ctx, &reference, &layer.digest, 4096)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(chunks.concat(), layer.data);
    assert!(chunks.iter().all(|c| c.len() <= 4096));

    // Every window after the first one starts with the overlap.
    let overlap = Config::default().range_back_overlap_bytes.min(2048);
    let ranges: Vec<_> = blob_requests(&registry).into_iter().flatten().collect();
    assert_eq!(ranges[0], "bytes=0-4095");
    assert_eq!(ranges[1], format!("bytes={}-{}", 4096 - overlap, 4096 - overlap + 4095));
}
