//! Explore OCI images in remote registries, without downloading them.
//!
//! The crate resolves references to manifests, lists the tags of a
//! repository, lists the files in a layer, and reads paths in a layer or
//! in the filesystem composed from all the layers of an image.
//!
//! Layers are read with `Range` requests, so the first entries of
//! a large layer are available after downloading a small part of it.
//!
//! All operations use a [`RegistryContext`], which holds the HTTP client
//! and the credentials for every registry.

mod blobs;
mod context;
mod digest;
mod error;
mod event_handler;
mod hex;
mod http;
mod pool;
mod resolver;
mod scope;
mod views;

pub mod config;
pub mod layer;
pub mod manifests;
pub mod overlay;
pub mod reference;
pub mod server;
pub mod tags;

pub use blobs::{read_blob, read_ranged, Chunks, Compression};
pub use config::Config;
pub use context::RegistryContext;
pub use digest::{Digest, DigestAlgorithm, DigestError};
pub use error::{Error, ErrorKind, Result};
pub use event_handler::{EventHandler, NoEventHandler};
pub use hex::hexdump;
pub use layer::{EntryKind, LayerEntry, LayerListing, ListOptions};
pub use manifests::{Descriptor, Manifest, ManifestDocument, ManifestIndex, Platform};
pub use overlay::{OverlayEntry, OverlayMap};
pub use reference::{MediaType, Reference};
pub use resolver::{
    list_directory, overlay_list, overlay_path, overlay_read, read_file, read_path, ChildEntry,
    PathContent,
};
pub use scope::{CancelHandle, OperationScope};
pub use tags::TagSet;
pub use views::{human_readable_size, ManifestView, RepositoryView, SizeView};
