//! Local image handling.
//!
//! Layer selection, archive handling, manifest assembly, and the export of
//! pulled images back into a loadable archive.

pub mod archive;
pub mod assemble;
pub mod export;
pub mod manifest;
pub mod select;
pub mod source;

pub use archive::{compress, create_tar, decompress, extract_tar};
pub use assemble::{assemble_manifest, read_archive_layout, ArchiveLayer, ArchiveLayout};
pub use export::decrypt_image;
pub use manifest::{
    config_salt, layer_salt, BlobCrypto, BlobEntry, ImageManifest, MEDIA_TYPE_CONFIG,
    MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST,
};
pub use select::{
    base_image_id, count_layers_above_marker, select_by_image_diff, select_layers_to_encrypt,
    HistoryEntry,
};
pub use source::{DockerCli, ImageInspect, ImageSource};
