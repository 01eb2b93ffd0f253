//! imgcrypt Runtime - Image encryption engine.
//!
//! Wraps per-blob data keys under a passphrase, encrypts image blobs with a
//! chunked AEAD stream, selects the layers to protect from an image's build
//! history, and moves encrypted images to and from registries with every
//! downloaded byte verified against its digest.

#![allow(clippy::result_large_err)]

pub mod crypto;
pub mod image;
pub mod registry;

// Re-export common types
pub use crypto::{unwrap_key, wrap_key, Algorithm, CryptoOpts, DataKey, WrappedKey};
pub use crypto::{decrypt_file, decrypt_stream, encrypt_file, encrypt_stream};
pub use image::{assemble_manifest, decrypt_image, read_archive_layout, ArchiveLayout};
pub use image::{base_image_id, select_by_image_diff, select_layers_to_encrypt, HistoryEntry};
pub use image::{BlobCrypto, BlobEntry, DockerCli, ImageManifest, ImageSource};
pub use registry::{BlobDownload, ImagePuller, ImagePusher, LayerSelection, PulledImage, PushedImage};
pub use registry::{ImageReference, RegistryAuth, RegistryClient, Watchdog};

/// imgcrypt Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
