//! Container registry transfers.
//!
//! Registry HTTP API v2 client with verified, watchdog-guarded blob
//! downloads, and the push/pull orchestrators built on it.

pub mod auth;
pub mod client;
pub mod download;
pub mod pull;
pub mod push;
pub mod reference;

pub use auth::{BearerChallenge, RegistryAuth};
pub use client::RegistryClient;
pub use download::{BlobDownload, Watchdog};
pub use pull::{ImagePuller, PulledImage};
pub use push::{ImagePusher, LayerSelection, PushedImage};
pub use reference::ImageReference;
