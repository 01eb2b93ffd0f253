//! Layer selection.
//!
//! Decides which filesystem layers of an image were added after the marker
//! instruction and must be encrypted. Layers below the marker belong to the
//! base image and are pushed as plain compressed blobs.

use std::collections::{HashMap, HashSet};

use imgcrypt_core::error::{CryptError, Result};
use serde::{Deserialize, Serialize};

/// Substring identifying metadata-only build steps in the classic builder.
const NOP_MARKER: &str = "#(nop)";

/// One entry of an image's build history, most recent first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Image ID the entry produced, or `<missing>` for intermediate steps
    pub id: String,
    /// The instruction that produced this entry
    pub created_by: String,
    /// Size in bytes of the layer the entry added
    pub size: i64,
}

impl HistoryEntry {
    pub fn new(id: impl Into<String>, created_by: impl Into<String>, size: i64) -> Self {
        Self {
            id: id.into(),
            created_by: created_by.into(),
            size,
        }
    }

    fn is_marker(&self, marker: &str) -> bool {
        self.size == 0 && self.created_by.contains(marker)
    }

    fn adds_layer(&self) -> bool {
        self.size != 0 || !self.created_by.contains(NOP_MARKER)
    }
}

/// Count the layers added after the marker instruction.
pub fn count_layers_above_marker(history: &[HistoryEntry], marker: &str) -> Result<usize> {
    let mut count = 0;
    for entry in history {
        if entry.is_marker(marker) {
            return Ok(count);
        }
        if entry.adds_layer() {
            count += 1;
        }
    }
    Err(CryptError::MarkerNotFound(marker.to_string()))
}

/// Select the diff IDs of the layers built after the marker.
///
/// `diff_ids` is the image's root filesystem in base-to-top order; the last
/// `n` entries are selected, where `n` is the number of layers history shows
/// above the marker.
pub fn select_layers_to_encrypt(
    history: &[HistoryEntry],
    diff_ids: &[String],
    marker: &str,
) -> Result<HashSet<String>> {
    let n = count_layers_above_marker(history, marker)?;
    if n > diff_ids.len() {
        return Err(CryptError::ManifestError(format!(
            "history reports {} layers above the marker but the image has only {}",
            n,
            diff_ids.len()
        )));
    }

    let selected: HashSet<String> = diff_ids[diff_ids.len() - n..].iter().cloned().collect();
    tracing::info!(
        layers = n,
        total = diff_ids.len(),
        "Selected layers to encrypt"
    );
    Ok(selected)
}

/// ID of the image the marker was built on: the history entry right below it.
pub fn base_image_id(history: &[HistoryEntry], marker: &str) -> Result<String> {
    let idx = history
        .iter()
        .position(|h| h.created_by.contains(marker))
        .ok_or_else(|| CryptError::MarkerNotFound(marker.to_string()))?;

    match history.get(idx + 1) {
        Some(entry) if entry.id != "<missing>" && !entry.id.is_empty() => Ok(entry.id.clone()),
        Some(_) => Err(CryptError::ImageSourceError(
            "the image below the marker is not available locally".to_string(),
        )),
        None => Err(CryptError::MarkerNotFound(format!(
            "{} is the first history entry; there is no base image",
            marker
        ))),
    }
}

/// Diff IDs present in exactly one of the two layer lists.
///
/// Used when an image was derived from another local image: everything the
/// upper image shares with the lower one is inherited.
pub fn select_by_image_diff(upper: &[String], lower: &[String]) -> HashSet<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in upper.iter().chain(lower) {
        *counts.entry(id.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n == 1)
        .map(|(id, _)| id.to_string())
        .collect()
}
