//! Declarative rootfs/volume descriptors carried in mount options.
//!
//! Non-bindable rootfs sources (guest-pulled images, prepared overlay
//! layers) are described by a JSON document, base64-encoded behind the
//! `io.vmcell.volume=` prefix in the OCI mount options.

use base64::Engine;
use serde::{Deserialize, Serialize};

use vmcell_shared::{Error, Result};

pub const VIRTUAL_VOLUME_PREFIX: &str = "io.vmcell.volume=";

pub mod volume_type {
    /// Image is pulled inside the guest; the host never sees layer data.
    pub const IMAGE_GUEST_PULL: &str = "image_guest_pull";
    /// Pre-mounted layer set assembled into an overlay by the guest.
    pub const OVERLAY_FS: &str = "overlay_fs";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagePullParams {
    pub image: String,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayParams {
    pub lower_dirs: Vec<String>,
    pub upper_dir: String,
    pub work_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualVolume {
    pub volume_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub image_pull: Option<ImagePullParams>,
    #[serde(default)]
    pub overlay: Option<OverlayParams>,
}

impl VirtualVolume {
    /// Scan mount options for an embedded descriptor.
    pub fn from_options(options: &[String]) -> Result<Option<VirtualVolume>> {
        for option in options {
            if let Some(encoded) = option.strip_prefix(VIRTUAL_VOLUME_PREFIX) {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| {
                        Error::ConfigInvalid(format!("virtual volume is not valid base64: {}", e))
                    })?;
                let volume: VirtualVolume = serde_json::from_slice(&raw).map_err(|e| {
                    Error::ConfigInvalid(format!("virtual volume is not valid JSON: {}", e))
                })?;
                if volume.volume_type.is_empty() {
                    return Err(Error::ConfigInvalid(
                        "virtual volume has no volume_type".to_string(),
                    ));
                }
                return Ok(Some(volume));
            }
        }
        Ok(None)
    }

    /// Render back into a mount option, the inverse of [`Self::from_options`].
    pub fn to_option(&self) -> Result<String> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("encode virtual volume: {}", e)))?;
        Ok(format!(
            "{}{}",
            VIRTUAL_VOLUME_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(raw)
        ))
    }
}
