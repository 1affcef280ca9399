//! Built-in serializers for the visual types the driver knows how to scan

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::registry::{ArtifactSerializer, CaptureError, SerializedForm, StaticImage};
use crate::protocol::CaptureCandidate;

/// Size ceiling for images handed to vision models
pub const MAX_IMAGE_BYTES: usize = 4_000_000;

/// Detect an image format from its magic bytes
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

fn decode_image(b64: &str, limit: usize) -> Result<StaticImage, CaptureError> {
    let bytes = STANDARD.decode(b64.trim())?;
    if bytes.len() > limit {
        return Err(CaptureError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    let mime = sniff_image_mime(&bytes).ok_or(CaptureError::UnknownImageFormat)?;
    Ok(StaticImage {
        mime: mime.to_string(),
        bytes,
    })
}

/// Active figures of the plotting backend, rendered to PNG by the driver
#[derive(Debug, Clone, Copy, Default)]
pub struct FigureSerializer;

impl ArtifactSerializer for FigureSerializer {
    fn type_tag(&self) -> &'static str {
        "matplotlib.figure"
    }

    fn serialize(&self, candidate: &CaptureCandidate) -> Result<SerializedForm, CaptureError> {
        let b64 = candidate
            .png_b64
            .as_deref()
            .ok_or(CaptureError::MissingPayload("png_b64"))?;
        Ok(SerializedForm {
            image: Some(decode_image(b64, MAX_IMAGE_BYTES)?),
            document: None,
        })
    }
}

/// Interactive chart objects: HTML for display, PNG when the driver could export one
#[derive(Debug, Clone, Copy, Default)]
pub struct PlotlySerializer;

impl ArtifactSerializer for PlotlySerializer {
    fn type_tag(&self) -> &'static str {
        "plotly.figure"
    }

    fn serialize(&self, candidate: &CaptureCandidate) -> Result<SerializedForm, CaptureError> {
        if candidate.html.is_none() && candidate.png_b64.is_none() {
            return Err(CaptureError::MissingPayload("html"));
        }
        // Static export is optional (needs an extra renderer in the sandbox)
        let image = match candidate.png_b64.as_deref() {
            Some(b64) => Some(decode_image(b64, MAX_IMAGE_BYTES)?),
            None => None,
        };
        Ok(SerializedForm {
            image,
            document: candidate.html.clone(),
        })
    }
}

/// Image objects bound to variables
#[derive(Debug, Clone, Copy)]
pub struct ImageSerializer {
    pub max_bytes: usize,
}

impl Default for ImageSerializer {
    fn default() -> Self {
        Self {
            max_bytes: MAX_IMAGE_BYTES,
        }
    }
}

impl ArtifactSerializer for ImageSerializer {
    fn type_tag(&self) -> &'static str {
        "pil.image"
    }

    fn serialize(&self, candidate: &CaptureCandidate) -> Result<SerializedForm, CaptureError> {
        let b64 = candidate
            .image_b64
            .as_deref()
            .or(candidate.png_b64.as_deref())
            .ok_or(CaptureError::MissingPayload("image_b64"))?;
        let mut image = decode_image(b64, self.max_bytes)?;
        if let Some(declared) = candidate.image_mime.as_deref() {
            if declared.starts_with("image/") {
                image.mime = declared.to_string();
            }
        }
        Ok(SerializedForm {
            image: Some(image),
            document: None,
        })
    }
}
