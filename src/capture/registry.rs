//! Registry of recognized visual types and the artifacts they produce

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::serializers::{FigureSerializer, ImageSerializer, PlotlySerializer};
use crate::metrics::ARTIFACTS_CAPTURED;
use crate::protocol::CaptureCandidate;

/// What kind of artifact was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    StaticImage,
    InteractiveDocument,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::StaticImage => "static_image",
            ArtifactKind::InteractiveDocument => "interactive_document",
        }
    }
}

/// Encoded image bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticImage {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// A captured visual output, tied to the execution that produced it
///
/// The model only ever sees `image`; `document` is for human display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    /// Variable or expression the object came from
    pub source: String,
    /// Type tag of the originating object
    pub type_tag: String,
    /// Creation order within its execution
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<StaticImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

/// Output of one serializer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SerializedForm {
    pub image: Option<StaticImage>,
    pub document: Option<String>,
}

/// Why a candidate could not be turned into an artifact
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture payload is missing field `{0}`")]
    MissingPayload(&'static str),
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("payload is not a recognized image format")]
    UnknownImageFormat,
    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Converts candidates of one type tag
pub trait ArtifactSerializer: Send + Sync {
    /// Tag this serializer handles, e.g. `matplotlib.figure`
    fn type_tag(&self) -> &'static str;

    fn serialize(&self, candidate: &CaptureCandidate) -> Result<SerializedForm, CaptureError>;
}

/// Result of a capture pass
#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    pub artifacts: Vec<Artifact>,
    /// `source (type_tag): reason` for every candidate that was dropped
    pub skipped: Vec<String>,
}

/// Explicit set of supported visual types
#[derive(Clone, Default)]
pub struct CaptureRegistry {
    serializers: HashMap<String, Arc<dyn ArtifactSerializer>>,
}

impl CaptureRegistry {
    /// Empty registry (captures nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with figure, interactive chart and image support
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FigureSerializer));
        registry.register(Arc::new(PlotlySerializer));
        registry.register(Arc::new(ImageSerializer::default()));
        registry
    }

    /// Add or replace the serializer for its type tag
    pub fn register(&mut self, serializer: Arc<dyn ArtifactSerializer>) {
        self.serializers
            .insert(serializer.type_tag().to_string(), serializer);
    }

    pub fn is_recognized(&self, type_tag: &str) -> bool {
        self.serializers.contains_key(type_tag)
    }

    /// Sorted list of recognized tags, handed to the driver so it only scans for these
    pub fn recognized_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.serializers.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Convert candidates into artifacts in creation order
    pub fn capture(&self, mut candidates: Vec<CaptureCandidate>) -> CaptureReport {
        candidates.sort_by_key(|c| c.sequence);
        let mut report = CaptureReport::default();

        for candidate in candidates {
            let Some(serializer) = self.serializers.get(&candidate.type_tag) else {
                debug!(type_tag = %candidate.type_tag, source = %candidate.source, "Ignoring unrecognized capture");
                report.skipped.push(format!(
                    "{} ({}): unrecognized type",
                    candidate.source, candidate.type_tag
                ));
                continue;
            };

            match serializer.serialize(&candidate) {
                Ok(form) if form.image.is_some() || form.document.is_some() => {
                    let kind = if form.document.is_some() {
                        ArtifactKind::InteractiveDocument
                    } else {
                        ArtifactKind::StaticImage
                    };
                    ARTIFACTS_CAPTURED.with_label_values(&[kind.as_str()]).inc();
                    report.artifacts.push(Artifact {
                        id: format!("artifact-{}", Uuid::now_v7().simple()),
                        kind,
                        source: candidate.source,
                        type_tag: candidate.type_tag,
                        sequence: candidate.sequence,
                        image: form.image,
                        document: form.document,
                    });
                }
                Ok(_) => {
                    report.skipped.push(format!(
                        "{} ({}): empty payload",
                        candidate.source, candidate.type_tag
                    ));
                }
                Err(e) => {
                    warn!(type_tag = %candidate.type_tag, source = %candidate.source, error = %e, "Capture failed");
                    report.skipped.push(format!(
                        "{} ({}): {}",
                        candidate.source, candidate.type_tag, e
                    ));
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for CaptureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRegistry")
            .field("tags", &self.recognized_tags())
            .finish()
    }
}
