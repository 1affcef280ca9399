//! Artifact capture: turns raw capture candidates into transportable artifacts
//!
//! After every execution the driver reports the visual objects it found in
//! the namespace as [`CaptureCandidate`](crate::protocol::CaptureCandidate)s.
//! The [`CaptureRegistry`] maps each recognized type tag to an
//! [`ArtifactSerializer`]:
//!
//! ```text
//! ExecuteResponse.captures ──► CaptureRegistry ──► Vec<Artifact>
//!                                   │
//!         "matplotlib.figure" ──► FigureSerializer      (static PNG)
//!         "plotly.figure"     ──► PlotlySerializer      (HTML + optional PNG)
//!         "pil.image"         ──► ImageSerializer       (PNG/JPEG bytes)
//!         anything else       ──► skipped
//! ```
//!
//! Capture is best-effort: an unknown tag or a broken payload never fails
//! the execution it came from.

pub mod registry;
pub mod serializers;

pub use registry::{
    Artifact, ArtifactKind, ArtifactSerializer, CaptureError, CaptureRegistry, CaptureReport,
    SerializedForm, StaticImage,
};
pub use serializers::{sniff_image_mime, FigureSerializer, ImageSerializer, PlotlySerializer};
