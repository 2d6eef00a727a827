//! Default parameter bundles.
//!
//! A [`DefaultBundles`] value is passed into
//! [`Stages::new`](crate::stages::Stages::new) and consulted only when a
//! page has no stored parameters yet — loading defaults never overwrites
//! explicit or previously computed settings. There is no ambient global:
//! whoever constructs the pipeline decides the defaults.

use crate::geometry::{Alignment, Margins, Rotation};
use crate::stages::DetectionMode;
use crate::stages::output::ColorMode;
use crate::stages::split::LayoutKind;

/// Defaults for the orientation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrientationDefaults {
    /// Rotation applied to scans that have no stored orientation.
    pub rotation: Rotation,
}

/// Defaults for the page split stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitDefaults {
    /// Force a layout for every scan, or `None` to auto-detect per scan.
    pub layout: Option<LayoutKind>,
}

/// Defaults for the deskew stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeskewDefaults {
    /// Whether new pages estimate their skew angle automatically.
    pub mode: DetectionMode,
}

/// Defaults for the content detection stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentDefaults {
    /// Whether new pages detect their content box automatically.
    pub mode: DetectionMode,
}

/// Defaults for the margins stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarginsDefaults {
    /// Whitespace added around the content box.
    pub margins: Margins,
    /// Content placement when pages are normalized to a common size.
    pub alignment: Alignment,
}

impl Default for MarginsDefaults {
    fn default() -> Self {
        Self {
            margins: Margins::uniform(20),
            alignment: Alignment::default(),
        }
    }
}

/// Defaults for the output rendering stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDefaults {
    /// How the final page is rendered.
    pub color_mode: ColorMode,
    /// Binarization threshold used by black-and-white rendering.
    pub threshold: u8,
}

impl Default for OutputDefaults {
    fn default() -> Self {
        Self {
            color_mode: ColorMode::BlackAndWhite,
            threshold: 128,
        }
    }
}

/// Stage-keyed default parameter bundles for the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DefaultBundles {
    /// Orientation stage defaults.
    pub orientation: OrientationDefaults,
    /// Split stage defaults.
    pub split: SplitDefaults,
    /// Deskew stage defaults.
    pub deskew: DeskewDefaults,
    /// Content detection defaults.
    pub content: ContentDefaults,
    /// Margins stage defaults.
    pub margins: MarginsDefaults,
    /// Output rendering defaults.
    pub output: OutputDefaults,
}
