//! The fixed correction pipeline and its per-stage modules.
//!
//! Stage order is a build-time constant: orientation → split → deskew →
//! content → margins → output. Each submodule owns one stage's parameter
//! types, settings store, and chain units; the [`Stages`] aggregate wires
//! them together and is the single entry point drivers use to build
//! processing and validity chains.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::chain::PageGeometry;
use crate::defaults::DefaultBundles;
use crate::ids::{PageId, PageInfo, Relinker};
use crate::order::{NaturalOrder, OrderByDeviation, OrderByHeight, OrderOption};
use crate::project::{Element, IdResolver, PageEnumerator};
use crate::validity::Validity;

pub mod content;
pub mod deskew;
pub mod margins;
pub mod orientation;
pub mod output;
pub mod split;

/// Total number of pipeline stages.
pub const STAGE_COUNT: usize = 6;

/// Identifier for one correction stage, in pipeline order.
///
/// The derived ordering follows pipeline order, so `target >= kind` asks
/// "does a chain ending at `target` include `kind`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    /// Quarter-turn orientation fix.
    Orientation,
    /// Page splitting for two-page scans.
    Split,
    /// Skew removal.
    Deskew,
    /// Content box detection.
    Content,
    /// Margins and layout alignment.
    Margins,
    /// Output binarization/rendering.
    Output,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [Self; STAGE_COUNT] = [
        Self::Orientation,
        Self::Split,
        Self::Deskew,
        Self::Content,
        Self::Margins,
        Self::Output,
    ];

    /// Zero-based position in the pipeline.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Orientation => 0,
            Self::Split => 1,
            Self::Deskew => 2,
            Self::Content => 3,
            Self::Margins => 4,
            Self::Output => 5,
        }
    }

    /// Display label for the stage.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Orientation => "Fix Orientation",
            Self::Split => "Split Pages",
            Self::Deskew => "Deskew",
            Self::Content => "Select Content",
            Self::Margins => "Margins",
            Self::Output => "Output",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a stage derives its parameters itself or keeps user-supplied
/// values.
///
/// On a dependency mismatch, `Auto` parameters are recomputed from the
/// payload while `Manual` parameters are preserved and only their
/// dependency snapshot is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DetectionMode {
    /// Derive the value from the page image.
    #[default]
    Auto,
    /// Keep the value the user set.
    Manual,
}

impl DetectionMode {
    /// Stable tag used in the project document.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    /// Inverse of [`tag`](Self::tag).
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// The whole pipeline: one stage value per correction phase plus the
/// page-order selection state the UI boundary reads and writes.
pub struct Stages {
    orientation: orientation::Stage,
    split: split::Stage,
    deskew: deskew::Stage,
    content: content::Stage,
    margins: margins::Stage,
    output: output::Stage,
    selected_orders: [AtomicUsize; STAGE_COUNT],
}

impl Stages {
    /// Build the pipeline with the given default parameter bundles.
    #[must_use]
    pub fn new(defaults: &DefaultBundles) -> Self {
        Self {
            orientation: orientation::Stage::new(defaults),
            split: split::Stage::new(defaults),
            deskew: deskew::Stage::new(defaults),
            content: content::Stage::new(defaults),
            margins: margins::Stage::new(defaults),
            output: output::Stage::new(defaults),
            selected_orders: [const { AtomicUsize::new(0) }; STAGE_COUNT],
        }
    }

    /// The orientation stage.
    #[must_use]
    pub const fn orientation(&self) -> &orientation::Stage {
        &self.orientation
    }

    /// The split stage.
    #[must_use]
    pub const fn split(&self) -> &split::Stage {
        &self.split
    }

    /// The deskew stage.
    #[must_use]
    pub const fn deskew(&self) -> &deskew::Stage {
        &self.deskew
    }

    /// The content detection stage.
    #[must_use]
    pub const fn content(&self) -> &content::Stage {
        &self.content
    }

    /// The margins stage.
    #[must_use]
    pub const fn margins(&self) -> &margins::Stage {
        &self.margins
    }

    /// The output stage.
    #[must_use]
    pub const fn output(&self) -> &output::Stage {
        &self.output
    }

    /// Build a full-computation chain for one page, running every stage
    /// from orientation through `target`.
    ///
    /// The chain captures each stage's current settings store and the
    /// per-request `batch`/`debug` flags at construction; it is used for
    /// one request and then dropped.
    #[must_use]
    pub fn processing_chain(
        &self,
        page_id: &PageId,
        target: StageKind,
        batch: bool,
        debug: bool,
    ) -> Arc<orientation::ProcessUnit> {
        let output = if target >= StageKind::Output {
            Some(self.output.processing_unit(page_id.clone(), batch, debug))
        } else {
            None
        };
        let margins = if target >= StageKind::Margins {
            Some(
                self.margins
                    .processing_unit(page_id.clone(), output, batch, debug),
            )
        } else {
            None
        };
        let content = if target >= StageKind::Content {
            Some(
                self.content
                    .processing_unit(page_id.clone(), margins, batch, debug),
            )
        } else {
            None
        };
        let deskew = if target >= StageKind::Deskew {
            Some(
                self.deskew
                    .processing_unit(page_id.clone(), content, batch, debug),
            )
        } else {
            None
        };
        let split = if target >= StageKind::Split {
            Some(
                self.split
                    .processing_unit(page_id.clone(), deskew, batch, debug),
            )
        } else {
            None
        };
        self.orientation
            .processing_unit(page_id.clone(), split, batch, debug)
    }

    /// Build a cache-check chain covering orientation through `target`.
    #[must_use]
    pub fn validity_chain(&self, target: StageKind) -> Arc<orientation::CheckUnit> {
        let output = (target >= StageKind::Output).then(|| self.output.validity_unit());
        let margins = if target >= StageKind::Margins {
            Some(self.margins.validity_unit(output))
        } else {
            None
        };
        let content = if target >= StageKind::Content {
            Some(self.content.validity_unit(margins))
        } else {
            None
        };
        let deskew = if target >= StageKind::Deskew {
            Some(self.deskew.validity_unit(content))
        } else {
            None
        };
        let split = if target >= StageKind::Split {
            Some(self.split.validity_unit(deskew))
        } else {
            None
        };
        self.orientation.validity_unit(split)
    }

    /// Convenience: run a full validity chain for one page.
    #[must_use]
    pub fn check_validity(&self, info: &PageInfo) -> Validity {
        let mut sketch = PageGeometry::default();
        self.validity_chain(StageKind::Output).check(info, &mut sketch)
    }

    /// Populate defaults for every stage that has no parameters for this
    /// page yet. Existing parameters are never overwritten.
    pub fn load_default_params(&self, info: &PageInfo) {
        self.orientation.load_default_params(info);
        self.split.load_default_params(info);
        self.deskew.load_default_params(info);
        self.content.load_default_params(info);
        self.margins.load_default_params(info);
        self.output.load_default_params(info);
    }

    /// Serialize every stage's settings under one root element.
    #[must_use]
    pub fn save_project(&self, writer: &dyn PageEnumerator) -> Element {
        let mut root = Element::new("stages");
        root.push(self.orientation.save_settings(writer));
        root.push(self.split.save_settings(writer));
        root.push(self.deskew.save_settings(writer));
        root.push(self.content.save_settings(writer));
        root.push(self.margins.save_settings(writer));
        root.push(self.output.save_settings(writer));
        root
    }

    /// Load every stage's settings from a root element written by
    /// [`save_project`](Self::save_project). Unknown child elements are
    /// ignored; malformed entries are skipped per entry.
    pub fn load_project(&self, reader: &dyn IdResolver, root: &Element) {
        self.orientation.load_settings(reader, root);
        self.split.load_settings(reader, root);
        self.deskew.load_settings(reader, root);
        self.content.load_settings(reader, root);
        self.margins.load_settings(reader, root);
        self.output.load_settings(reader, root);
    }

    /// Remap every stage's settings after source files moved.
    pub fn perform_relinking(&self, relinker: &dyn Relinker) {
        self.orientation.perform_relinking(relinker);
        self.split.perform_relinking(relinker);
        self.deskew.perform_relinking(relinker);
        self.content.perform_relinking(relinker);
        self.margins.perform_relinking(relinker);
        self.output.perform_relinking(relinker);
    }

    /// The page-order strategies available at `kind`.
    ///
    /// Every stage offers natural order; deskew adds order-by-deviation
    /// and margins adds order-by-height.
    #[must_use]
    pub fn order_options(&self, kind: StageKind) -> Vec<OrderOption> {
        let mut options = vec![OrderOption::new("Natural order", Arc::new(NaturalOrder))];
        match kind {
            StageKind::Deskew => options.push(OrderOption::new(
                "Order by decreasing deviation",
                Arc::new(OrderByDeviation::new(self.deskew.settings())),
            )),
            StageKind::Margins => options.push(OrderOption::new(
                "Order by decreasing height",
                Arc::new(OrderByHeight::new(
                    self.content.settings(),
                    self.margins.settings(),
                )),
            )),
            _ => {}
        }
        options
    }

    /// The currently selected order option index at `kind`.
    #[must_use]
    pub fn selected_order(&self, kind: StageKind) -> usize {
        self.selected_orders[kind.index()].load(Ordering::Relaxed)
    }

    /// Select an order option at `kind`. Out-of-range indices fall back
    /// to natural order.
    pub fn select_order(&self, kind: StageKind, option: usize) {
        let clamped = if option < self.order_options(kind).len() {
            option
        } else {
            0
        };
        self.selected_orders[kind.index()].store(clamped, Ordering::Relaxed);
    }
}
