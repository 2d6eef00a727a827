//! Split stage: carve two-page scans into their logical pages.
//!
//! Settings are keyed by [`ImageId`] — the layout is a property of the
//! scan, shared by both derived pages. Auto-detection is deliberately
//! simple: a scan much wider than tall is assumed to be a two-page spread,
//! and the split line is placed at the least-inked column near the middle
//! (the gutter).

use std::sync::Arc;

use image::{RgbaImage, imageops};

use crate::chain::{
    CancellationToken, ChainOutcome, PageGeometry, PagePayload, ResultCommand, StageError,
};
use crate::defaults::{DefaultBundles, SplitDefaults};
use crate::geometry::{Dimensions, Rect, Rotation};
use crate::ids::{ImageId, PageId, PageInfo, Relinker, SubPage};
use crate::project::{Element, IdResolver, PageEnumerator, rotation_from_attr};
use crate::stages::{StageKind, deskew};
use crate::store::SettingsStore;
use crate::validity::Validity;

const TAG: &str = "split";

/// How many pages a scan hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    /// The scan is one page.
    SinglePage,
    /// The scan is a two-page spread with a vertical split.
    TwoPages,
}

impl LayoutKind {
    /// Stable tag used in the project document.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::SinglePage => "single-page",
            Self::TwoPages => "two-pages",
        }
    }

    /// Inverse of [`tag`](Self::tag).
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "single-page" => Some(Self::SinglePage),
            "two-pages" => Some(Self::TwoPages),
            _ => None,
        }
    }
}

/// A scan's page layout: the kind plus the split line for spreads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    kind: LayoutKind,
    split_x: u32,
}

impl Layout {
    /// A single-page layout.
    #[must_use]
    pub const fn single_page() -> Self {
        Self {
            kind: LayoutKind::SinglePage,
            split_x: 0,
        }
    }

    /// A two-page layout split at `split_x`.
    #[must_use]
    pub const fn two_pages(split_x: u32) -> Self {
        Self {
            kind: LayoutKind::TwoPages,
            split_x,
        }
    }

    /// The layout kind.
    #[must_use]
    pub const fn kind(&self) -> LayoutKind {
        self.kind
    }

    /// The box one sub-page occupies within a scan of `size`.
    ///
    /// A single-page layout covers the whole scan regardless of the
    /// sub-page asked for; a two-page layout splits at the stored column.
    #[must_use]
    pub const fn page_box(&self, size: Dimensions, sub_page: SubPage) -> Rect {
        match (self.kind, sub_page) {
            (LayoutKind::SinglePage, _) | (LayoutKind::TwoPages, SubPage::Single) => {
                Rect::covering(size)
            }
            (LayoutKind::TwoPages, SubPage::Left) => Rect::new(0, 0, self.split_x, size.height),
            (LayoutKind::TwoPages, SubPage::Right) => Rect::new(
                self.split_x,
                0,
                size.width.saturating_sub(self.split_x),
                size.height,
            ),
        }
    }
}

/// Upstream inputs the stored layout depends on: the orientation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependencies {
    rotation: Rotation,
    rotated_size: Dimensions,
}

impl Dependencies {
    /// Dependencies for a scan rotated to `rotated_size`.
    #[must_use]
    pub const fn new(rotation: Rotation, rotated_size: Dimensions) -> Self {
        Self {
            rotation,
            rotated_size,
        }
    }

    /// A snapshot that never matches a real scan.
    #[must_use]
    pub(crate) const fn placeholder() -> Self {
        Self {
            rotation: Rotation::Deg0,
            rotated_size: Dimensions::new(0, 0),
        }
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("rotation", self.rotation.degrees());
        el.set_attr("width", self.rotated_size.width);
        el.set_attr("height", self.rotated_size.height);
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            rotation: rotation_from_attr(el, "rotation")?,
            rotated_size: Dimensions::new(el.parse_attr("width")?, el.parse_attr("height")?),
        })
    }
}

/// Per-scan split parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    layout: Layout,
    dependencies: Dependencies,
}

impl Params {
    /// Parameters recording `layout` against the given dependencies.
    #[must_use]
    pub const fn new(layout: Layout, dependencies: Dependencies) -> Self {
        Self {
            layout,
            dependencies,
        }
    }

    /// The stored layout.
    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    /// The dependency snapshot this layout was computed against.
    #[must_use]
    pub const fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("layout", self.layout.kind.tag());
        el.set_attr("split-x", self.layout.split_x);
        el.push(self.dependencies.to_element("dependencies"));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        let kind = LayoutKind::from_tag(el.attr("layout")?)?;
        let split_x = el.parse_attr("split-x")?;
        Some(Self {
            layout: Layout { kind, split_x },
            dependencies: Dependencies::from_element(el.child("dependencies")?)?,
        })
    }
}

/// Settings store for the split stage, keyed per scan.
pub type Settings = SettingsStore<ImageId, Params>;

/// The split stage.
pub struct Stage {
    settings: Arc<Settings>,
    defaults: SplitDefaults,
}

impl Stage {
    /// Create the stage with an empty settings store.
    #[must_use]
    pub fn new(defaults: &DefaultBundles) -> Self {
        Self {
            settings: Arc::new(Settings::new()),
            defaults: defaults.split,
        }
    }

    /// Shared handle to this stage's settings store.
    #[must_use]
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Current parameters for a page's scan.
    #[must_use]
    pub fn options_for(&self, page_id: &PageId) -> Option<Params> {
        self.settings.get(page_id.image_id())
    }

    /// Store the forced default layout for this page's scan, if the
    /// defaults force one and no parameters exist yet. Auto-detection has
    /// no default to store.
    pub fn load_default_params(&self, info: &PageInfo) {
        if let Some(kind) = self.defaults.layout {
            let layout = match kind {
                LayoutKind::SinglePage => Layout::single_page(),
                LayoutKind::TwoPages => Layout::two_pages(info.source_size().width / 2),
            };
            self.settings.set_if_absent(
                info.id().image_id().clone(),
                Params::new(layout, Dependencies::placeholder()),
            );
        }
    }

    /// Build this stage's processing unit.
    #[must_use]
    pub fn processing_unit(
        &self,
        page_id: PageId,
        next: Option<Arc<deskew::ProcessUnit>>,
        batch: bool,
        debug: bool,
    ) -> Arc<ProcessUnit> {
        Arc::new(ProcessUnit {
            settings: self.settings(),
            defaults: self.defaults,
            next,
            page_id,
            batch,
            debug,
        })
    }

    /// Build this stage's validity-check unit.
    #[must_use]
    pub fn validity_unit(&self, next: Option<Arc<deskew::CheckUnit>>) -> Arc<CheckUnit> {
        Arc::new(CheckUnit {
            settings: self.settings(),
            next,
        })
    }

    /// Serialize stored parameters for every enumerated image.
    #[must_use]
    pub fn save_settings(&self, writer: &dyn PageEnumerator) -> Element {
        let mut root = Element::new(TAG);
        writer.for_each_image(&mut |image_id, numeric| {
            if let Some(params) = self.settings.get(image_id) {
                let mut image_el = Element::new("image");
                image_el.set_attr("id", numeric);
                image_el.push(params.to_element("params"));
                root.push(image_el);
            }
        });
        root
    }

    /// Load stored parameters, skipping malformed or unresolvable
    /// entries.
    pub fn load_settings(&self, reader: &dyn IdResolver, root: &Element) {
        self.settings.clear();
        let Some(stage_el) = root.child(TAG) else {
            return;
        };
        for image_el in stage_el.children_named("image") {
            let Some(numeric) = image_el.parse_attr::<i32>("id") else {
                continue;
            };
            let Some(image_id) = reader.image_id(numeric) else {
                continue;
            };
            let Some(params_el) = image_el.child("params") else {
                continue;
            };
            let Some(params) = Params::from_element(params_el) else {
                continue;
            };
            self.settings.set(image_id, params);
        }
    }

    /// Remap stored settings after source files moved.
    pub fn perform_relinking(&self, relinker: &dyn Relinker) {
        self.settings.remap(|image_id| relinker.reassign(image_id));
    }
}

/// Split node of a processing chain.
pub struct ProcessUnit {
    settings: Arc<Settings>,
    defaults: SplitDefaults,
    next: Option<Arc<deskew::ProcessUnit>>,
    page_id: PageId,
    batch: bool,
    debug: bool,
}

impl ProcessUnit {
    /// Resolve the scan's layout, crop to this page's box, and forward.
    pub fn execute(&self, token: &CancellationToken, mut payload: PagePayload) -> ChainOutcome {
        if token.is_cancelled() {
            return ChainOutcome::Cancelled;
        }

        let size = payload.image_size();
        let dependencies = Dependencies::new(payload.geometry.rotation, size);
        let key = self.page_id.image_id().clone();
        let layout = match self.settings.get(&key) {
            Some(params) if *params.dependencies() == dependencies => params.layout(),
            _ => {
                let layout = detect_layout(&payload.image, self.defaults.layout);
                self.settings
                    .set(key, Params::new(layout, dependencies));
                layout
            }
        };

        let page_box = layout.page_box(size, self.page_id.sub_page());
        if page_box.is_empty() || !page_box.fits_within(size) {
            return ChainOutcome::Finished(ResultCommand::failure(
                StageKind::Split,
                self.batch,
                self.page_id.clone(),
                StageError::BoxOutOfBounds {
                    what: "page box",
                    rect: page_box,
                    size,
                },
            ));
        }

        payload.image = imageops::crop_imm(
            &payload.image,
            page_box.x,
            page_box.y,
            page_box.width,
            page_box.height,
        )
        .to_image();
        payload.geometry.page_box = Some(page_box);
        if self.debug {
            payload.record_trace(StageKind::Split);
        }

        match &self.next {
            Some(next) => next.execute(token, payload),
            None => {
                ChainOutcome::Finished(ResultCommand::page(StageKind::Split, self.batch, payload))
            }
        }
    }
}

/// Split node of a validity chain.
pub struct CheckUnit {
    settings: Arc<Settings>,
    next: Option<Arc<deskew::CheckUnit>>,
}

impl CheckUnit {
    pub(crate) fn check(&self, info: &PageInfo, sketch: &mut PageGeometry) -> Validity {
        let rotated_size = info.source_size().rotated(sketch.rotation);
        let dependencies = Dependencies::new(sketch.rotation, rotated_size);
        match self.settings.get(info.id().image_id()) {
            None => Validity::Missing,
            Some(params) if *params.dependencies() != dependencies => Validity::Invalid,
            Some(params) => {
                sketch.page_box = Some(params.layout().page_box(rotated_size, info.id().sub_page()));
                self.next
                    .as_ref()
                    .map_or(Validity::Valid, |next| next.check(info, sketch))
            }
        }
    }
}

/// Decide a scan's layout from its pixels.
///
/// `forced` short-circuits detection with a fixed layout kind. Otherwise
/// scans close to portrait are single pages; clearly landscape scans are
/// treated as spreads split at the least-inked column within the central
/// fifth of the image.
fn detect_layout(image: &RgbaImage, forced: Option<LayoutKind>) -> Layout {
    let width = image.width();
    let height = image.height();
    if let Some(kind) = forced {
        return match kind {
            LayoutKind::SinglePage => Layout::single_page(),
            LayoutKind::TwoPages => Layout::two_pages(width / 2),
        };
    }

    // Spreads are noticeably wider than tall: w/h >= 1.25.
    if u64::from(width) * 4 < u64::from(height) * 5 {
        return Layout::single_page();
    }

    let gray = imageops::grayscale(image);
    let band_start = width * 2 / 5;
    let band_end = (width * 3 / 5).max(band_start + 1);
    let mut best_x = width / 2;
    let mut best_ink = u64::MAX;
    for x in band_start..band_end {
        let mut ink: u64 = 0;
        for y in 0..height {
            if gray.get_pixel(x, y).0[0] < 128 {
                ink += 1;
            }
        }
        if ink < best_ink {
            best_ink = ink;
            best_x = x;
        }
    }
    Layout::two_pages(best_x)
}
