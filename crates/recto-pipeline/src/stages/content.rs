//! Content stage: find the printable area of a deskewed page.
//!
//! Detection thresholds the page and takes the bounding box of dark
//! pixels. A page with no dark pixels at all has no content box — that is
//! a typed stage failure, surfaced to the presentation rather than
//! silently producing an empty crop.

use std::sync::Arc;

use image::{RgbaImage, imageops};

use crate::chain::{
    CancellationToken, ChainOutcome, PageGeometry, PagePayload, ResultCommand, StageError,
};
use crate::defaults::{ContentDefaults, DefaultBundles};
use crate::geometry::Rect;
use crate::ids::{PageId, PageInfo, Relinker};
use crate::project::{Element, IdResolver, PageEnumerator, rect_element, rect_from_element};
use crate::stages::{DetectionMode, StageKind, margins};
use crate::store::SettingsStore;
use crate::validity::Validity;

const TAG: &str = "content";

/// Ink threshold: pixels darker than this count as content.
const INK_THRESHOLD: u8 = 140;

/// Upstream inputs the stored content box was computed against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dependencies {
    page_box: Rect,
    skew_degrees: f64,
}

impl Dependencies {
    /// Dependencies for a page cut to `page_box` and deskewed by
    /// `skew_degrees`.
    #[must_use]
    pub const fn new(page_box: Rect, skew_degrees: f64) -> Self {
        Self {
            page_box,
            skew_degrees,
        }
    }

    /// A snapshot that never matches a real page.
    #[must_use]
    pub(crate) const fn placeholder() -> Self {
        Self {
            page_box: Rect::new(0, 0, 0, 0),
            skew_degrees: 0.0,
        }
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("skew", self.skew_degrees);
        el.push(rect_element("page-box", self.page_box));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            skew_degrees: el.parse_attr("skew")?,
            page_box: rect_from_element(el.child("page-box")?)?,
        })
    }
}

/// Per-page content parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Params {
    content_box: Rect,
    mode: DetectionMode,
    dependencies: Dependencies,
}

impl Params {
    /// Parameters recording `content_box`.
    #[must_use]
    pub const fn new(content_box: Rect, mode: DetectionMode, dependencies: Dependencies) -> Self {
        Self {
            content_box,
            mode,
            dependencies,
        }
    }

    /// The stored content box.
    #[must_use]
    pub const fn content_box(&self) -> Rect {
        self.content_box
    }

    /// Whether the box was detected or drawn by the user.
    #[must_use]
    pub const fn mode(&self) -> DetectionMode {
        self.mode
    }

    /// The dependency snapshot this box was computed against.
    #[must_use]
    pub const fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("mode", self.mode.tag());
        el.push(rect_element("content-box", self.content_box));
        el.push(self.dependencies.to_element("dependencies"));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            mode: DetectionMode::from_tag(el.attr("mode")?)?,
            content_box: rect_from_element(el.child("content-box")?)?,
            dependencies: Dependencies::from_element(el.child("dependencies")?)?,
        })
    }
}

/// Settings store for the content stage.
pub type Settings = SettingsStore<PageId, Params>;

/// The content detection stage.
pub struct Stage {
    settings: Arc<Settings>,
    defaults: ContentDefaults,
}

impl Stage {
    /// Create the stage with an empty settings store.
    #[must_use]
    pub fn new(defaults: &DefaultBundles) -> Self {
        Self {
            settings: Arc::new(Settings::new()),
            defaults: defaults.content,
        }
    }

    /// Shared handle to this stage's settings store.
    #[must_use]
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Current parameters for a page.
    #[must_use]
    pub fn options_for(&self, page_id: &PageId) -> Option<Params> {
        self.settings.get(page_id)
    }

    /// Store default parameters unless parameters already exist.
    pub fn load_default_params(&self, info: &PageInfo) {
        self.settings.set_if_absent(
            info.id().clone(),
            Params::new(
                Rect::covering(info.source_size()),
                self.defaults.mode,
                Dependencies::placeholder(),
            ),
        );
    }

    /// Build this stage's processing unit.
    #[must_use]
    pub fn processing_unit(
        &self,
        page_id: PageId,
        next: Option<Arc<margins::ProcessUnit>>,
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
    pub fn validity_unit(&self, next: Option<Arc<margins::CheckUnit>>) -> Arc<CheckUnit> {
        Arc::new(CheckUnit {
            settings: self.settings(),
            next,
        })
    }

    /// Serialize stored parameters for every enumerated page.
    #[must_use]
    pub fn save_settings(&self, writer: &dyn PageEnumerator) -> Element {
        let mut root = Element::new(TAG);
        writer.for_each_page(&mut |page_id, numeric| {
            if let Some(params) = self.settings.get(page_id) {
                let mut page_el = Element::new("page");
                page_el.set_attr("id", numeric);
                page_el.push(params.to_element("params"));
                root.push(page_el);
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
        for page_el in stage_el.children_named("page") {
            let Some(numeric) = page_el.parse_attr::<i32>("id") else {
                continue;
            };
            let Some(page_id) = reader.page_id(numeric) else {
                continue;
            };
            let Some(params_el) = page_el.child("params") else {
                continue;
            };
            let Some(params) = Params::from_element(params_el) else {
                continue;
            };
            self.settings.set(page_id, params);
        }
    }

    /// Remap stored settings after source files moved.
    pub fn perform_relinking(&self, relinker: &dyn Relinker) {
        self.settings.remap(|page_id| {
            relinker
                .reassign(page_id.image_id())
                .map(|image| PageId::new(image, page_id.sub_page()))
        });
    }
}

/// Content node of a processing chain.
pub struct ProcessUnit {
    settings: Arc<Settings>,
    defaults: ContentDefaults,
    next: Option<Arc<margins::ProcessUnit>>,
    page_id: PageId,
    batch: bool,
    debug: bool,
}

impl ProcessUnit {
    /// Resolve the page's content box and forward. The image itself is
    /// not cropped here — downstream stages position their output
    /// relative to the box.
    pub fn execute(&self, token: &CancellationToken, mut payload: PagePayload) -> ChainOutcome {
        if token.is_cancelled() {
            return ChainOutcome::Cancelled;
        }

        let size = payload.image_size();
        let page_box = payload
            .geometry
            .page_box
            .unwrap_or_else(|| Rect::covering(size));
        let dependencies = Dependencies::new(page_box, payload.geometry.skew_degrees);
        let content_box = match self.settings.get(&self.page_id) {
            Some(params) if *params.dependencies() == dependencies => params.content_box(),
            Some(params) if params.mode() == DetectionMode::Manual => {
                let content_box = params.content_box();
                self.settings.set(
                    self.page_id.clone(),
                    Params::new(content_box, DetectionMode::Manual, dependencies),
                );
                content_box
            }
            _ => match detect_content_box(&payload.image) {
                Some(content_box) => {
                    self.settings.set(
                        self.page_id.clone(),
                        Params::new(content_box, DetectionMode::Auto, dependencies),
                    );
                    content_box
                }
                None => {
                    return ChainOutcome::Finished(ResultCommand::failure(
                        StageKind::Content,
                        self.batch,
                        self.page_id.clone(),
                        StageError::EmptyContent,
                    ));
                }
            },
        };

        if !content_box.fits_within(size) {
            return ChainOutcome::Finished(ResultCommand::failure(
                StageKind::Content,
                self.batch,
                self.page_id.clone(),
                StageError::BoxOutOfBounds {
                    what: "content box",
                    rect: content_box,
                    size,
                },
            ));
        }

        payload.geometry.content_box = Some(content_box);
        if self.debug {
            payload.record_trace(StageKind::Content);
        }

        match &self.next {
            Some(next) => next.execute(token, payload),
            None => {
                ChainOutcome::Finished(ResultCommand::page(StageKind::Content, self.batch, payload))
            }
        }
    }
}

/// Content node of a validity chain.
pub struct CheckUnit {
    settings: Arc<Settings>,
    next: Option<Arc<margins::CheckUnit>>,
}

impl CheckUnit {
    pub(crate) fn check(&self, info: &PageInfo, sketch: &mut PageGeometry) -> Validity {
        let rotated_size = info.source_size().rotated(sketch.rotation);
        let page_box = sketch
            .page_box
            .unwrap_or_else(|| Rect::covering(rotated_size));
        let dependencies = Dependencies::new(page_box, sketch.skew_degrees);
        match self.settings.get(info.id()) {
            None => Validity::Missing,
            Some(params) if *params.dependencies() != dependencies => Validity::Invalid,
            Some(params) => {
                sketch.content_box = Some(params.content_box());
                self.next
                    .as_ref()
                    .map_or(Validity::Valid, |next| next.check(info, sketch))
            }
        }
    }
}

/// Bounding box of all content pixels, or `None` for a blank page.
fn detect_content_box(image: &RgbaImage) -> Option<Rect> {
    let gray = imageops::grayscale(image);
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut found = false;
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] < INK_THRESHOLD {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    found.then(|| Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::geometry::Dimensions;
    use crate::ids::{ImageId, SubPage};
    use image::Rgba;

    fn page_info() -> PageInfo {
        let id = PageId::new(ImageId::new("page.png", 0), SubPage::Single);
        PageInfo::new(id, Dimensions::new(100, 100), 5)
    }

    fn page_with_block(block: Rect) -> RgbaImage {
        RgbaImage::from_fn(100, 100, |x, y| {
            let inside = x >= block.x
                && x < block.x + block.width
                && y >= block.y
                && y < block.y + block.height;
            if inside {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn detection_finds_the_ink_bounding_box() {
        let block = Rect::new(20, 30, 40, 25);
        assert_eq!(detect_content_box(&page_with_block(block)), Some(block));
    }

    #[test]
    fn blank_page_has_no_content_box() {
        let blank = RgbaImage::from_pixel(50, 50, Rgba([255, 255, 255, 255]));
        assert_eq!(detect_content_box(&blank), None);
    }

    #[test]
    fn blank_page_surfaces_as_stage_failure() {
        let stage = Stage::new(&DefaultBundles::default());
        let info = page_info();
        let unit = stage.processing_unit(info.id().clone(), None, false, false);
        let blank = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        let outcome = unit.execute(&CancellationToken::new(), PagePayload::new(info.clone(), blank));

        let command = outcome.command().unwrap();
        assert!(command.is_failure());
        // The failing stage writes nothing.
        assert!(stage.settings().get(info.id()).is_none());
    }

    #[test]
    fn detected_box_is_stored_with_dependencies() {
        let stage = Stage::new(&DefaultBundles::default());
        let info = page_info();
        let block = Rect::new(10, 10, 30, 30);
        let unit = stage.processing_unit(info.id().clone(), None, false, false);
        unit.execute(
            &CancellationToken::new(),
            PagePayload::new(info.clone(), page_with_block(block)),
        );

        let stored = stage.settings().get(info.id()).unwrap();
        assert_eq!(stored.content_box(), block);
        assert_eq!(
            *stored.dependencies(),
            Dependencies::new(Rect::new(0, 0, 100, 100), 0.0),
        );
    }

    #[test]
    fn manual_box_survives_upstream_changes() {
        let stage = Stage::new(&DefaultBundles::default());
        let info = page_info();
        let pinned = Rect::new(5, 5, 50, 50);
        stage.settings().set(
            info.id().clone(),
            Params::new(
                pinned,
                DetectionMode::Manual,
                Dependencies::new(Rect::new(0, 0, 90, 90), 1.0),
            ),
        );

        let unit = stage.processing_unit(info.id().clone(), None, false, false);
        unit.execute(
            &CancellationToken::new(),
            PagePayload::new(info.clone(), page_with_block(Rect::new(10, 10, 30, 30))),
        );

        let stored = stage.settings().get(info.id()).unwrap();
        assert_eq!(stored.content_box(), pinned);
        assert_eq!(stored.mode(), DetectionMode::Manual);
    }

    #[test]
    fn params_element_round_trip() {
        let params = Params::new(
            Rect::new(1, 2, 3, 4),
            DetectionMode::Auto,
            Dependencies::new(Rect::new(0, 0, 100, 100), -0.5),
        );
        let el = params.to_element("params");
        assert_eq!(Params::from_element(&el), Some(params));
    }
}
