//! Output stage: render the final page.
//!
//! The terminal stage of every full chain. It crops the page to its frame
//! box and renders it in the configured color mode. Rendering options are
//! user configuration like margins: upstream changes refresh the
//! dependency snapshot but never reset the user's mode or threshold.

use std::sync::Arc;

use image::{Luma, Rgba, RgbaImage, imageops};

use crate::chain::{
    CancellationToken, ChainOutcome, PageGeometry, PagePayload, ResultCommand, StageError,
};
use crate::defaults::{DefaultBundles, OutputDefaults};
use crate::geometry::Rect;
use crate::ids::{PageId, PageInfo, Relinker};
use crate::project::{Element, IdResolver, PageEnumerator, rect_element, rect_from_element};
use crate::stages::StageKind;
use crate::store::SettingsStore;
use crate::validity::Validity;

const TAG: &str = "output";

/// How the final page is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    /// Keep the source colors.
    Color,
    /// Render as 8-bit grayscale.
    Grayscale,
    /// Binarize at the configured threshold.
    BlackAndWhite,
}

impl ColorMode {
    /// Stable tag used in the project document.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Grayscale => "grayscale",
            Self::BlackAndWhite => "black-and-white",
        }
    }

    /// Inverse of [`tag`](Self::tag).
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "color" => Some(Self::Color),
            "grayscale" => Some(Self::Grayscale),
            "black-and-white" => Some(Self::BlackAndWhite),
            _ => None,
        }
    }
}

/// Upstream inputs the rendered output depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependencies {
    frame_box: Rect,
    content_box: Rect,
}

impl Dependencies {
    /// Dependencies for a page framed at `frame_box` around
    /// `content_box`.
    #[must_use]
    pub const fn new(frame_box: Rect, content_box: Rect) -> Self {
        Self {
            frame_box,
            content_box,
        }
    }

    /// A snapshot that never matches a real page.
    #[must_use]
    pub(crate) const fn placeholder() -> Self {
        Self {
            frame_box: Rect::new(0, 0, 0, 0),
            content_box: Rect::new(0, 0, 0, 0),
        }
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.push(rect_element("frame-box", self.frame_box));
        el.push(rect_element("content-box", self.content_box));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            frame_box: rect_from_element(el.child("frame-box")?)?,
            content_box: rect_from_element(el.child("content-box")?)?,
        })
    }
}

/// Per-page output parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    color_mode: ColorMode,
    threshold: u8,
    dependencies: Dependencies,
}

impl Params {
    /// Parameters rendering with `color_mode`.
    #[must_use]
    pub const fn new(color_mode: ColorMode, threshold: u8, dependencies: Dependencies) -> Self {
        Self {
            color_mode,
            threshold,
            dependencies,
        }
    }

    /// The stored color mode.
    #[must_use]
    pub const fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    /// The stored binarization threshold.
    #[must_use]
    pub const fn threshold(&self) -> u8 {
        self.threshold
    }

    /// The dependency snapshot this rendering was produced against.
    #[must_use]
    pub const fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("color-mode", self.color_mode.tag());
        el.set_attr("threshold", self.threshold);
        el.push(self.dependencies.to_element("dependencies"));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            color_mode: ColorMode::from_tag(el.attr("color-mode")?)?,
            threshold: el.parse_attr("threshold")?,
            dependencies: Dependencies::from_element(el.child("dependencies")?)?,
        })
    }
}

/// Settings store for the output stage.
pub type Settings = SettingsStore<PageId, Params>;

/// The output stage.
pub struct Stage {
    settings: Arc<Settings>,
    defaults: OutputDefaults,
}

impl Stage {
    /// Create the stage with an empty settings store.
    #[must_use]
    pub fn new(defaults: &DefaultBundles) -> Self {
        Self {
            settings: Arc::new(Settings::new()),
            defaults: defaults.output,
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
                self.defaults.color_mode,
                self.defaults.threshold,
                Dependencies::placeholder(),
            ),
        );
    }

    /// Build this stage's processing unit. Output is always the tail of
    /// its chain.
    #[must_use]
    pub fn processing_unit(&self, page_id: PageId, batch: bool, debug: bool) -> Arc<ProcessUnit> {
        Arc::new(ProcessUnit {
            settings: self.settings(),
            defaults: self.defaults,
            page_id,
            batch,
            debug,
        })
    }

    /// Build this stage's validity-check unit.
    #[must_use]
    pub fn validity_unit(&self) -> Arc<CheckUnit> {
        Arc::new(CheckUnit {
            settings: self.settings(),
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

/// Output node of a processing chain — always the tail.
pub struct ProcessUnit {
    settings: Arc<Settings>,
    defaults: OutputDefaults,
    page_id: PageId,
    batch: bool,
    debug: bool,
}

impl ProcessUnit {
    /// Render the final page and construct the chain's result command.
    pub fn execute(&self, token: &CancellationToken, mut payload: PagePayload) -> ChainOutcome {
        if token.is_cancelled() {
            return ChainOutcome::Cancelled;
        }

        let size = payload.image_size();
        let frame_box = payload
            .geometry
            .frame_box
            .unwrap_or_else(|| Rect::covering(size));
        let content_box = payload
            .geometry
            .content_box
            .unwrap_or_else(|| Rect::covering(size));
        let dependencies = Dependencies::new(frame_box, content_box);
        let params = match self.settings.get(&self.page_id) {
            Some(params) if *params.dependencies() == dependencies => params,
            Some(params) => {
                let updated =
                    Params::new(params.color_mode(), params.threshold(), dependencies);
                self.settings.set(self.page_id.clone(), updated);
                updated
            }
            None => {
                let params = Params::new(
                    self.defaults.color_mode,
                    self.defaults.threshold,
                    dependencies,
                );
                self.settings.set(self.page_id.clone(), params);
                params
            }
        };

        if frame_box.is_empty() || !frame_box.fits_within(size) {
            return ChainOutcome::Finished(ResultCommand::failure(
                StageKind::Output,
                self.batch,
                self.page_id.clone(),
                StageError::BoxOutOfBounds {
                    what: "frame box",
                    rect: frame_box,
                    size,
                },
            ));
        }

        payload.image = render(&payload.image, frame_box, params.color_mode(), params.threshold());
        if self.debug {
            payload.record_trace(StageKind::Output);
        }

        ChainOutcome::Finished(ResultCommand::page(StageKind::Output, self.batch, payload))
    }
}

/// Output node of a validity chain — always the tail.
pub struct CheckUnit {
    settings: Arc<Settings>,
}

impl CheckUnit {
    pub(crate) fn check(&self, info: &PageInfo, sketch: &mut PageGeometry) -> Validity {
        let rotated_size = info.source_size().rotated(sketch.rotation);
        let page_size = sketch
            .page_box
            .map_or(rotated_size, |page_box| page_box.size());
        let content_box = sketch
            .content_box
            .unwrap_or_else(|| Rect::covering(page_size));
        let frame_box = sketch
            .frame_box
            .unwrap_or_else(|| Rect::covering(page_size));
        let dependencies = Dependencies::new(frame_box, content_box);
        match self.settings.get(info.id()) {
            None => Validity::Missing,
            Some(params) if *params.dependencies() != dependencies => Validity::Invalid,
            Some(_) => Validity::Valid,
        }
    }
}

/// Crop to the frame box and apply the color mode.
fn render(image: &RgbaImage, frame_box: Rect, mode: ColorMode, threshold: u8) -> RgbaImage {
    let cropped = imageops::crop_imm(
        image,
        frame_box.x,
        frame_box.y,
        frame_box.width,
        frame_box.height,
    )
    .to_image();
    match mode {
        ColorMode::Color => cropped,
        ColorMode::Grayscale => {
            let gray = imageops::grayscale(&cropped);
            expand_gray(&gray)
        }
        ColorMode::BlackAndWhite => {
            let gray = imageops::grayscale(&cropped);
            let mut out = RgbaImage::new(gray.width(), gray.height());
            for (x, y, Luma([luma])) in gray.enumerate_pixels() {
                let value = if *luma < threshold { 0 } else { 255 };
                out.put_pixel(x, y, Rgba([value, value, value, 255]));
            }
            out
        }
    }
}

/// Widen a grayscale image back to RGBA for a uniform payload type.
fn expand_gray(gray: &image::GrayImage) -> RgbaImage {
    let mut out = RgbaImage::new(gray.width(), gray.height());
    for (x, y, Luma([luma])) in gray.enumerate_pixels() {
        out.put_pixel(x, y, Rgba([*luma, *luma, *luma, 255]));
    }
    out
}
