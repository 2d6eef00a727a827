//! Deskew stage: remove residual skew from a split page.
//!
//! The first page-scoped stage. Auto mode estimates the skew angle by
//! maximizing the variance of sheared horizontal projection profiles —
//! text lines produce the sharpest profile when the shear exactly undoes
//! the skew. Manual mode keeps the user's angle across upstream changes
//! and only refreshes the dependency snapshot.

use std::sync::Arc;

use image::{GrayImage, Rgba, RgbaImage, imageops};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};

use crate::chain::{CancellationToken, ChainOutcome, PageGeometry, PagePayload, ResultCommand};
use crate::defaults::{DefaultBundles, DeskewDefaults};
use crate::geometry::{Rect, Rotation};
use crate::ids::{PageId, PageInfo, Relinker};
use crate::project::{Element, IdResolver, PageEnumerator, rect_element, rect_from_element,
    rotation_from_attr};
use crate::stages::{DetectionMode, StageKind, content};
use crate::store::SettingsStore;
use crate::validity::Validity;

const TAG: &str = "deskew";

/// Largest skew magnitude the estimator searches, in degrees.
const MAX_SKEW_DEGREES: f64 = 5.0;

/// Estimator search step, in degrees.
const SKEW_STEP_DEGREES: f64 = 0.25;

/// Upstream inputs the stored angle was computed against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dependencies {
    rotation: Rotation,
    page_box: Rect,
}

impl Dependencies {
    /// Dependencies for a page cut to `page_box` after `rotation`.
    #[must_use]
    pub const fn new(rotation: Rotation, page_box: Rect) -> Self {
        Self { rotation, page_box }
    }

    /// A snapshot that never matches a real page.
    #[must_use]
    pub(crate) const fn placeholder() -> Self {
        Self {
            rotation: Rotation::Deg0,
            page_box: Rect::new(0, 0, 0, 0),
        }
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("rotation", self.rotation.degrees());
        el.push(rect_element("page-box", self.page_box));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            rotation: rotation_from_attr(el, "rotation")?,
            page_box: rect_from_element(el.child("page-box")?)?,
        })
    }
}

/// Per-page deskew parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Params {
    angle_degrees: f64,
    mode: DetectionMode,
    dependencies: Dependencies,
}

impl Params {
    /// Parameters removing `angle_degrees` of skew.
    #[must_use]
    pub const fn new(angle_degrees: f64, mode: DetectionMode, dependencies: Dependencies) -> Self {
        Self {
            angle_degrees,
            mode,
            dependencies,
        }
    }

    /// The skew removed from the page, in degrees.
    #[must_use]
    pub const fn angle_degrees(&self) -> f64 {
        self.angle_degrees
    }

    /// Whether the angle was estimated or set by the user.
    #[must_use]
    pub const fn mode(&self) -> DetectionMode {
        self.mode
    }

    /// The dependency snapshot this angle was computed against.
    #[must_use]
    pub const fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("angle", self.angle_degrees);
        el.set_attr("mode", self.mode.tag());
        el.push(self.dependencies.to_element("dependencies"));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            angle_degrees: el.parse_attr("angle")?,
            mode: DetectionMode::from_tag(el.attr("mode")?)?,
            dependencies: Dependencies::from_element(el.child("dependencies")?)?,
        })
    }
}

/// Settings store for the deskew stage.
pub type Settings = SettingsStore<PageId, Params>;

/// The deskew stage.
pub struct Stage {
    settings: Arc<Settings>,
    defaults: DeskewDefaults,
}

impl Stage {
    /// Create the stage with an empty settings store.
    #[must_use]
    pub fn new(defaults: &DefaultBundles) -> Self {
        Self {
            settings: Arc::new(Settings::new()),
            defaults: defaults.deskew,
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

    /// Store default parameters unless parameters already exist. The
    /// placeholder dependency snapshot guarantees the angle is estimated
    /// on first processing.
    pub fn load_default_params(&self, info: &PageInfo) {
        self.settings.set_if_absent(
            info.id().clone(),
            Params::new(0.0, self.defaults.mode, Dependencies::placeholder()),
        );
    }

    /// Build this stage's processing unit.
    #[must_use]
    pub fn processing_unit(
        &self,
        page_id: PageId,
        next: Option<Arc<content::ProcessUnit>>,
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
    pub fn validity_unit(&self, next: Option<Arc<content::CheckUnit>>) -> Arc<CheckUnit> {
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

/// Deskew node of a processing chain.
pub struct ProcessUnit {
    settings: Arc<Settings>,
    defaults: DeskewDefaults,
    next: Option<Arc<content::ProcessUnit>>,
    page_id: PageId,
    batch: bool,
    debug: bool,
}

impl ProcessUnit {
    /// Resolve the page's skew angle, rotate it out, and forward.
    pub fn execute(&self, token: &CancellationToken, mut payload: PagePayload) -> ChainOutcome {
        if token.is_cancelled() {
            return ChainOutcome::Cancelled;
        }

        let page_box = payload
            .geometry
            .page_box
            .unwrap_or_else(|| Rect::covering(payload.image_size()));
        let dependencies = Dependencies::new(payload.geometry.rotation, page_box);
        let angle = match self.settings.get(&self.page_id) {
            Some(params) if *params.dependencies() == dependencies => params.angle_degrees(),
            Some(params) if params.mode() == DetectionMode::Manual => {
                // The user pinned this angle; upstream changes only
                // refresh the snapshot.
                let angle = params.angle_degrees();
                self.settings.set(
                    self.page_id.clone(),
                    Params::new(angle, DetectionMode::Manual, dependencies),
                );
                angle
            }
            stored => {
                let mode = stored.map_or(self.defaults.mode, |p| p.mode());
                let angle = match mode {
                    DetectionMode::Auto => estimate_skew_degrees(&payload.image),
                    DetectionMode::Manual => 0.0,
                };
                self.settings
                    .set(self.page_id.clone(), Params::new(angle, mode, dependencies));
                angle
            }
        };

        if angle != 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            let theta = (-angle.to_radians()) as f32;
            payload.image = rotate_about_center(
                &payload.image,
                theta,
                Interpolation::Bilinear,
                Rgba([255, 255, 255, 255]),
            );
        }
        payload.geometry.skew_degrees = angle;
        if self.debug {
            payload.record_trace(StageKind::Deskew);
        }

        match &self.next {
            Some(next) => next.execute(token, payload),
            None => {
                ChainOutcome::Finished(ResultCommand::page(StageKind::Deskew, self.batch, payload))
            }
        }
    }
}

/// Deskew node of a validity chain.
pub struct CheckUnit {
    settings: Arc<Settings>,
    next: Option<Arc<content::CheckUnit>>,
}

impl CheckUnit {
    pub(crate) fn check(&self, info: &PageInfo, sketch: &mut PageGeometry) -> Validity {
        let rotated_size = info.source_size().rotated(sketch.rotation);
        let page_box = sketch.page_box.unwrap_or_else(|| Rect::covering(rotated_size));
        let dependencies = Dependencies::new(sketch.rotation, page_box);
        match self.settings.get(info.id()) {
            None => Validity::Missing,
            Some(params) if *params.dependencies() != dependencies => Validity::Invalid,
            Some(params) => {
                sketch.skew_degrees = params.angle_degrees();
                self.next
                    .as_ref()
                    .map_or(Validity::Valid, |next| next.check(info, sketch))
            }
        }
    }
}

/// Estimate a page's skew in degrees.
///
/// Shears the ink image by candidate angles and scores each by the
/// variance of its horizontal projection profile; straight text lines
/// give the spikiest profile. Candidates are visited nearest-zero first,
/// so featureless pages report 0.
fn estimate_skew_degrees(image: &RgbaImage) -> f64 {
    let gray = working_copy(image);
    let mut best_angle = 0.0;
    let mut best_score = shear_score(&gray, 0.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let steps = (MAX_SKEW_DEGREES / SKEW_STEP_DEGREES) as u32;
    for step in 1..=steps {
        let magnitude = f64::from(step) * SKEW_STEP_DEGREES;
        for angle in [magnitude, -magnitude] {
            let score = shear_score(&gray, angle);
            if score > best_score {
                best_score = score;
                best_angle = angle;
            }
        }
    }
    best_angle
}

/// Grayscale the page and cap its width so estimation cost stays flat
/// regardless of scan resolution.
fn working_copy(image: &RgbaImage) -> GrayImage {
    const MAX_WIDTH: u32 = 512;
    let gray = imageops::grayscale(image);
    if gray.width() <= MAX_WIDTH {
        return gray;
    }
    let scale = f64::from(MAX_WIDTH) / f64::from(gray.width());
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let height = ((f64::from(gray.height()) * scale).round() as u32).max(1);
    imageops::thumbnail(&gray, MAX_WIDTH, height)
}

/// Variance of the horizontal projection profile after shearing rows by
/// `angle_degrees`.
#[allow(clippy::cast_precision_loss)]
fn shear_score(gray: &GrayImage, angle_degrees: f64) -> f64 {
    let width = gray.width();
    let height = gray.height();
    if width == 0 || height == 0 {
        return 0.0;
    }
    let tan = angle_degrees.to_radians().tan();
    let mut rows = vec![0.0_f64; height as usize];
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] == 255 {
            continue;
        }
        let ink = f64::from(255 - pixel.0[0]);
        #[allow(clippy::cast_possible_truncation)]
        let shifted = (f64::from(y) - f64::from(x) * tan).round() as i64;
        if let Ok(row) = usize::try_from(shifted) {
            if let Some(sum) = rows.get_mut(row) {
                *sum += ink;
            }
        }
    }
    let mean = rows.iter().sum::<f64>() / rows.len() as f64;
    rows.iter().map(|sum| (sum - mean).powi(2)).sum::<f64>() / rows.len() as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::geometry::Dimensions;
    use crate::ids::{ImageId, SubPage};

    fn page_info() -> PageInfo {
        let id = PageId::new(ImageId::new("page.png", 0), SubPage::Single);
        PageInfo::new(id, Dimensions::new(120, 80), 3)
    }

    /// A white page with dark horizontal text lines, optionally skewed.
    fn lined_page(skew_degrees: f64) -> RgbaImage {
        let tan = skew_degrees.to_radians().tan();
        RgbaImage::from_fn(120, 80, |x, y| {
            #[allow(clippy::cast_possible_truncation)]
            let base = (f64::from(y) - f64::from(x) * tan).round() as i64;
            if base.rem_euclid(10) < 2 {
                image::Rgba([0, 0, 0, 255])
            } else {
                image::Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn straight_lines_estimate_zero() {
        let angle = estimate_skew_degrees(&lined_page(0.0));
        assert!(angle.abs() < f64::EPSILON, "estimated {angle}");
    }

    #[test]
    fn skewed_lines_estimate_near_the_true_angle() {
        let angle = estimate_skew_degrees(&lined_page(2.0));
        assert!((angle - 2.0).abs() <= 0.5, "estimated {angle}");
    }

    #[test]
    fn dependency_snapshot_is_field_sensitive() {
        let box_a = Rect::new(0, 0, 120, 80);
        let deps = Dependencies::new(Rotation::Deg0, box_a);
        assert_eq!(deps, Dependencies::new(Rotation::Deg0, box_a));
        assert_ne!(deps, Dependencies::new(Rotation::Deg90, box_a));
        assert_ne!(
            deps,
            Dependencies::new(Rotation::Deg0, Rect::new(0, 0, 120, 81)),
        );
    }

    #[test]
    fn first_run_estimates_and_stores_params() {
        let stage = Stage::new(&DefaultBundles::default());
        let info = page_info();
        let unit = stage.processing_unit(info.id().clone(), None, false, false);
        unit.execute(
            &CancellationToken::new(),
            PagePayload::new(info.clone(), lined_page(0.0)),
        );

        let stored = stage.settings().get(info.id()).unwrap();
        assert_eq!(stored.mode(), DetectionMode::Auto);
        assert!(stored.angle_degrees().abs() < f64::EPSILON);
    }

    #[test]
    fn manual_angle_survives_upstream_changes() {
        let stage = Stage::new(&DefaultBundles::default());
        let info = page_info();
        let stale = Dependencies::new(Rotation::Deg90, Rect::new(0, 0, 80, 120));
        stage.settings().set(
            info.id().clone(),
            Params::new(1.5, DetectionMode::Manual, stale),
        );

        let unit = stage.processing_unit(info.id().clone(), None, false, false);
        unit.execute(
            &CancellationToken::new(),
            PagePayload::new(info.clone(), lined_page(0.0)),
        );

        let stored = stage.settings().get(info.id()).unwrap();
        assert!((stored.angle_degrees() - 1.5).abs() < f64::EPSILON);
        assert_eq!(stored.mode(), DetectionMode::Manual);
        assert_eq!(
            *stored.dependencies(),
            Dependencies::new(Rotation::Deg0, Rect::new(0, 0, 120, 80)),
        );
    }

    #[test]
    fn auto_angle_is_reestimated_on_dependency_change() {
        let stage = Stage::new(&DefaultBundles::default());
        let info = page_info();
        let stale = Dependencies::new(Rotation::Deg90, Rect::new(0, 0, 80, 120));
        stage.settings().set(
            info.id().clone(),
            Params::new(4.0, DetectionMode::Auto, stale),
        );

        let unit = stage.processing_unit(info.id().clone(), None, false, false);
        unit.execute(
            &CancellationToken::new(),
            PagePayload::new(info.clone(), lined_page(0.0)),
        );

        let stored = stage.settings().get(info.id()).unwrap();
        assert!(stored.angle_degrees().abs() < f64::EPSILON);
    }

    #[test]
    fn params_element_round_trip() {
        let params = Params::new(
            -1.75,
            DetectionMode::Manual,
            Dependencies::new(Rotation::Deg180, Rect::new(4, 5, 60, 70)),
        );
        let el = params.to_element("params");
        assert_eq!(Params::from_element(&el), Some(params));
    }
}
