//! Orientation stage: quarter-turn rotation of whole scans.
//!
//! The first stage of the pipeline. Rotation is a per-scan decision, so
//! settings are keyed by [`ImageId`] — both pages of a two-page scan share
//! one entry. There is nothing to detect: the stored (or default) rotation
//! is applied as-is, and the dependency snapshot only tracks the source
//! frame itself, so replacing a file on disk invalidates everything
//! downstream.

use std::sync::Arc;

use image::imageops;

use crate::chain::{CancellationToken, ChainOutcome, PageGeometry, PagePayload, ResultCommand};
use crate::defaults::{DefaultBundles, OrientationDefaults};
use crate::geometry::{Dimensions, Rotation};
use crate::ids::{ImageId, PageId, PageInfo, Relinker};
use crate::project::{Element, IdResolver, PageEnumerator, rotation_from_attr};
use crate::stages::{StageKind, split};
use crate::store::SettingsStore;
use crate::validity::Validity;

const TAG: &str = "orientation";

/// Upstream inputs the stored rotation was applied against: the source
/// frame's size and content fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependencies {
    source_size: Dimensions,
    source_fingerprint: u64,
}

impl Dependencies {
    /// Dependencies for a page's current source frame.
    #[must_use]
    pub const fn for_page(info: &PageInfo) -> Self {
        Self {
            source_size: info.source_size(),
            source_fingerprint: info.source_fingerprint(),
        }
    }

    /// A snapshot that never matches a real source frame. Used for
    /// default parameters, which must be recomputed on first processing.
    #[must_use]
    pub(crate) const fn placeholder() -> Self {
        Self {
            source_size: Dimensions::new(0, 0),
            source_fingerprint: 0,
        }
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("width", self.source_size.width);
        el.set_attr("height", self.source_size.height);
        el.set_attr("fingerprint", self.source_fingerprint);
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            source_size: Dimensions::new(el.parse_attr("width")?, el.parse_attr("height")?),
            source_fingerprint: el.parse_attr("fingerprint")?,
        })
    }
}

/// Per-scan orientation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    rotation: Rotation,
    dependencies: Dependencies,
}

impl Params {
    /// Parameters applying `rotation` against the given dependencies.
    #[must_use]
    pub const fn new(rotation: Rotation, dependencies: Dependencies) -> Self {
        Self {
            rotation,
            dependencies,
        }
    }

    /// The stored quarter-turn.
    #[must_use]
    pub const fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// The dependency snapshot this rotation was stored against.
    #[must_use]
    pub const fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.set_attr("rotation", self.rotation.degrees());
        el.push(self.dependencies.to_element("dependencies"));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            rotation: rotation_from_attr(el, "rotation")?,
            dependencies: Dependencies::from_element(el.child("dependencies")?)?,
        })
    }
}

/// Settings store for the orientation stage, keyed per scan.
pub type Settings = SettingsStore<ImageId, Params>;

/// The orientation stage: settings plus chain-unit factories.
pub struct Stage {
    settings: Arc<Settings>,
    defaults: OrientationDefaults,
}

impl Stage {
    /// Create the stage with an empty settings store.
    #[must_use]
    pub fn new(defaults: &DefaultBundles) -> Self {
        Self {
            settings: Arc::new(Settings::new()),
            defaults: defaults.orientation,
        }
    }

    /// Shared handle to this stage's settings store.
    #[must_use]
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Current parameters for a page's scan, for pre-populating a stage
    /// options panel.
    #[must_use]
    pub fn options_for(&self, page_id: &PageId) -> Option<Params> {
        self.settings.get(page_id.image_id())
    }

    /// Store default parameters for this page's scan unless parameters
    /// already exist.
    pub fn load_default_params(&self, info: &PageInfo) {
        self.settings.set_if_absent(
            info.id().image_id().clone(),
            Params::new(self.defaults.rotation, Dependencies::placeholder()),
        );
    }

    /// Build this stage's processing unit, capturing the current settings
    /// store and per-request flags.
    #[must_use]
    pub fn processing_unit(
        &self,
        page_id: PageId,
        next: Option<Arc<split::ProcessUnit>>,
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
    pub fn validity_unit(&self, next: Option<Arc<split::CheckUnit>>) -> Arc<CheckUnit> {
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

    /// Load stored parameters, skipping entries that are malformed or
    /// refer to images the reader cannot resolve.
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

/// Orientation node of a processing chain.
pub struct ProcessUnit {
    settings: Arc<Settings>,
    defaults: OrientationDefaults,
    next: Option<Arc<split::ProcessUnit>>,
    page_id: PageId,
    batch: bool,
    debug: bool,
}

impl ProcessUnit {
    /// Apply (or establish) this scan's rotation and forward the payload.
    pub fn execute(&self, token: &CancellationToken, mut payload: PagePayload) -> ChainOutcome {
        if token.is_cancelled() {
            return ChainOutcome::Cancelled;
        }

        let dependencies = Dependencies::for_page(&payload.info);
        let key = self.page_id.image_id().clone();
        let rotation = match self.settings.get(&key) {
            Some(params) if *params.dependencies() == dependencies => params.rotation(),
            stored => {
                // New or replaced scan. An explicit rotation survives the
                // source change; only the snapshot is refreshed.
                let rotation = stored.map_or(self.defaults.rotation, |p| p.rotation());
                self.settings.set(key, Params::new(rotation, dependencies));
                rotation
            }
        };

        payload.image = match rotation {
            Rotation::Deg0 => payload.image,
            Rotation::Deg90 => imageops::rotate90(&payload.image),
            Rotation::Deg180 => imageops::rotate180(&payload.image),
            Rotation::Deg270 => imageops::rotate270(&payload.image),
        };
        payload.geometry.rotation = rotation;
        if self.debug {
            payload.record_trace(StageKind::Orientation);
        }

        match &self.next {
            Some(next) => next.execute(token, payload),
            None => ChainOutcome::Finished(ResultCommand::page(
                StageKind::Orientation,
                self.batch,
                payload,
            )),
        }
    }
}

/// Orientation node of a validity chain.
pub struct CheckUnit {
    settings: Arc<Settings>,
    next: Option<Arc<split::CheckUnit>>,
}

impl CheckUnit {
    /// Run the validity chain for one page.
    #[must_use]
    pub fn check_validity(&self, info: &PageInfo) -> Validity {
        let mut sketch = PageGeometry::default();
        self.check(info, &mut sketch)
    }

    pub(crate) fn check(&self, info: &PageInfo, sketch: &mut PageGeometry) -> Validity {
        let dependencies = Dependencies::for_page(info);
        match self.settings.get(info.id().image_id()) {
            None => Validity::Missing,
            Some(params) if *params.dependencies() != dependencies => Validity::Invalid,
            Some(params) => {
                sketch.rotation = params.rotation();
                self.next
                    .as_ref()
                    .map_or(Validity::Valid, |next| next.check(info, sketch))
            }
        }
    }
}
