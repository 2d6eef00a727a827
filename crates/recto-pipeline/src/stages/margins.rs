//! Margins stage: frame the content box with whitespace.
//!
//! The frame box is the content box grown by the configured margins,
//! clamped to the page. Margins and alignment are user configuration, so
//! an upstream change never discards them — only the dependency snapshot
//! is refreshed. Alignment takes effect when pages are normalized to a
//! common size, a cross-page operation outside per-page chains; it is
//! persisted and exposed here so that operation and the UI can read it.

use std::sync::Arc;

use crate::chain::{CancellationToken, ChainOutcome, PageGeometry, PagePayload, ResultCommand};
use crate::defaults::{DefaultBundles, MarginsDefaults};
use crate::geometry::{Alignment, Margins, Rect};
use crate::ids::{PageId, PageInfo, Relinker};
use crate::project::{
    Element, IdResolver, PageEnumerator, alignment_element, alignment_from_element,
    margins_element, margins_from_element, rect_element, rect_from_element,
};
use crate::stages::{StageKind, output};
use crate::store::SettingsStore;
use crate::validity::Validity;

const TAG: &str = "margins";

/// Upstream inputs the stored frame depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependencies {
    content_box: Rect,
}

impl Dependencies {
    /// Dependencies for a page whose content box is `content_box`.
    #[must_use]
    pub const fn new(content_box: Rect) -> Self {
        Self { content_box }
    }

    /// A snapshot that never matches a real page.
    #[must_use]
    pub(crate) const fn placeholder() -> Self {
        Self {
            content_box: Rect::new(0, 0, 0, 0),
        }
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.push(rect_element("content-box", self.content_box));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            content_box: rect_from_element(el.child("content-box")?)?,
        })
    }
}

/// Per-page margins parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    margins: Margins,
    alignment: Alignment,
    dependencies: Dependencies,
}

impl Params {
    /// Parameters framing the content with `margins`.
    #[must_use]
    pub const fn new(margins: Margins, alignment: Alignment, dependencies: Dependencies) -> Self {
        Self {
            margins,
            alignment,
            dependencies,
        }
    }

    /// The stored margins.
    #[must_use]
    pub const fn margins(&self) -> Margins {
        self.margins
    }

    /// The stored alignment.
    #[must_use]
    pub const fn alignment(&self) -> Alignment {
        self.alignment
    }

    /// The dependency snapshot these margins were applied against.
    #[must_use]
    pub const fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    fn to_element(self, name: &str) -> Element {
        let mut el = Element::new(name);
        el.push(margins_element("margins", self.margins));
        el.push(alignment_element("alignment", self.alignment));
        el.push(self.dependencies.to_element("dependencies"));
        el
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            margins: margins_from_element(el.child("margins")?)?,
            alignment: alignment_from_element(el.child("alignment")?)?,
            dependencies: Dependencies::from_element(el.child("dependencies")?)?,
        })
    }
}

/// Settings store for the margins stage.
pub type Settings = SettingsStore<PageId, Params>;

/// The margins stage.
pub struct Stage {
    settings: Arc<Settings>,
    defaults: MarginsDefaults,
}

impl Stage {
    /// Create the stage with an empty settings store.
    #[must_use]
    pub fn new(defaults: &DefaultBundles) -> Self {
        Self {
            settings: Arc::new(Settings::new()),
            defaults: defaults.margins,
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
                self.defaults.margins,
                self.defaults.alignment,
                Dependencies::placeholder(),
            ),
        );
    }

    /// Build this stage's processing unit.
    #[must_use]
    pub fn processing_unit(
        &self,
        page_id: PageId,
        next: Option<Arc<output::ProcessUnit>>,
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
    pub fn validity_unit(&self, next: Option<Arc<output::CheckUnit>>) -> Arc<CheckUnit> {
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

/// Margins node of a processing chain.
pub struct ProcessUnit {
    settings: Arc<Settings>,
    defaults: MarginsDefaults,
    next: Option<Arc<output::ProcessUnit>>,
    page_id: PageId,
    batch: bool,
    debug: bool,
}

impl ProcessUnit {
    /// Resolve the page's margins, derive the frame box, and forward.
    pub fn execute(&self, token: &CancellationToken, mut payload: PagePayload) -> ChainOutcome {
        if token.is_cancelled() {
            return ChainOutcome::Cancelled;
        }

        let size = payload.image_size();
        let content_box = payload
            .geometry
            .content_box
            .unwrap_or_else(|| Rect::covering(size));
        let dependencies = Dependencies::new(content_box);
        let margins = match self.settings.get(&self.page_id) {
            Some(params) if *params.dependencies() == dependencies => params.margins(),
            Some(params) => {
                // Margins are user configuration; upstream changes only
                // refresh the snapshot.
                let updated = Params::new(params.margins(), params.alignment(), dependencies);
                self.settings.set(self.page_id.clone(), updated);
                updated.margins()
            }
            None => {
                let params = Params::new(
                    self.defaults.margins,
                    self.defaults.alignment,
                    dependencies,
                );
                self.settings.set(self.page_id.clone(), params);
                params.margins()
            }
        };

        payload.geometry.frame_box = Some(content_box.expanded(margins, size));
        if self.debug {
            payload.record_trace(StageKind::Margins);
        }

        match &self.next {
            Some(next) => next.execute(token, payload),
            None => {
                ChainOutcome::Finished(ResultCommand::page(StageKind::Margins, self.batch, payload))
            }
        }
    }
}

/// Margins node of a validity chain.
pub struct CheckUnit {
    settings: Arc<Settings>,
    next: Option<Arc<output::CheckUnit>>,
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
        let dependencies = Dependencies::new(content_box);
        match self.settings.get(info.id()) {
            None => Validity::Missing,
            Some(params) if *params.dependencies() != dependencies => Validity::Invalid,
            Some(params) => {
                sketch.frame_box = Some(content_box.expanded(params.margins(), page_size));
                self.next
                    .as_ref()
                    .map_or(Validity::Valid, |next| next.check(info, sketch))
            }
        }
    }
}
