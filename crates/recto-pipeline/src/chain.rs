//! Shared plumbing for processing chains.
//!
//! A processing chain is one linked list of per-stage units, built once per
//! request and executed start to finish on a single worker. Units hand a
//! [`PagePayload`] down the chain and a [`ChainOutcome`] back up; the tail
//! unit turns its payload into a [`ResultCommand`], which intermediate
//! units return unchanged.
//!
//! Cancellation is cooperative: each unit checks the
//! [`CancellationToken`] once, at entry, before touching its settings
//! store. A stage body that has already started runs to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Re-export `RgbaImage` so downstream crates can reference chain
/// payloads without depending on `image` directly.
pub use image::RgbaImage;

use crate::geometry::{Dimensions, Rect, Rotation};
use crate::ids::{PageId, PageInfo};
use crate::stages::StageKind;

/// Cooperative cancellation flag shared between the interactive context
/// and a set of in-flight chains.
///
/// Cloning produces another handle to the same flag. Once cancelled, a
/// token stays cancelled; a new processing round gets a fresh token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every chain holding this token to stop at its next stage
    /// boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Geometry accumulated as a payload moves down the chain.
///
/// Each stage fills in its own field; downstream stages read the fields of
/// everything upstream. The same struct doubles as the settings-only
/// sketch threaded through validity chains, where it is reconstructed from
/// stored parameters instead of computed from pixels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageGeometry {
    /// Quarter-turn applied by the orientation stage.
    pub rotation: Rotation,
    /// This page's box within the rotated scan, set by the split stage.
    pub page_box: Option<Rect>,
    /// Skew removed by the deskew stage, in degrees.
    pub skew_degrees: f64,
    /// Printable area within the deskewed page, set by content detection.
    pub content_box: Option<Rect>,
    /// Content box plus margins, set by the margins stage.
    pub frame_box: Option<Rect>,
}

/// The image and metadata one unit hands to the next.
#[derive(Debug, Clone)]
pub struct PagePayload {
    /// The page being processed.
    pub info: PageInfo,
    /// Current working image, transformed by every stage so far.
    pub image: RgbaImage,
    /// Geometry accumulated so far.
    pub geometry: PageGeometry,
    /// Per-stage snapshots, collected only when the chain was built with
    /// the debug flag.
    pub trace: Vec<(StageKind, RgbaImage)>,
}

impl PagePayload {
    /// The initial payload for a freshly loaded source image.
    #[must_use]
    pub fn new(info: PageInfo, image: RgbaImage) -> Self {
        Self {
            info,
            image,
            geometry: PageGeometry::default(),
            trace: Vec::new(),
        }
    }

    /// Size of the current working image.
    #[must_use]
    pub fn image_size(&self) -> Dimensions {
        Dimensions::new(self.image.width(), self.image.height())
    }

    /// Record a snapshot of the current image for the debug trace.
    pub fn record_trace(&mut self, stage: StageKind) {
        self.trace.push((stage, self.image.clone()));
    }
}

/// A stage body's typed failure: the payload cannot be processed.
///
/// Failures abort the rest of the chain and surface as an
/// error-presentation [`ResultCommand`]; they are never silently
/// swallowed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The source image could not be read or decoded.
    #[error("failed to load source image {}: {source}", .path.display())]
    SourceLoad {
        /// Path of the unreadable file.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: image::ImageError,
    },

    /// A stored or computed box does not fit the image it applies to.
    #[error("{what} {rect:?} lies outside the {size:?} image")]
    BoxOutOfBounds {
        /// Which box misbehaved ("page box", "frame box", ...).
        what: &'static str,
        /// The offending rectangle.
        rect: Rect,
        /// The image it had to fit in.
        size: Dimensions,
    },

    /// Content detection found no printable area at all.
    #[error("no content found on the page")]
    EmptyContent,

    /// A worker panicked while running the chain; the panic was contained
    /// at the job boundary.
    #[error("processing aborted: {0}")]
    Aborted(String),
}

/// Sink for deferred presentation updates, implemented by the interactive
/// layer. The core only pushes; it never polls the UI.
pub trait PresentationHost {
    /// Display a processed page image.
    fn show_page(&mut self, page_id: &PageId, origin: StageKind, image: &RgbaImage);

    /// Display a processing failure for a page.
    fn show_failure(&mut self, page_id: &PageId, origin: StageKind, error: &StageError);
}

/// What a finished chain has to show for a page.
#[derive(Debug)]
pub enum Presentation {
    /// The page processed successfully up to the chain's last stage.
    Page {
        /// Output image of the last stage that ran.
        image: RgbaImage,
        /// Geometry accumulated across the chain.
        geometry: PageGeometry,
        /// Debug snapshots, empty unless the chain was built with the
        /// debug flag.
        trace: Vec<(StageKind, RgbaImage)>,
    },
    /// A stage body failed; the rest of the chain did not run.
    Failure(StageError),
}

/// A deferred command carrying everything needed to update the
/// interactive presentation for one page.
///
/// Constructed by the tail unit (or by the unit whose body failed) and
/// returned up the chain unchanged — intermediate units never inspect or
/// modify it. Delivery happens later, on the interactive context.
#[derive(Debug)]
pub struct ResultCommand {
    page_id: PageId,
    origin: StageKind,
    batch: bool,
    presentation: Presentation,
}

impl ResultCommand {
    /// A successful result produced by `origin` for the payload's page.
    #[must_use]
    pub fn page(origin: StageKind, batch: bool, payload: PagePayload) -> Self {
        Self {
            page_id: payload.info.id().clone(),
            origin,
            batch,
            presentation: Presentation::Page {
                image: payload.image,
                geometry: payload.geometry,
                trace: payload.trace,
            },
        }
    }

    /// A failure result produced by `origin` for `page_id`.
    #[must_use]
    pub fn failure(origin: StageKind, batch: bool, page_id: PageId, error: StageError) -> Self {
        Self {
            page_id,
            origin,
            batch,
            presentation: Presentation::Failure(error),
        }
    }

    /// The page this result belongs to. Results may arrive in any order;
    /// drivers match them to requests by this identity.
    #[must_use]
    pub const fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// The stage that produced the result.
    #[must_use]
    pub const fn origin(&self) -> StageKind {
        self.origin
    }

    /// Whether the originating chain was built for batch processing.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        self.batch
    }

    /// Whether this result carries a failure instead of an image.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self.presentation, Presentation::Failure(_))
    }

    /// The carried presentation.
    #[must_use]
    pub const fn presentation(&self) -> &Presentation {
        &self.presentation
    }

    /// Push this result to the interactive presentation.
    pub fn deliver(&self, host: &mut dyn PresentationHost) {
        match &self.presentation {
            Presentation::Page { image, .. } => host.show_page(&self.page_id, self.origin, image),
            Presentation::Failure(error) => host.show_failure(&self.page_id, self.origin, error),
        }
    }
}

/// Result of executing a processing chain for one page.
#[derive(Debug)]
pub enum ChainOutcome {
    /// The chain ran to its tail (or failed in a stage body); the command
    /// describes what to present.
    Finished(ResultCommand),
    /// Cancellation was observed at a stage boundary. No result; stores
    /// keep whatever completed stages wrote.
    Cancelled,
}

impl ChainOutcome {
    /// The result command, if the chain finished.
    #[must_use]
    pub const fn command(&self) -> Option<&ResultCommand> {
        match self {
            Self::Finished(command) => Some(command),
            Self::Cancelled => None,
        }
    }
}
