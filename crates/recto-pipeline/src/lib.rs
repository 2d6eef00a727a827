//! recto-pipeline: stage pipeline and cache-driven validity engine for
//! scanned page correction (sans-IO).
//!
//! Scanned pages move through a fixed sequence of correction stages:
//! orientation -> split -> deskew -> content -> margins -> output.
//! Every stage keeps per-page parameters in its own settings store, each
//! parameter set stamped with a snapshot of the upstream inputs it was
//! computed from.
//!
//! Two chain flavors run over that state:
//!
//! - a **processing chain** ([`Stages::processing_chain`]) executes stage
//!   bodies end to end on a worker, reusing stored parameters whose
//!   dependency snapshot still matches and recomputing the rest;
//! - a **validity chain** ([`Stages::validity_chain`]) answers "is this
//!   page stale" from settings alone, short-circuiting at the first
//!   non-valid stage. No pixels are touched, which is what makes whole-
//!   project cache scans cheap.
//!
//! This crate has **no I/O dependencies** — it operates on in-memory
//! images and structured settings documents. Image loading, worker
//! threads, and result delivery live in `recto-engine`.

pub mod chain;
pub mod defaults;
pub mod geometry;
pub mod ids;
pub mod order;
pub mod project;
pub mod stages;
pub mod store;
pub mod validity;

pub use chain::{
    CancellationToken, ChainOutcome, PageGeometry, PagePayload, Presentation, PresentationHost,
    ResultCommand, RgbaImage, StageError,
};
pub use defaults::DefaultBundles;
pub use geometry::{Alignment, Dimensions, Margins, Rect, Rotation};
pub use ids::{ImageId, PageId, PageInfo, Relinker, SubPage, source_fingerprint};
pub use order::{OrderOption, PageOrder};
pub use project::{Element, IdResolver, PageEnumerator, ProjectIndex};
pub use stages::{DetectionMode, STAGE_COUNT, StageKind, Stages};
pub use store::SettingsStore;
pub use validity::Validity;
